use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Proto(#[from] replicat_proto::ProtoError),

    #[error("tracker error: {0}")]
    Tracker(#[from] replicat_tracker::TrackerError),

    #[error("peer {0} returned status {1}")]
    PeerStatus(String, u16),

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("malformed credentials, expected user:password")]
    BadCredentials,
}

pub type Result<T> = std::result::Result<T, NetError>;
