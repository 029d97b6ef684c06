use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Net(#[from] replicat_net::NetError),

    #[error("tracker error: {0}")]
    Tracker(#[from] replicat_tracker::TrackerError),

    #[error("config file error: {0}")]
    ConfigFile(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
