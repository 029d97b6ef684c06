//! Error types for tracker operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Wire format error: {0}")]
    Proto(#[from] replicat_proto::ProtoError),

    #[error("Gave up after {attempts} attempts: {op} {path}")]
    RetriesExhausted {
        op: &'static str,
        path: String,
        attempts: usize,
    },

    #[error("Tracker root unusable: {0}")]
    BadRoot(String),
}

pub type Result<T> = std::result::Result<T, TrackerError>;
