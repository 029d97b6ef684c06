//! Error types for wire encoding and decoding

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
