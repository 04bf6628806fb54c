use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Invalid cluster info: {0}")]
    InvalidClusterInfo(String),

    #[error("Unknown state: {0}")]
    UnknownState(u8),

    #[error("Invalid log position: expected 4 bytes, got {0}")]
    InvalidLogPosition(usize),

    #[error("Invalid transport url: {0}")]
    InvalidTransportUrl(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Node is closed")]
    Closed,

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for RaftError {
    fn from(err: serde_json::Error) -> Self {
        RaftError::SerializationError(err.to_string())
    }
}
