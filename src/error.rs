#[derive(Debug, thiserror::Error)]
pub enum SpeedwatchError {
    #[error("A speed test is already running")]
    AlreadyRunning,

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Import failed: {0}")]
    Import(String),
}

pub type Result<T> = std::result::Result<T, SpeedwatchError>;
