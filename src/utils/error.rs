use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Path is not in the library: {0}")]
    NotInLibrary(String),

    #[error("Path is outside the library root: {0}")]
    OutsideLibrary(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Unknown file: {0}")]
    UnknownFile(Uuid),

    #[error("Inconsistent layout announced for file {0}: {1}")]
    InvalidLayout(Uuid, String),

    #[error("Download in progress for file {0}")]
    DownloadInProgress(Uuid),

    #[error("Library is locked by {0}")]
    LibraryLocked(String),

    #[error("Library lock timed out: {0}")]
    LockTimeout(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationError(err.to_string())
    }
}
