use std::fmt;

#[derive(Debug)]
pub enum SyncError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
    /// The unit inventory (or a remote-side listing it depends on) could not be obtained.
    SourceUnavailable(String),
    /// A single item or unit failed to transfer.
    Transfer(String),
    Remote(String),
    Config(String),
    Other(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Io(e) => write!(f, "IO error: {}", e),
            SyncError::Serialization(e) => write!(f, "Serialization error: {}", e),
            SyncError::SourceUnavailable(e) => write!(f, "Source unavailable: {}", e),
            SyncError::Transfer(e) => write!(f, "Transfer failure: {}", e),
            SyncError::Remote(e) => write!(f, "Remote error: {}", e),
            SyncError::Config(e) => write!(f, "Config error: {}", e),
            SyncError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err)
    }
}

impl From<String> for SyncError {
    fn from(err: String) -> Self {
        SyncError::Other(err)
    }
}

impl From<&str> for SyncError {
    fn from(err: &str) -> Self {
        SyncError::Other(err.to_string())
    }
}
