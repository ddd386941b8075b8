//! Error types for idxstore operations

use thiserror::Error;

/// Main error type for dataset operations
#[derive(Error, Debug)]
pub enum IdxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Duplicate field: {0}")]
    DuplicateField(String),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Dataset already locked for writing: {0}")]
    AlreadyLocked(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Read failure: {0}")]
    ReadFailure(String),

    #[error("Write error: {0}")]
    WriteError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u16),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid query state: {0}")]
    InvalidState(String),

    #[error("Aborted")]
    Aborted,
}

impl IdxError {
    /// True for the "block/object does not exist" case, which queries recover from.
    pub fn is_not_found(&self) -> bool {
        match self {
            IdxError::NotFound(_) => true,
            IdxError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Specialized Result type for dataset operations
pub type Result<T> = std::result::Result<T, IdxError>;

impl From<bincode::Error> for IdxError {
    fn from(err: bincode::Error) -> Self {
        IdxError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for IdxError {
    fn from(err: serde_json::Error) -> Self {
        IdxError::ParseError(err.to_string())
    }
}

#[cfg(feature = "http-client")]
impl From<reqwest::Error> for IdxError {
    fn from(err: reqwest::Error) -> Self {
        IdxError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        assert!(IdxError::NotFound("x".into()).is_not_found());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(IdxError::Io(io).is_not_found());
        assert!(!IdxError::ReadFailure("bad crc".into()).is_not_found());
    }
}
