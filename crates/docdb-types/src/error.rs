//! Error types shared across the docdb crates.

use thiserror::Error;

/// Errors raised by the shared types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed etag
    #[error("Invalid etag: {0}")]
    InvalidEtag(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TypesError::Config("bad value".to_string());
        assert_eq!(err.to_string(), "Configuration error: bad value");

        let err = TypesError::InvalidEtag("xyz".to_string());
        assert_eq!(err.to_string(), "Invalid etag: xyz");
    }
}
