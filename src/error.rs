//! Error types for spatialdb operations

use thiserror::Error;

/// Main error type for cuboid storage and cutout operations
#[derive(Error, Debug)]
pub enum SpatialError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Type mismatch: channel is {expected}, payload is {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Payload too large: {requested} requested, limit is {limit}")]
    PayloadTooLarge { requested: String, limit: String },

    #[error("Corrupt payload for {context}: {reason}")]
    CorruptPayload { context: String, reason: String },

    #[error("Store unavailable ({context}): {reason}")]
    StoreUnavailable { context: String, reason: String },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Ingest job already in progress: {0}")]
    DuplicateJob(String),

    #[error("Ingest job not found: {0}")]
    JobNotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SpatialError {
    pub fn corrupt(context: impl Into<String>, reason: impl ToString) -> Self {
        SpatialError::CorruptPayload {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub fn unavailable(context: impl Into<String>, reason: impl ToString) -> Self {
        SpatialError::StoreUnavailable {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors caused by the request itself; retrying cannot help.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SpatialError::InvalidRange(_)
                | SpatialError::InvalidCoordinate(_)
                | SpatialError::TypeMismatch { .. }
                | SpatialError::PayloadTooLarge { .. }
                | SpatialError::DuplicateJob(_)
                | SpatialError::JobNotFound(_)
        )
    }

    /// Errors worth another attempt with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, SpatialError::StoreUnavailable { .. } | SpatialError::Io(_))
    }
}

/// Specialized Result type for spatialdb operations
pub type Result<T> = std::result::Result<T, SpatialError>;

impl From<bincode::Error> for SpatialError {
    fn from(err: bincode::Error) -> Self {
        SpatialError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for SpatialError {
    fn from(err: serde_json::Error) -> Self {
        SpatialError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(SpatialError::InvalidRange("x".into()).is_client_error());
        assert!(!SpatialError::InvalidRange("x".into()).is_transient());
        assert!(SpatialError::unavailable("cache", "down").is_transient());
        assert!(!SpatialError::corrupt("k", "bad").is_client_error());
        assert!(!SpatialError::corrupt("k", "bad").is_transient());
    }

    #[test]
    fn test_error_context_in_message() {
        let err = SpatialError::unavailable("cuboid c&e&ch&0&0&7", "timed out");
        assert!(err.to_string().contains("c&e&ch&0&0&7"));
    }
}
