//! Error types for the Retrova library.
//!
//! All fallible operations return [`Result`], whose error type is the
//! [`RetrovaError`] enum. Parameter problems are reported eagerly, before
//! any clustering or indexing work begins, so a failed call never leaves a
//! partially trained index behind.

use std::io;

use thiserror::Error;

/// The main error type for Retrova operations.
#[derive(Error, Debug)]
pub enum RetrovaError {
    /// Malformed train or search parameters, checked before expensive work.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Fewer training descriptors than the requested vocabulary demands.
    #[error("insufficient samples: need at least {needed}, got {available}")]
    InsufficientSamples { needed: usize, available: usize },

    /// Search was attempted on an index that has not been trained.
    #[error("index not trained")]
    IndexNotTrained,

    /// Operation is not valid in the current state (e.g. retraining a
    /// trained index).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Storage-related errors.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization format errors (bad magic, unsupported version, ...).
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for operations that may fail with [`RetrovaError`].
pub type Result<T> = std::result::Result<T, RetrovaError>;

impl RetrovaError {
    /// Create a new invalid-params error.
    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        RetrovaError::InvalidParams(msg.into())
    }

    /// Create a new invalid-operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        RetrovaError::InvalidOperation(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        RetrovaError::Storage(msg.into())
    }

    /// Create a new serialization error.
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        RetrovaError::Serialization(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = RetrovaError::invalid_params("result_count must be > 0");
        assert_eq!(
            error.to_string(),
            "invalid params: result_count must be > 0"
        );

        let error = RetrovaError::InsufficientSamples {
            needed: 512,
            available: 40,
        };
        assert_eq!(
            error.to_string(),
            "insufficient samples: need at least 512, got 40"
        );

        let error = RetrovaError::IndexNotTrained;
        assert_eq!(error.to_string(), "index not trained");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error = RetrovaError::from(io_error);

        match error {
            RetrovaError::Io(_) => {}
            _ => panic!("expected Io variant"),
        }
    }
}
