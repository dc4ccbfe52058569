//! Error types for mirror operations.

use std::io;
use thiserror::Error;

/// Errors that can occur while checking, synchronizing or serving the mirror.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// I/O error during file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// HTTP request error during a fetch.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    /// A fetch failed or returned a non-success status.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The manifest stream ended before all declared fields were read.
    #[error("Truncated manifest stream: still expecting {needed} byte(s) for {field}")]
    TruncatedStream { field: &'static str, needed: usize },

    /// The manifest was structurally invalid.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A blob the metadata says should be cached is missing and could not be restored.
    #[error("Storage inconsistency: {0}")]
    StorageInconsistency(String),

    /// The requested path was never part of the mirrored set.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage backend failure that is not plain I/O.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl MirrorError {
    /// Whether a whole synchronization attempt may be retried after this error.
    pub fn is_transport(&self) -> bool {
        matches!(self, MirrorError::Transport(_) | MirrorError::ReqwestError(_))
    }

    /// Whether the error came from a malformed or truncated manifest.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            MirrorError::TruncatedStream { .. } | MirrorError::Protocol(_)
        )
    }
}

/// Result type for mirror operations.
pub type MirrorResult<T> = std::result::Result<T, MirrorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(MirrorError::Transport("HTTP 503".to_string()).is_transport());
        assert!(!MirrorError::NotFound("x".to_string()).is_transport());

        let truncated = MirrorError::TruncatedStream {
            field: "url",
            needed: 3,
        };
        assert!(truncated.is_protocol());
        assert_eq!(
            truncated.to_string(),
            "Truncated manifest stream: still expecting 3 byte(s) for url"
        );
    }
}
