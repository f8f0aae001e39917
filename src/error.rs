//! Error types for the layered cache
//!
//! Provides unified error handling using thiserror.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for every cache tier.
///
/// Absence is never an error: lookups return `Ok(None)` for missing keys.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A read or write against the index/data file pair failed
    #[error("I/O error while {operation} {}: {source}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The on-disk files do not match the expected layout
    #[error("Corrupted cache file: {0}")]
    Corrupted(String),

    /// The tier cannot perform the requested operation
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The tier has not been initialized or was already destroyed
    #[error("Cache is closed")]
    Closed,

    /// A background task was requested outside of a Tokio runtime
    #[error("No Tokio runtime available to spawn background tasks")]
    NoRuntime,

    /// A blocking file task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Configuration could not be read or parsed
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CacheError {
    /// Wraps an `io::Error` with the operation and file it happened on.
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        CacheError::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mentions_path_and_operation() {
        let err = CacheError::io(
            "reading",
            "/tmp/cache.idx",
            io::Error::new(io::ErrorKind::UnexpectedEof, "short read"),
        );
        let message = err.to_string();
        assert!(message.contains("reading"));
        assert!(message.contains("/tmp/cache.idx"));
        assert!(message.contains("short read"));
    }

    #[test]
    fn test_io_error_exposes_source() {
        use std::error::Error as _;

        let err = CacheError::io("opening", "x", io::Error::from(io::ErrorKind::NotFound));
        assert!(err.source().is_some());
    }
}
