//! Error taxonomy shared by every publisher, subscriber and stage.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias for streaming operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors delivered through `on_error` or through a [`Completion`](crate::Completion).
///
/// The type is `Clone` so a single failure can be fanned out to several
/// subscribers and pending futures. I/O errors are shared behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// A subscriber requested a non-positive amount of items.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// The streaming contract was violated (double subscribe, send after complete, ...).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The body cannot be replayed; the operation must not be retried as-is.
    #[error("non-retryable: {0}")]
    NonRetryable(String),

    /// Local data changed or was corrupted while it was being streamed.
    #[error("data integrity failure: {0}")]
    DataIntegrity(String),

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The subscription was cancelled before the signal could be delivered.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("client error: {0}")]
    Client(String),

    /// A user-supplied callback (compressor, consumer, ...) failed.
    #[error("callback failed: {0}")]
    Callback(String),
}

impl StreamError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub fn illegal_demand(n: u64) -> Self {
        Self::IllegalArgument(format!(
            "a downstream subscriber requested an invalid amount of data: {n}"
        ))
    }

    /// Whether repeating the same operation could plausibly succeed.
    ///
    /// Integrity failures on a still-changing local file need user
    /// intervention, and non-retryable bodies cannot be replayed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Cancelled(_))
    }

    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::DataIntegrity(_))
    }
}

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("split buffer_size ({buffer_size}) must be at least part_size ({part_size})")]
    BufferTooSmall { buffer_size: u64, part_size: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_display_includes_path() {
        let err = StreamError::io(
            "/tmp/data.bin",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert_eq!(format!("{err}"), "i/o error on /tmp/data.bin: missing");
        assert!(err.is_retryable());
    }

    #[test]
    fn integrity_failures_are_not_retryable() {
        let err = StreamError::DataIntegrity("mtime changed".into());
        assert!(err.is_integrity_failure());
        assert!(!err.is_retryable());
        assert!(!StreamError::NonRetryable("consumed".into()).is_retryable());
    }

    #[test]
    fn error_is_clone_and_std_error() {
        let err = StreamError::illegal_demand(0);
        let cloned = err.clone();
        let _: &dyn std::error::Error = &cloned;
        assert!(format!("{err}").contains("invalid amount of data: 0"));
    }
}
