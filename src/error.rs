//! Error types for sitepool.

use crate::types::{PageId, ProcessId, ProcessRole};
use std::time::Duration;
use thiserror::Error;

/// Main error type for the process pool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Failed to launch worker: {0}")]
    Launch(String),

    #[error("Could not launch a {role} worker after {attempts} attempts")]
    LaunchFailed { role: ProcessRole, attempts: usize },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Connection to {0} is closed")]
    ChannelClosed(ProcessId),

    #[error("Synchronous message '{name}' timed out after {timeout:?}")]
    SyncTimeout { name: String, timeout: Duration },

    #[error("Unknown process {0}")]
    UnknownProcess(ProcessId),

    #[error("Unknown page {0}")]
    UnknownPage(PageId),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_launch_failed_message() {
        let err = PoolError::LaunchFailed {
            role: ProcessRole::Content,
            attempts: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("content"));
        assert!(msg.contains("2 attempts"));
    }

    #[test]
    fn test_sync_timeout_message() {
        let err = PoolError::SyncTimeout {
            name: "SetCacheModel".to_string(),
            timeout: Duration::from_millis(250),
        };
        let msg = err.to_string();
        assert!(msg.contains("SetCacheModel"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn test_channel_closed_message() {
        let err = PoolError::ChannelClosed(ProcessId(3));
        assert_eq!(err.to_string(), "Connection to process-3 is closed");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: PoolError = io_err.into();
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err: PoolError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }

    #[test]
    fn test_url_error_conversion() {
        let url_err = url::Url::parse("not a url").unwrap_err();
        let err: PoolError = url_err.into();
        assert!(err.to_string().starts_with("Invalid URL"));
    }
}
