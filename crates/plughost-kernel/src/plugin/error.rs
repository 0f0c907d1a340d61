//! Typed errors raised by plugin code.

use thiserror::Error;

use crate::storage::StoreError;

/// Errors a plugin entry point may return from `invoke`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginError {
    /// The command was understood but its arguments were malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Plugin execution failed for a reason of its own.
    #[error("Plugin execution failed: {0}")]
    ExecutionFailed(String),

    /// The backing store rejected an operation.
    #[error("Storage error: {source}")]
    Storage {
        #[from]
        source: StoreError,
    },

    /// An I/O error surfaced during a plugin operation.
    #[error("Plugin I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for errors that don't fit the above categories.
    #[error("{0}")]
    Other(String),
}

/// Result type for plugin entry points
pub type PluginResult<T> = Result<T, PluginError>;
