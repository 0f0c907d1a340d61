//! Error taxonomy of the host runtime
//!
//! Reload errors abort one reload attempt and leave the installed
//! generation serving. Connection and invocation errors abort one command.
//! Only [`HostError`] at startup is fatal.

use std::path::PathBuf;

use plughost_kernel::PluginError;
use plughost_kernel::config::ConfigError;

/// Why a reload attempt did not install a new generation.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    /// The canonical module file does not exist.
    #[error("module not found: {}", .0.display())]
    ModuleNotFound(PathBuf),

    /// Copying the canonical file to its staged location failed.
    #[error("I/O error while staging {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The module loaded but does not implement the plugin contract.
    #[error("plugin contract violated by {}: {reason}", .path.display())]
    PluginContract { path: PathBuf, reason: String },

    /// The execution context could not load the module at all.
    #[error("failed to load {}: {reason}", .path.display())]
    Load { path: PathBuf, reason: String },
}

impl ReloadError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            ReloadError::ModuleNotFound(path)
        } else {
            ReloadError::Io { path, source }
        }
    }

    pub fn contract(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ReloadError::PluginContract {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ReloadError::Load {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Staging failures, including a missing canonical file.
    pub fn is_io(&self) -> bool {
        matches!(self, ReloadError::ModuleNotFound(_) | ReloadError::Io { .. })
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, ReloadError::PluginContract { .. })
    }
}

/// The shared connection could not be opened or reopened.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection settings unavailable: {0}")]
    Settings(String),

    #[error("failed to open connection to {target}: {reason}")]
    Open { target: String, reason: String },

    #[error("timed out opening connection to {target} after {timeout_secs}s")]
    Timeout { target: String, timeout_secs: u64 },
}

/// The plugin's entry point failed while running one command.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("command '{command}' failed: {source}")]
    Failed {
        command: String,
        #[source]
        source: PluginError,
    },

    #[error("command '{command}' panicked: {message}")]
    Panicked { command: String, message: String },

    #[error("command '{command}' was aborted: {reason}")]
    Aborted { command: String, reason: String },
}

impl InvocationError {
    /// Underlying cause, as printed on the console's detail line.
    pub fn cause(&self) -> String {
        match self {
            InvocationError::Failed { source, .. } => source.to_string(),
            InvocationError::Panicked { message, .. } => message.clone(),
            InvocationError::Aborted { reason, .. } => reason.clone(),
        }
    }
}

/// Why a single command was not (successfully) executed.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No generation is installed; the command was not attempted.
    #[error("plugin not ready: {0}")]
    NotReady(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),
}

/// Startup failures of the host process.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// No ancestor directory contains the plugins directory.
    #[error("project root not found: no '{dir_name}' directory above {}", .searched_from.display())]
    LayoutNotFound {
        searched_from: PathBuf,
        dir_name: String,
    },

    #[error("settings error: {0}")]
    Settings(#[from] ConfigError),

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
