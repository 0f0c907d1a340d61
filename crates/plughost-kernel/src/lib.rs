//! plughost kernel
//!
//! The contract shared between the host process and hot-swappable plugins:
//! the entry-point capability, the storage handle lent to it, and the
//! configuration helpers both sides use.

// plugin contract
pub mod plugin;
pub use plugin::{EntryHandle, PluginEntryPoint, PluginError, PluginResult, PLUGIN_API_VERSION};

// storage contract
pub mod storage;
pub use storage::{Row, SqlValue, StoreConnection, StoreError};

// configuration loading
pub mod config;
