//! plughost runtime
//!
//! Keeps a plugin module hot-swappable inside a long-running process:
//!
//! - [`hot_reload`]: staging, watching, loading and retiring generations
//! - [`dispatch`]: the serialized command loop
//! - [`connection`]: the shared store connection
//! - [`host`]: the context object wiring them together

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod hot_reload;
pub mod layout;
pub mod settings;

pub use connection::{ConnectionManager, Connector, SharedConnection, SqliteConnector};
pub use dispatch::{CommandDispatcher, CommandSource, Console, LineSource, LoopExit, LoopState};
pub use error::{ConnectionError, DispatchError, HostError, InvocationError, ReloadError};
pub use host::{HostBuilder, HostContext, READY_PROMPT, ReloadOutcome};
pub use hot_reload::{
    ChangeWatcher, Generation, GenerationId, GenerationLoader, ModuleImage, ModuleLoader,
    ModuleStore, NativeModuleLoader, ReloadEvent, StagedRetention,
};
pub use layout::HostLayout;
pub use settings::{DatabaseSettings, FileSettings, HostSettings, PluginSettings, SettingsSource};
