//! Hot-swap support
//!
//! - Staging of the canonical module into uniquely named copies
//! - Watching the plugins directory for new builds
//! - Loading staged copies as generations and retiring their predecessors

mod events;
mod generation;
mod loader;
mod manager;
mod store;
mod watcher;

pub use events::ReloadEvent;
pub use generation::{Generation, GenerationId, GenerationSlot, UnloadHook};
pub use loader::{ExecutionContext, ModuleLoader, NativeModuleLoader};
pub use manager::GenerationLoader;
pub use store::{CopyToken, ModuleImage, ModuleStore, StagedRetention};
pub use watcher::{ChangeWatcher, ReloadSignal, SignalHandler, SignalKind, WatchConfig, classify};
