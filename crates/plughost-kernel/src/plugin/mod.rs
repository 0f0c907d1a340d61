//! Plugin contract
//!
//! A plugin is a dynamic library exporting three well-known symbols:
//!
//! - [`API_VERSION_SYMBOL`]: `extern "C" fn() -> u32`, must equal [`PLUGIN_API_VERSION`]
//! - [`CREATE_SYMBOL`]: `extern "C" fn() -> *mut EntryHandle`
//! - [`DESTROY_SYMBOL`]: `extern "C" fn(*mut EntryHandle)`
//!
//! The [`declare_entry_point!`](crate::declare_entry_point) macro generates all
//! three for a type implementing [`PluginEntryPoint`]. The host resolves them
//! once at load time and keeps the resulting trait object for the lifetime
//! of the loaded library.

mod error;

pub use error::{PluginError, PluginResult};

use crate::storage::StoreConnection;

/// Version of the binary contract between host and plugin.
pub const PLUGIN_API_VERSION: u32 = 1;

/// Symbol returning the plugin's contract version.
pub const API_VERSION_SYMBOL: &[u8] = b"plughost_api_version\0";
/// Symbol constructing the entry point object.
pub const CREATE_SYMBOL: &[u8] = b"plughost_entry_create\0";
/// Symbol destroying an entry point object created by [`CREATE_SYMBOL`].
pub const DESTROY_SYMBOL: &[u8] = b"plughost_entry_destroy\0";

/// The capability a plugin exposes to the host.
///
/// `invoke` runs one console command against the shared connection and
/// returns the text to print. Errors are reported by the host and never stop
/// the command loop.
pub trait PluginEntryPoint: Send + Sync {
    /// Short plugin name, used in logs.
    fn name(&self) -> &str;

    /// Plugin build version, used in logs.
    fn version(&self) -> &str {
        "0.0.0"
    }

    /// Execute a single command.
    fn invoke(&self, conn: &mut dyn StoreConnection, command: &str) -> PluginResult<String>;
}

/// Thin, FFI-safe wrapper around a boxed entry point.
///
/// `Box<dyn PluginEntryPoint>` is a fat pointer; boxing it once more gives the
/// exported constructor a plain pointer to hand across the boundary.
pub struct EntryHandle(pub Box<dyn PluginEntryPoint>);

/// Signature of [`API_VERSION_SYMBOL`].
pub type ApiVersionFn = unsafe extern "C" fn() -> u32;
/// Signature of [`CREATE_SYMBOL`].
pub type CreateFn = unsafe extern "C" fn() -> *mut EntryHandle;
/// Signature of [`DESTROY_SYMBOL`].
pub type DestroyFn = unsafe extern "C" fn(*mut EntryHandle);

/// Export a [`PluginEntryPoint`] implementation from a `cdylib`.
///
/// ```rust,ignore
/// struct Echo;
/// impl PluginEntryPoint for Echo { /* ... */ }
/// plughost_kernel::declare_entry_point!(Echo, Echo);
/// ```
#[macro_export]
macro_rules! declare_entry_point {
    ($plugin_type:ty, $create_fn:expr) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn plughost_api_version() -> u32 {
            $crate::plugin::PLUGIN_API_VERSION
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn plughost_entry_create() -> *mut $crate::plugin::EntryHandle {
            let plugin: $plugin_type = $create_fn;
            let handle = $crate::plugin::EntryHandle(Box::new(plugin));
            Box::into_raw(Box::new(handle))
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn plughost_entry_destroy(handle: *mut $crate::plugin::EntryHandle) {
            if !handle.is_null() {
                // SAFETY: `handle` was produced by `plughost_entry_create` in this library.
                unsafe {
                    drop(Box::from_raw(handle));
                }
            }
        }
    };
}
