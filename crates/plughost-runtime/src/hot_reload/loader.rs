//! Dynamic module loading
//!
//! Loads a staged module image into its own execution context and resolves
//! the plugin entry point once. Dropping the context destroys the entry
//! point object and then unloads the library.

use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use libloading::Library;
use plughost_kernel::PluginEntryPoint;
use plughost_kernel::plugin::{
    API_VERSION_SYMBOL, ApiVersionFn, CREATE_SYMBOL, CreateFn, DESTROY_SYMBOL, DestroyFn,
    EntryHandle, PLUGIN_API_VERSION,
};
use tracing::{debug, info};

use super::store::ModuleImage;
use crate::error::ReloadError;

/// An isolated, unloadable unit holding one loaded module image.
pub trait ExecutionContext: Send + Sync {
    /// The entry point resolved at load time.
    fn entry_point(&self) -> &dyn PluginEntryPoint;

    /// Where the loaded code came from, for diagnostics.
    fn origin(&self) -> &Path;
}

/// Turns a staged image into an [`ExecutionContext`].
pub trait ModuleLoader: Send + Sync {
    fn load(&self, image: &ModuleImage) -> Result<Box<dyn ExecutionContext>, ReloadError>;
}

/// Loads modules as native dynamic libraries.
#[derive(Debug, Clone)]
pub struct NativeModuleLoader {
    api_version: u32,
}

impl NativeModuleLoader {
    pub fn new() -> Self {
        Self {
            api_version: PLUGIN_API_VERSION,
        }
    }

    /// Expect a contract version other than the one this host was built with.
    pub fn with_api_version(mut self, api_version: u32) -> Self {
        self.api_version = api_version;
        self
    }
}

impl Default for NativeModuleLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleLoader for NativeModuleLoader {
    fn load(&self, image: &ModuleImage) -> Result<Box<dyn ExecutionContext>, ReloadError> {
        let path = image.staged_path();
        info!("Loading plugin library: {:?}", path);

        // SAFETY: loading runs the library's initialisers. Plugins are trusted
        // code built against the same kernel crate; isolation here is about
        // lifecycle, not security.
        let library = unsafe { Library::new(path) }
            .map_err(|e| ReloadError::load(path, e.to_string()))?;

        // SAFETY: each symbol is looked up with the signature the kernel
        // contract assigns to it.
        let (api_version, create, destroy) = unsafe {
            let version: ApiVersionFn = *library
                .get::<ApiVersionFn>(API_VERSION_SYMBOL)
                .map_err(|e| missing_symbol(path, API_VERSION_SYMBOL, e))?;
            let create: CreateFn = *library
                .get::<CreateFn>(CREATE_SYMBOL)
                .map_err(|e| missing_symbol(path, CREATE_SYMBOL, e))?;
            let destroy: DestroyFn = *library
                .get::<DestroyFn>(DESTROY_SYMBOL)
                .map_err(|e| missing_symbol(path, DESTROY_SYMBOL, e))?;
            (version(), create, destroy)
        };

        if api_version != self.api_version {
            return Err(ReloadError::contract(
                path,
                format!(
                    "API version mismatch: expected {}, got {}",
                    self.api_version, api_version
                ),
            ));
        }

        // SAFETY: `create` is the contract constructor resolved above.
        let raw = unsafe { create() };
        let handle = NonNull::new(raw)
            .ok_or_else(|| ReloadError::contract(path, "entry point constructor returned null"))?;

        let context = NativeContext {
            path: path.to_path_buf(),
            handle,
            destroy,
            _library: library,
        };
        let entry = context.entry_point();
        info!(
            "Resolved entry point: {} v{} from {:?}",
            entry.name(),
            entry.version(),
            path
        );

        Ok(Box::new(context))
    }
}

fn missing_symbol(path: &Path, symbol: &[u8], err: libloading::Error) -> ReloadError {
    let name = String::from_utf8_lossy(symbol.strip_suffix(b"\0").unwrap_or(symbol)).into_owned();
    ReloadError::contract(path, format!("missing symbol '{name}': {err}"))
}

/// A loaded native library plus the entry point object it created.
struct NativeContext {
    path: PathBuf,
    handle: NonNull<EntryHandle>,
    destroy: DestroyFn,
    // Declared last: fields drop in order, and the library must outlive
    // everything that points into it. Never read, only held.
    _library: Library,
}

// SAFETY: the handle owns a `Box<dyn PluginEntryPoint>`, which is `Send + Sync`
// by the trait's bounds; the library handle itself is thread-safe.
unsafe impl Send for NativeContext {}
unsafe impl Sync for NativeContext {}

impl ExecutionContext for NativeContext {
    fn entry_point(&self) -> &dyn PluginEntryPoint {
        // SAFETY: the handle stays valid until `drop` hands it back to the library.
        unsafe { self.handle.as_ref().0.as_ref() }
    }

    fn origin(&self) -> &Path {
        &self.path
    }
}

impl Drop for NativeContext {
    fn drop(&mut self) {
        debug!("Destroying entry point and unloading {:?}", self.path);
        // SAFETY: the handle came from this library's constructor and is
        // released exactly once, before the library itself is unloaded.
        unsafe { (self.destroy)(self.handle.as_ptr()) };
    }
}
