//! A module loader driven by the staged file's text
//!
//! Instead of a real shared library, each "module" is a small text file.
//! Its first line decides what loading it produces:
//!
//! | content          | result                                               |
//! |------------------|------------------------------------------------------|
//! | `echo:<tag>`     | entry point answering `<tag>:<command>`              |
//! | `blocking:<tag>` | like `echo`, but each call waits for the call gate   |
//! | `slow:<tag>`     | like `echo`, but loading waits for the load gate     |
//! | `fail`           | entry point returning a `PluginError` for every call |
//! | `panic`          | entry point that panics                              |
//! | `no-entry`       | plugin contract violation                            |
//! | anything else    | load error                                           |

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};
use plughost_kernel::{PluginEntryPoint, PluginError, PluginResult, StoreConnection};
use plughost_runtime::hot_reload::ExecutionContext;
use plughost_runtime::{ModuleImage, ModuleLoader, ReloadError};

/// A latch that blocking threads wait on until a test opens it.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
    waiting: AtomicUsize,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.changed.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// Threads currently blocked on the gate.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    fn pass(&self) {
        let mut open = self.open.lock();
        if *open {
            return;
        }
        self.waiting.fetch_add(1, Ordering::SeqCst);
        while !*open {
            self.changed.wait(&mut open);
        }
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// [`ModuleLoader`] that interprets staged text files.
pub struct ScriptedModuleLoader {
    loads: AtomicUsize,
    live: Arc<AtomicUsize>,
    call_gate: Arc<Gate>,
    load_gate: Arc<Gate>,
    staged: Mutex<Vec<PathBuf>>,
}

impl ScriptedModuleLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            call_gate: Gate::new(),
            load_gate: Gate::new(),
            staged: Mutex::new(Vec::new()),
        })
    }

    /// Load attempts so far, successful or not.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Contexts loaded and not yet dropped.
    pub fn live_contexts(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Staged paths handed to `load`, in order.
    pub fn staged_paths(&self) -> Vec<PathBuf> {
        self.staged.lock().clone()
    }

    /// Gate held by `blocking:` entry points.
    pub fn call_gate(&self) -> &Arc<Gate> {
        &self.call_gate
    }

    /// Gate held by `slow:` modules while loading.
    pub fn load_gate(&self) -> &Arc<Gate> {
        &self.load_gate
    }

    fn context(&self, image: &ModuleImage, entry: Box<dyn PluginEntryPoint>) -> Box<dyn ExecutionContext> {
        self.live.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedContext {
            origin: image.staged_path().to_path_buf(),
            entry,
            live: self.live.clone(),
        })
    }
}

impl ModuleLoader for ScriptedModuleLoader {
    fn load(&self, image: &ModuleImage) -> Result<Box<dyn ExecutionContext>, ReloadError> {
        let path = image.staged_path();
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.staged.lock().push(path.to_path_buf());

        let text = fs::read_to_string(path).map_err(|e| ReloadError::load(path, e.to_string()))?;
        let script = text.lines().next().unwrap_or_default().trim();

        let entry: Box<dyn PluginEntryPoint> = match script.split_once(':') {
            Some(("echo", tag)) => Box::new(Echo::new(tag, None)),
            Some(("blocking", tag)) => Box::new(Echo::new(tag, Some(self.call_gate.clone()))),
            Some(("slow", tag)) => {
                self.load_gate.pass();
                Box::new(Echo::new(tag, None))
            }
            _ => match script {
                "fail" => Box::new(Failing),
                "panic" => Box::new(Panicking),
                "no-entry" => {
                    return Err(ReloadError::contract(path, "plughost_entry_create not exported"));
                }
                other => return Err(ReloadError::load(path, format!("not a module: {other:?}"))),
            },
        };
        Ok(self.context(image, entry))
    }
}

struct ScriptedContext {
    origin: PathBuf,
    entry: Box<dyn PluginEntryPoint>,
    live: Arc<AtomicUsize>,
}

impl ExecutionContext for ScriptedContext {
    fn entry_point(&self) -> &dyn PluginEntryPoint {
        self.entry.as_ref()
    }

    fn origin(&self) -> &Path {
        &self.origin
    }
}

impl Drop for ScriptedContext {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Echo {
    tag: String,
    gate: Option<Arc<Gate>>,
}

impl Echo {
    fn new(tag: &str, gate: Option<Arc<Gate>>) -> Self {
        Self {
            tag: tag.to_string(),
            gate,
        }
    }
}

impl PluginEntryPoint for Echo {
    fn name(&self) -> &str {
        &self.tag
    }

    fn invoke(&self, conn: &mut dyn StoreConnection, command: &str) -> PluginResult<String> {
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        conn.execute(command, &[])?;
        Ok(format!("{}:{}", self.tag, command))
    }
}

struct Failing;

impl PluginEntryPoint for Failing {
    fn name(&self) -> &str {
        "fail"
    }

    fn invoke(&self, _conn: &mut dyn StoreConnection, _command: &str) -> PluginResult<String> {
        Err(PluginError::ExecutionFailed("scripted failure".to_string()))
    }
}

struct Panicking;

impl PluginEntryPoint for Panicking {
    fn name(&self) -> &str {
        "panic"
    }

    fn invoke(&self, _conn: &mut dyn StoreConnection, command: &str) -> PluginResult<String> {
        panic!("plugin blew up on '{command}'")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use plughost_runtime::{ModuleStore, StagedRetention};

    use super::*;
    use crate::connection::MockConnection;

    fn stage(content: &str) -> (tempfile::TempDir, ModuleImage) {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().join("module.plugin");
        fs::write(&canonical, content).unwrap();
        let image = ModuleStore::new(StagedRetention::KeepAll)
            .stage(&canonical)
            .unwrap();
        (dir, image)
    }

    #[test]
    fn test_echo_module_answers_with_its_tag() {
        let loader = ScriptedModuleLoader::new();
        let (_dir, image) = stage("echo:v1\n");

        let context = loader.load(&image).unwrap();
        let mut conn = MockConnection::new();
        let out = context.entry_point().invoke(&mut conn, "list").unwrap();

        assert_eq!(out, "v1:list");
        assert_eq!(context.origin(), image.staged_path());
        assert_eq!(loader.live_contexts(), 1);
        drop(context);
        assert_eq!(loader.live_contexts(), 0);
    }

    #[test]
    fn test_failure_scripts() {
        let loader = ScriptedModuleLoader::new();

        let (_a, missing) = stage("no-entry");
        let Err(err) = loader.load(&missing) else {
            panic!("no-entry must not load");
        };
        assert!(err.is_contract_violation());

        let (_b, garbage) = stage("\x7fELF garbage");
        let Err(err) = loader.load(&garbage) else {
            panic!("garbage must not load");
        };
        assert!(matches!(err, ReloadError::Load { .. }));

        assert_eq!(loader.loads(), 2);
        assert_eq!(loader.live_contexts(), 0);
    }

    #[test]
    fn test_gate_releases_waiters() {
        let gate = Gate::new();
        let waiter = {
            let gate = gate.clone();
            std::thread::spawn(move || gate.pass())
        };
        while gate.waiting() == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        gate.open();
        waiter.join().unwrap();
        assert!(gate.is_open());
        assert_eq!(gate.waiting(), 0);
    }
}
