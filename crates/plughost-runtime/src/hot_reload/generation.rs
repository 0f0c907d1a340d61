//! Loaded generations and the current-generation slot

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use plughost_kernel::StoreConnection;
use tracing::{debug, info};

use super::loader::ExecutionContext;
use super::store::ModuleImage;
use crate::error::InvocationError;

/// Monotonic generation identifier, starting at 1.
pub type GenerationId = u64;

/// Runs once, after a generation's execution context has been unloaded.
pub type UnloadHook = Box<dyn FnOnce(GenerationId, &ModuleImage) + Send + Sync>;

/// One loaded instance of the plugin.
///
/// Shared as `Arc<Generation>`: the slot holds one reference while the
/// generation is current, and every dispatched command holds another for the
/// duration of its invocation. The execution context is unloaded when the
/// last reference goes away, so a retired generation is never torn down
/// under a running command.
pub struct Generation {
    id: GenerationId,
    image: ModuleImage,
    context: Option<Box<dyn ExecutionContext>>,
    loaded_at: Instant,
    retiring: AtomicBool,
    in_flight: AtomicUsize,
    invocations: AtomicU64,
    on_unload: Option<UnloadHook>,
}

impl Generation {
    pub fn new(
        id: GenerationId,
        image: ModuleImage,
        context: Box<dyn ExecutionContext>,
        on_unload: Option<UnloadHook>,
    ) -> Self {
        Self {
            id,
            image,
            context: Some(context),
            loaded_at: Instant::now(),
            retiring: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            invocations: AtomicU64::new(0),
            on_unload,
        }
    }

    pub fn id(&self) -> GenerationId {
        self.id
    }

    pub fn image(&self) -> &ModuleImage {
        &self.image
    }

    /// Name reported by the resolved entry point.
    pub fn entry_name(&self) -> &str {
        self.context
            .as_ref()
            .map(|c| c.entry_point().name())
            .unwrap_or("<unloaded>")
    }

    pub fn age(&self) -> Duration {
        self.loaded_at.elapsed()
    }

    pub fn is_retiring(&self) -> bool {
        self.retiring.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_retiring(&self) {
        self.retiring.store(true, Ordering::SeqCst);
    }

    /// Invocations currently running against this generation.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Invocations started against this generation so far.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Run one command through the entry point.
    ///
    /// Blocks for as long as the plugin does. A panic inside the plugin is
    /// caught and reported as [`InvocationError::Panicked`].
    pub fn invoke(
        &self,
        conn: &mut dyn StoreConnection,
        command: &str,
    ) -> Result<String, InvocationError> {
        let Some(context) = self.context.as_ref() else {
            return Err(InvocationError::Aborted {
                command: command.to_string(),
                reason: format!("generation {} is unloaded", self.id),
            });
        };

        let _guard = InFlightGuard::enter(&self.in_flight);
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let entry = context.entry_point();

        match catch_unwind(AssertUnwindSafe(|| entry.invoke(conn, command))) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(InvocationError::Failed {
                command: command.to_string(),
                source,
            }),
            Err(payload) => Err(InvocationError::Panicked {
                command: command.to_string(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("staged", &self.image.staged_path())
            .field("retiring", &self.is_retiring())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        // Unload first; the hook may delete the staged file.
        drop(self.context.take());
        info!(
            "Generation {} unloaded after {} invocation(s)",
            self.id,
            self.invocations()
        );
        if let Some(hook) = self.on_unload.take() {
            hook(self.id, &self.image);
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "plugin panicked".to_string()
    }
}

/// Holds the current generation.
///
/// Readers take a cloned `Arc` and release the lock immediately, so the
/// lock is never held across an invocation.
#[derive(Default)]
pub struct GenerationSlot {
    current: RwLock<Option<Arc<Generation>>>,
}

impl GenerationSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<Generation>> {
        self.current.read().clone()
    }

    pub fn current_id(&self) -> Option<GenerationId> {
        self.current.read().as_ref().map(|g| g.id())
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().is_none()
    }

    /// Make `generation` current and hand back its predecessor.
    pub fn install(&self, generation: Arc<Generation>) -> Option<Arc<Generation>> {
        debug!("Installing generation {}", generation.id());
        self.current.write().replace(generation)
    }
}

impl fmt::Debug for GenerationSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationSlot")
            .field("current", &self.current_id())
            .finish()
    }
}
