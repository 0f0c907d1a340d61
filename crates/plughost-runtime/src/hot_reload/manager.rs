//! Generation loading and retirement
//!
//! [`GenerationLoader`] drives one reload: stage the canonical module, load
//! the staged copy, install the result as current, retire the predecessor.
//! It is not reentrant by itself; callers serialize reloads (see
//! [`HostContext`](crate::host::HostContext)).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::events::ReloadEvent;
use super::generation::{Generation, GenerationId, GenerationSlot, UnloadHook};
use super::loader::ModuleLoader;
use super::store::ModuleStore;
use crate::error::ReloadError;

/// Produces generations from the canonical module and swaps them into a
/// [`GenerationSlot`].
pub struct GenerationLoader {
    canonical: PathBuf,
    store: ModuleStore,
    loader: Arc<dyn ModuleLoader>,
    slot: Arc<GenerationSlot>,
    next_id: AtomicU64,
    events: broadcast::Sender<ReloadEvent>,
    retired: Mutex<Vec<Weak<Generation>>>,
}

impl GenerationLoader {
    pub fn new(
        canonical: impl Into<PathBuf>,
        store: ModuleStore,
        loader: Arc<dyn ModuleLoader>,
        slot: Arc<GenerationSlot>,
        events: broadcast::Sender<ReloadEvent>,
    ) -> Self {
        Self {
            canonical: canonical.into(),
            store,
            loader,
            slot,
            next_id: AtomicU64::new(1),
            events,
            retired: Mutex::new(Vec::new()),
        }
    }

    pub fn canonical_path(&self) -> &Path {
        &self.canonical
    }

    pub fn store(&self) -> &ModuleStore {
        &self.store
    }

    pub fn slot(&self) -> &Arc<GenerationSlot> {
        &self.slot
    }

    /// Remove staged copies left behind by earlier processes.
    pub fn purge_stale(&self) -> std::io::Result<usize> {
        self.store.purge_stale(&self.canonical)
    }

    /// Load the canonical module as a new generation and make it current.
    ///
    /// On error nothing is installed and the previous generation, if any,
    /// keeps serving. The previous generation is retired only after the new
    /// one has loaded and resolved its entry point.
    pub fn reload(&self) -> Result<Arc<Generation>, ReloadError> {
        let started = Instant::now();
        self.emit(ReloadEvent::ReloadStarted {
            path: self.canonical.clone(),
        });

        match self.load_next() {
            Ok(generation) => {
                let duration = started.elapsed();
                info!(
                    "Generation {} ({}) loaded from {:?} in {:?}",
                    generation.id(),
                    generation.entry_name(),
                    generation.image().staged_path(),
                    duration
                );
                self.emit(ReloadEvent::ReloadCompleted {
                    generation: generation.id(),
                    staged_path: generation.image().staged_path().to_path_buf(),
                    duration,
                });

                if let Some(previous) = self.slot.install(generation.clone()) {
                    self.retire(previous);
                }
                Ok(generation)
            }
            Err(e) => {
                error!("Reload of {:?} failed: {}", self.canonical, e);
                self.emit(ReloadEvent::ReloadFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn load_next(&self) -> Result<Arc<Generation>, ReloadError> {
        let image = self.store.stage(&self.canonical)?;

        let context = match self.loader.load(&image) {
            Ok(context) => context,
            Err(e) => {
                self.store.release(&image);
                return Err(e);
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(Generation::new(
            id,
            image,
            context,
            Some(self.unload_hook()),
        )))
    }

    fn unload_hook(&self) -> UnloadHook {
        let store = self.store.clone();
        let events = self.events.clone();
        Box::new(move |id, image| {
            store.release(image);
            let _ = events.send(ReloadEvent::GenerationUnloaded { generation: id });
        })
    }

    fn retire(&self, previous: Arc<Generation>) {
        previous.mark_retiring();
        let in_flight = previous.in_flight();
        if in_flight > 0 {
            warn!(
                "Generation {} retired with {} invocation(s) in flight; unloading when they finish",
                previous.id(),
                in_flight
            );
        } else {
            info!("Generation {} retired", previous.id());
        }
        self.emit(ReloadEvent::GenerationRetired {
            generation: previous.id(),
            in_flight,
        });

        let mut retired = self.retired.lock();
        retired.retain(|g| g.strong_count() > 0);
        retired.push(Arc::downgrade(&previous));
        // `previous` drops here; the context unloads now unless a command
        // still holds it.
    }

    /// Ids of retired generations whose context has not been unloaded yet.
    pub fn retiring(&self) -> Vec<GenerationId> {
        let mut retired = self.retired.lock();
        retired.retain(|g| g.strong_count() > 0);
        retired
            .iter()
            .filter_map(Weak::upgrade)
            .map(|g| g.id())
            .collect()
    }

    fn emit(&self, event: ReloadEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}
