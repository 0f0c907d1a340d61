//! File system watcher for the canonical module
//!
//! Watches the plugins directory and turns creation and rename events for
//! the canonical file name into [`ReloadSignal`]s.
//!
//! The first change in a quiet period is delivered at once. Changes landing
//! inside the debounce window after it are folded into one trailing signal,
//! delivered when the window closes, so the newest file is never missed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind, RenameMode},
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Watch configuration
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Signals closer together than this are folded into one trailing signal
    pub debounce: Duration,
    /// Poll interval, for backends that poll
    pub poll_interval: Duration,
    /// Also treat in-place data writes as a change
    pub react_to_writes: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
            react_to_writes: false,
        }
    }
}

impl WatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_react_to_writes(mut self, react: bool) -> Self {
        self.react_to_writes = react;
        self
    }
}

/// What happened to the canonical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Created,
    Renamed,
    Written,
}

/// "The canonical module changed."
#[derive(Debug, Clone)]
pub struct ReloadSignal {
    pub kind: SignalKind,
    pub path: PathBuf,
    pub at: Instant,
}

/// Callback invoked for every accepted signal, on the watcher task.
pub type SignalHandler = Arc<dyn Fn(ReloadSignal) + Send + Sync>;

/// Map a raw notify event onto a signal for `file_name`, if it is one.
pub fn classify(
    event: &Event,
    file_name: &str,
    react_to_writes: bool,
) -> Option<(SignalKind, PathBuf)> {
    let matches = |p: &&PathBuf| p.file_name().is_some_and(|n| n == file_name);

    let (kind, candidates): (SignalKind, &[PathBuf]) = match event.kind {
        EventKind::Create(CreateKind::File | CreateKind::Any) => {
            (SignalKind::Created, event.paths.as_slice())
        }
        // `Both` carries [from, to]; only the destination matters.
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            (SignalKind::Renamed, event.paths.last().map(std::slice::from_ref)?)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Any)) => {
            (SignalKind::Renamed, event.paths.as_slice())
        }
        EventKind::Modify(ModifyKind::Data(_)) if react_to_writes => {
            (SignalKind::Written, event.paths.as_slice())
        }
        _ => return None,
    };

    candidates.iter().find(matches).map(|p| (kind, p.clone()))
}

/// Leading edge plus one trailing signal per window.
#[derive(Debug)]
struct Debouncer {
    window: Duration,
    last: Option<Instant>,
    deferred: Option<(SignalKind, PathBuf)>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last: None,
            deferred: None,
        }
    }

    /// Returns the signal to deliver now, or holds it for [`due`](Self::due).
    fn offer(
        &mut self,
        now: Instant,
        kind: SignalKind,
        path: PathBuf,
    ) -> Option<(SignalKind, PathBuf)> {
        match self.last {
            Some(last) if now.duration_since(last) < self.window => {
                self.deferred = Some((kind, path));
                None
            }
            _ => {
                self.last = Some(now);
                self.deferred = None;
                Some((kind, path))
            }
        }
    }

    /// When the held signal should go out.
    fn due(&self) -> Option<Instant> {
        match (&self.deferred, self.last) {
            (Some(_), Some(last)) => Some(last + self.window),
            _ => None,
        }
    }

    /// Release the held signal; it opens a new window.
    fn release(&mut self, now: Instant) -> Option<(SignalKind, PathBuf)> {
        let deferred = self.deferred.take()?;
        self.last = Some(now);
        Some(deferred)
    }
}

/// Watches one directory for one file name.
pub struct ChangeWatcher {
    config: WatchConfig,
    watcher: Option<RecommendedWatcher>,
    shutdown: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
    target: Option<PathBuf>,
}

impl ChangeWatcher {
    pub fn new(config: WatchConfig) -> Self {
        Self {
            config,
            watcher: None,
            shutdown: None,
            task: None,
            target: None,
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Start watching `directory` for `file_name`, calling `on_signal` for
    /// every accepted change.
    ///
    /// Any watch already running on this instance is stopped first. Must be
    /// called from within a tokio runtime.
    pub fn watch(
        &mut self,
        directory: &Path,
        file_name: &str,
        on_signal: SignalHandler,
    ) -> Result<(), notify::Error> {
        if self.is_running() {
            info!("Restarting file watcher");
            self.stop();
        }

        let (tx, mut rx) = mpsc::channel::<Event>(256);
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let _ = tx.blocking_send(event);
                }
                Err(e) => warn!("File watcher error: {}", e),
            },
            Config::default().with_poll_interval(self.config.poll_interval),
        )?;
        watcher.watch(directory, RecursiveMode::NonRecursive)?;

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let file_name = file_name.to_owned();
        let react_to_writes = self.config.react_to_writes;
        let mut debouncer = Debouncer::new(self.config.debounce);

        info!("Watching {:?} for {:?}", directory, file_name);
        let task = tokio::spawn(async move {
            let emit = |(kind, path): (SignalKind, PathBuf)| {
                debug!("Reload signal: {:?} {:?}", kind, path);
                on_signal(ReloadSignal {
                    kind,
                    path,
                    at: Instant::now(),
                });
            };

            loop {
                let due = debouncer.due();
                let wake = tokio::time::Instant::from_std(due.unwrap_or_else(Instant::now));
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("File watcher task shutting down");
                        return;
                    }
                    _ = tokio::time::sleep_until(wake), if due.is_some() => {
                        if let Some(signal) = debouncer.release(Instant::now()) {
                            emit(signal);
                        }
                    }
                    event = rx.recv() => {
                        let Some(event) = event else { return };
                        let Some((kind, path)) = classify(&event, &file_name, react_to_writes) else {
                            continue;
                        };
                        match debouncer.offer(Instant::now(), kind, path) {
                            Some(signal) => emit(signal),
                            None => debug!("Deferred {:?} event until the debounce window closes", kind),
                        }
                    }
                }
            }
        });

        self.watcher = Some(watcher);
        self.shutdown = Some(shutdown);
        self.task = Some(task);
        self.target = Some(directory.to_path_buf());
        Ok(())
    }

    /// Stop the current watch, if any.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.cancel();
        }
        // dropping the notify watcher closes the event channel
        self.watcher = None;
        self.task = None;
        if let Some(target) = self.target.take() {
            info!("Stopped watching {:?}", target);
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Directory currently watched.
    pub fn watched(&self) -> Option<&Path> {
        self.target.as_deref()
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
