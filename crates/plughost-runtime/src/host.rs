//! The long-lived host context
//!
//! [`HostContext`] ties the pieces together: the watcher's signals drive
//! reloads, each successful reload restarts the dispatcher loop, and both
//! paths share the connection manager and the current-generation slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionManager, Connector, SqliteConnector};
use crate::dispatch::{
    CommandDispatcher, CommandSource, Console, DispatchLoop, LoopState, SharedSource, stdin,
};
use crate::error::{HostError, ReloadError};
use crate::hot_reload::{
    ChangeWatcher, Generation, GenerationId, GenerationLoader, GenerationSlot, ModuleLoader,
    ModuleStore, NativeModuleLoader, ReloadEvent, ReloadSignal, SignalHandler, StagedRetention,
    WatchConfig,
};
use crate::layout::HostLayout;
use crate::settings::{FileSettings, PluginSettings, SettingsSource};

/// Printed once the shared connection is ready after a (re)load.
pub const READY_PROMPT: &str = "Connection ready. Enter commands ('exit' to quit):";

const EVENT_CAPACITY: usize = 256;

/// Result of [`HostContext::request_reload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// This request installed (at least) the given generation.
    Installed(GenerationId),
    /// The reload failed; the previous generation, if any, keeps serving.
    Failed(String),
    /// Another reload was running and will pick up this change.
    Coalesced,
}

/// Builder for [`HostContext`].
pub struct HostBuilder {
    layout: HostLayout,
    watch_config: WatchConfig,
    retention: StagedRetention,
    purge_on_startup: bool,
    module_loader: Option<Arc<dyn ModuleLoader>>,
    connector: Option<Arc<dyn Connector>>,
    settings: Option<Arc<dyn SettingsSource>>,
    source: Option<Box<dyn CommandSource>>,
    console: Option<Console>,
}

impl HostBuilder {
    pub fn new(layout: HostLayout) -> Self {
        Self {
            layout,
            watch_config: WatchConfig::default(),
            retention: StagedRetention::default(),
            purge_on_startup: false,
            module_loader: None,
            connector: None,
            settings: None,
            source: None,
            console: None,
        }
    }

    /// Apply the `plugin` settings section.
    pub fn with_plugin_settings(mut self, plugin: &PluginSettings) -> Self {
        self.watch_config = plugin.watch_config();
        self.retention = plugin.retention;
        self.purge_on_startup = plugin.purge_on_startup;
        self
    }

    pub fn with_watch_config(mut self, config: WatchConfig) -> Self {
        self.watch_config = config;
        self
    }

    pub fn with_retention(mut self, retention: StagedRetention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_purge_on_startup(mut self, purge: bool) -> Self {
        self.purge_on_startup = purge;
        self
    }

    pub fn with_module_loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.module_loader = Some(loader);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_settings(mut self, settings: Arc<dyn SettingsSource>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_source(mut self, source: Box<dyn CommandSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_console(mut self, console: Console) -> Self {
        self.console = Some(console);
        self
    }

    pub fn build(self) -> Arc<HostContext> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let console = self.console.unwrap_or_else(Console::stdout);
        let slot = Arc::new(GenerationSlot::new());

        let settings: Arc<dyn SettingsSource> = match self.settings {
            Some(settings) => settings,
            None => Arc::new(FileSettings::discover(self.layout.root())),
        };
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(SqliteConnector),
        };
        let connections = Arc::new(ConnectionManager::new(connector, settings));

        let module_loader: Arc<dyn ModuleLoader> = match self.module_loader {
            Some(loader) => loader,
            None => Arc::new(NativeModuleLoader::new()),
        };
        let loader = Arc::new(GenerationLoader::new(
            self.layout.canonical_path(),
            ModuleStore::new(self.retention),
            module_loader,
            slot.clone(),
            events.clone(),
        ));

        let dispatcher = Arc::new(CommandDispatcher::new(
            slot,
            connections.clone(),
            console.clone(),
        ));
        let source: Box<dyn CommandSource> = match self.source {
            Some(source) => source,
            None => Box::new(stdin()),
        };

        Arc::new(HostContext {
            layout: self.layout,
            purge_on_startup: self.purge_on_startup,
            loader,
            dispatcher,
            connections,
            source: Arc::new(Mutex::new(source)),
            console,
            events,
            reload_lock: Mutex::new(()),
            reload_pending: AtomicBool::new(false),
            active_loop: Mutex::new(None),
            watcher: parking_lot::Mutex::new(ChangeWatcher::new(self.watch_config)),
            exit: CancellationToken::new(),
        })
    }
}

/// Explicit global state of a running host.
pub struct HostContext {
    layout: HostLayout,
    purge_on_startup: bool,
    loader: Arc<GenerationLoader>,
    dispatcher: Arc<CommandDispatcher>,
    connections: Arc<ConnectionManager>,
    source: SharedSource,
    console: Console,
    events: broadcast::Sender<ReloadEvent>,
    /// Held for the whole stage → load → swap → retire → restart sequence
    reload_lock: Mutex<()>,
    reload_pending: AtomicBool,
    active_loop: Mutex<Option<DispatchLoop>>,
    watcher: parking_lot::Mutex<ChangeWatcher>,
    exit: CancellationToken,
}

impl HostContext {
    pub fn builder(layout: HostLayout) -> HostBuilder {
        HostBuilder::new(layout)
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    pub fn loader(&self) -> &Arc<GenerationLoader> {
        &self.loader
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn current_generation(&self) -> Option<Arc<Generation>> {
        self.loader.slot().current()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.events.subscribe()
    }

    /// Cancelled when input ends, `exit` is entered, or the host shuts down.
    pub fn exit_token(&self) -> CancellationToken {
        self.exit.clone()
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.lock().is_running()
    }

    /// Generation the active dispatcher loop was started for, and its state.
    pub async fn active_loop(&self) -> Option<(Option<GenerationId>, LoopState)> {
        self.active_loop
            .lock()
            .await
            .as_ref()
            .map(|l| (l.bound_generation(), l.state()))
    }

    /// Purge stale copies if configured, start watching, load the module
    /// and start the dispatcher loop.
    ///
    /// A missing or broken module is reported and leaves the host running
    /// in "not ready" mode until a good build appears.
    pub async fn start(self: &Arc<Self>) -> Result<(), HostError> {
        if self.purge_on_startup {
            self.loader.purge_stale()?;
        }

        self.start_watcher()?;
        self.console.line(format!(
            "File watcher started, watching {}...",
            self.layout.plugins_dir().display()
        ));

        if !matches!(self.request_reload().await, ReloadOutcome::Installed(_)) {
            self.ensure_dispatcher().await;
        }
        Ok(())
    }

    /// Start the host and run until exit.
    pub async fn run(self: &Arc<Self>) -> Result<(), HostError> {
        self.start().await?;
        self.wait_for_exit().await;
        self.shutdown().await;
        Ok(())
    }

    /// (Re)start watching the plugins directory.
    pub fn start_watcher(self: &Arc<Self>) -> Result<(), HostError> {
        let host = Arc::downgrade(self);
        let handler: SignalHandler = Arc::new(move |signal: ReloadSignal| {
            let Some(host) = host.upgrade() else { return };
            tokio::spawn(async move { host.on_signal(signal).await });
        });

        self.watcher.lock().watch(
            self.layout.plugins_dir(),
            self.layout.canonical_file_name(),
            handler,
        )?;
        Ok(())
    }

    async fn on_signal(self: Arc<Self>, signal: ReloadSignal) {
        if self.exit.is_cancelled() {
            return;
        }
        info!("Module change detected ({:?}): {:?}", signal.kind, signal.path);
        self.emit(ReloadEvent::SignalReceived { path: signal.path });
        self.console.line("Plugin change detected! Reloading...");
        self.request_reload().await;
    }

    /// Reload now, or fold this request into the reload already running.
    ///
    /// Any number of requests arriving during one reload cause at most one
    /// more reload, which sees the newest file on disk.
    pub async fn request_reload(self: &Arc<Self>) -> ReloadOutcome {
        self.reload_pending.store(true, Ordering::SeqCst);
        let mut outcome = None;

        loop {
            let Ok(guard) = self.reload_lock.try_lock() else {
                if outcome.is_none() {
                    debug!("Reload already in progress; coalescing");
                    self.emit(ReloadEvent::SignalCoalesced);
                }
                return outcome.unwrap_or(ReloadOutcome::Coalesced);
            };

            if self.reload_pending.swap(false, Ordering::SeqCst) {
                outcome = Some(self.reload_locked().await);
                drop(guard);
                continue;
            }

            drop(guard);
            // a request may have flagged itself between the swap and the unlock
            if !self.reload_pending.load(Ordering::SeqCst) {
                return outcome.unwrap_or(ReloadOutcome::Coalesced);
            }
        }
    }

    async fn reload_locked(self: &Arc<Self>) -> ReloadOutcome {
        let loader = self.loader.clone();
        let result = tokio::task::spawn_blocking(move || loader.reload()).await;

        match result {
            Ok(Ok(generation)) => {
                let id = generation.id();
                self.console.line(format!(
                    "New module staged: {}",
                    generation.image().staged_path().display()
                ));
                drop(generation);
                self.restart_dispatcher(Some(id)).await;
                ReloadOutcome::Installed(id)
            }
            Ok(Err(e)) => {
                self.report_reload_failure(&e);
                ReloadOutcome::Failed(e.to_string())
            }
            Err(e) => {
                error!("Reload task failed: {}", e);
                self.console.line(format!("Error loading plugin: {e}"));
                ReloadOutcome::Failed(e.to_string())
            }
        }
    }

    fn report_reload_failure(&self, err: &ReloadError) {
        match err {
            ReloadError::ModuleNotFound(path) => {
                warn!("Plugin module not found at {:?}", path);
                self.console
                    .line(format!("Plugin module not found: {}", path.display()));
            }
            other => {
                self.console.line(format!("Error loading plugin: {other}"));
                if self.current_generation().is_some() {
                    self.console.line("The previous plugin version is still active.");
                }
            }
        }
    }

    /// Stop the active loop, reconnect, and start a loop for `generation`.
    async fn restart_dispatcher(self: &Arc<Self>, generation: Option<GenerationId>) {
        let mut active = self.active_loop.lock().await;
        if let Some(previous) = active.take() {
            let exit = previous.stop().await;
            debug!("Previous dispatcher loop stopped: {:?}", exit);
        }
        if self.exit.is_cancelled() {
            return;
        }

        match self.connections.ensure_open().await {
            Ok(_) => self.console.line(READY_PROMPT),
            Err(e) => {
                warn!("Could not open the connection after reload: {}", e);
                self.console.line(format!("Error: {e}"));
            }
        }

        *active = Some(self.dispatcher.spawn(self.source.clone(), &self.exit, generation));
        self.emit(ReloadEvent::DispatcherRestarted { generation });
    }

    /// Start a loop if none is running, without touching the connection.
    async fn ensure_dispatcher(self: &Arc<Self>) {
        let mut active = self.active_loop.lock().await;
        if active.is_some() || self.exit.is_cancelled() {
            return;
        }
        let generation = self.loader.slot().current_id();
        *active = Some(self.dispatcher.spawn(self.source.clone(), &self.exit, generation));
        self.emit(ReloadEvent::DispatcherRestarted { generation });
    }

    pub async fn wait_for_exit(&self) {
        self.exit.cancelled().await;
    }

    /// Stop watching, stop the loop and close the connection.
    pub async fn shutdown(&self) {
        self.exit.cancel();
        self.watcher.lock().stop();
        if let Some(active) = self.active_loop.lock().await.take() {
            active.stop().await;
        }
        self.connections.close().await;
        info!("Host shut down");
    }

    fn emit(&self, event: ReloadEvent) {
        let _ = self.events.send(event);
    }
}
