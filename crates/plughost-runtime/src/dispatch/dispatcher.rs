//! The serialized command loop

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::console::Console;
use super::source::CommandSource;
use crate::connection::ConnectionManager;
use crate::error::{DispatchError, InvocationError};
use crate::hot_reload::{GenerationId, GenerationSlot};

/// Command input shared by successive loops; only one loop reads at a time.
pub type SharedSource = Arc<tokio::sync::Mutex<Box<dyn CommandSource>>>;

/// The command that ends the process.
pub const EXIT_COMMAND: &str = "exit";

/// Consecutive read failures after which the input is treated as gone.
pub const MAX_READ_FAILURES: u32 = 5;

/// Lifecycle of one dispatcher loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Cancelling,
    Stopped,
}

/// Why the input ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    ExitCommand,
    EndOfInput,
    /// Reads kept failing; the input is unusable.
    InputError,
}

/// How a loop finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Stopped from outside, typically to make way for a new generation.
    Cancelled,
    /// Input asked the process to exit.
    Terminated(Termination),
}

/// Runs commands against whichever generation is current.
pub struct CommandDispatcher {
    slot: Arc<GenerationSlot>,
    connections: Arc<ConnectionManager>,
    console: Console,
}

impl CommandDispatcher {
    pub fn new(
        slot: Arc<GenerationSlot>,
        connections: Arc<ConnectionManager>,
        console: Console,
    ) -> Self {
        Self {
            slot,
            connections,
            console,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Execute one command and return its output.
    ///
    /// The current generation is read once, up front; a reload that lands
    /// while the command runs does not affect it.
    pub async fn dispatch(&self, command: &str) -> Result<String, DispatchError> {
        let generation = self
            .slot
            .current()
            .ok_or_else(|| DispatchError::NotReady("no plugin generation is loaded".to_string()))?;
        let conn = self.connections.ensure_open().await?;

        debug!("Dispatching '{}' to generation {}", command, generation.id());
        let owned = command.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut handle = conn.lock();
            generation.invoke(&mut **handle, &owned)
        })
        .await;

        match outcome {
            Ok(result) => Ok(result?),
            Err(e) => Err(InvocationError::Aborted {
                command: command.to_string(),
                reason: e.to_string(),
            }
            .into()),
        }
    }

    /// Execute one command and write its output or failure to the console.
    pub async fn handle_line(&self, command: &str) {
        match self.dispatch(command).await {
            Ok(output) => self.console.print(&output),
            Err(e) => self.report(&e),
        }
    }

    fn report(&self, err: &DispatchError) {
        match err {
            DispatchError::NotReady(reason) => {
                self.console.line(format!("Plugin not ready: {reason}"));
            }
            DispatchError::Connection(e) => {
                warn!("Connection error: {}", e);
                self.console.line("Error: could not open the database connection");
                self.console.line(format!("Details: {e}"));
            }
            DispatchError::Invocation(e) => {
                warn!("{}", e);
                self.console.line(format!("Error: {e}"));
                self.console.line(format!("Details: {}", e.cause()));
            }
        }
    }

    /// Start a loop reading from `source`.
    ///
    /// When input ends or the exit command arrives, `exit` is cancelled.
    /// Cancelling `exit` from outside also stops the loop.
    pub fn spawn(
        self: &Arc<Self>,
        source: SharedSource,
        exit: &CancellationToken,
        bound: Option<GenerationId>,
    ) -> DispatchLoop {
        let cancel = exit.child_token();
        let state = Arc::new(Mutex::new(LoopState::Running));

        let handle = tokio::spawn(self.clone().run(
            source,
            cancel.clone(),
            exit.clone(),
            state.clone(),
        ));

        debug!("Dispatcher loop started (generation {:?})", bound);
        DispatchLoop {
            cancel,
            state,
            handle,
            bound,
        }
    }

    async fn run(
        self: Arc<Self>,
        source: SharedSource,
        cancel: CancellationToken,
        exit: CancellationToken,
        state: Arc<Mutex<LoopState>>,
    ) -> LoopExit {
        let mut source = source.lock().await;
        let mut failures = 0u32;

        let outcome = loop {
            // Only the read races cancellation; a dispatched command always
            // runs to completion.
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break LoopExit::Cancelled,
                next = source.next_command() => next,
            };

            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => break LoopExit::Terminated(Termination::EndOfInput),
                Err(e) => {
                    failures += 1;
                    warn!("Failed to read command ({}/{}): {}", failures, MAX_READ_FAILURES, e);
                    self.console.line(format!("Error: could not read command: {e}"));
                    if failures >= MAX_READ_FAILURES {
                        break LoopExit::Terminated(Termination::InputError);
                    }
                    continue;
                }
            };
            failures = 0;

            let command = line.trim();
            if command.is_empty() {
                continue;
            }
            if command.eq_ignore_ascii_case(EXIT_COMMAND) {
                break LoopExit::Terminated(Termination::ExitCommand);
            }

            self.handle_line(command).await;
        };

        if let LoopExit::Terminated(reason) = outcome {
            info!("Command input finished ({:?})", reason);
            exit.cancel();
        }
        *state.lock() = LoopState::Stopped;
        outcome
    }
}

/// Handle to a running dispatcher loop.
pub struct DispatchLoop {
    cancel: CancellationToken,
    state: Arc<Mutex<LoopState>>,
    handle: JoinHandle<LoopExit>,
    bound: Option<GenerationId>,
}

impl DispatchLoop {
    pub fn state(&self) -> LoopState {
        *self.state.lock()
    }

    /// Generation that was current when the loop started.
    pub fn bound_generation(&self) -> Option<GenerationId> {
        self.bound
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the pending read and wait for the loop to stop, including any
    /// command it is executing.
    pub async fn stop(self) -> LoopExit {
        {
            let mut state = self.state.lock();
            if *state == LoopState::Running {
                *state = LoopState::Cancelling;
            }
        }
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the loop to finish on its own.
    pub async fn join(self) -> LoopExit {
        match self.handle.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!("Dispatcher loop ended abnormally: {}", e);
                *self.state.lock() = LoopState::Stopped;
                LoopExit::Cancelled
            }
        }
    }
}
