//! Reload lifecycle events

use std::path::PathBuf;
use std::time::Duration;

use super::generation::GenerationId;

/// Broadcast to observers of a host's reload lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ReloadEvent {
    /// The watcher reported a change to the canonical module.
    SignalReceived { path: PathBuf },
    /// A signal arrived while a reload was running and was folded into it.
    SignalCoalesced,
    /// A reload attempt began.
    ReloadStarted { path: PathBuf },
    /// A new generation was installed as current.
    ReloadCompleted {
        generation: GenerationId,
        staged_path: PathBuf,
        duration: Duration,
    },
    /// A reload attempt failed; the previous generation (if any) keeps serving.
    ReloadFailed { error: String },
    /// A superseded generation was marked for teardown.
    GenerationRetired {
        generation: GenerationId,
        in_flight: usize,
    },
    /// A generation's execution context was unloaded.
    GenerationUnloaded { generation: GenerationId },
    /// A fresh dispatcher loop was started.
    DispatcherRestarted { generation: Option<GenerationId> },
}

impl ReloadEvent {
    pub fn generation(&self) -> Option<GenerationId> {
        match self {
            ReloadEvent::ReloadCompleted { generation, .. }
            | ReloadEvent::GenerationRetired { generation, .. }
            | ReloadEvent::GenerationUnloaded { generation } => Some(*generation),
            ReloadEvent::DispatcherRestarted { generation } => *generation,
            _ => None,
        }
    }
}
