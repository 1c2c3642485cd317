//! Observable pipeline lifecycle.

use tokio::sync::watch;

/// Lifecycle of a single export run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    /// End of input reached; downstream stages are flushing.
    Draining,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }
}

/// Shared handle through which stages report lifecycle transitions.
#[derive(Debug)]
pub struct PipelineStatus {
    tx: watch::Sender<PipelineState>,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStatus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PipelineState::Idle);
        Self { tx }
    }

    pub fn current(&self) -> PipelineState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.tx.subscribe()
    }

    /// Move to `next` unless a terminal state was already reached.
    ///
    /// Returns whether the state changed.
    pub fn transition(&self, next: PipelineState) -> bool {
        let changed = self.tx.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            tracing::debug!("Pipeline state -> {:?}", next);
        }
        changed
    }

    /// Start a new run from a clean state.
    pub fn reset(&self) {
        self.tx.send_replace(PipelineState::Idle);
    }
}
