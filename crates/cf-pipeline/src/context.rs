//! Execution context shared by every step in a chain run.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use cf_core::StepStatus;

use crate::workspace::ChainWorkspace;

/// One finished chain entry, as seen by a progress listener.
#[derive(Debug, Clone, PartialEq)]
pub struct StepProgress {
    /// Entries finished so far, this one included.
    pub completed: usize,
    pub total: usize,
    /// `"<index> <type>/<model>"`, or the group label.
    pub label: String,
    pub status: StepStatus,
    pub cost: f64,
}

impl StepProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }
}

/// Listener for [`StepProgress`] events of a run.
pub struct ProgressSender {
    listener: Box<dyn Fn(&StepProgress) + Send + Sync>,
}

impl ProgressSender {
    pub fn new(listener: impl Fn(&StepProgress) + Send + Sync + 'static) -> Self {
        Self {
            listener: Box::new(listener),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn send(&self, progress: &StepProgress) {
        (self.listener)(progress);
    }
}

impl fmt::Debug for ProgressSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressSender(..)")
    }
}

/// Context passed to the chain executor for one run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Output and temp directories of the run.
    pub workspace: Arc<ChainWorkspace>,
    /// Checked between steps; when cancelled the chain aborts.
    pub cancellation: CancellationToken,
    /// Channel for reporting progress to the caller.
    pub progress: Arc<ProgressSender>,
}

impl ExecutionContext {
    pub fn new(workspace: Arc<ChainWorkspace>) -> Self {
        Self {
            workspace,
            cancellation: CancellationToken::new(),
            progress: Arc::new(ProgressSender::noop()),
        }
    }

    /// Builder: attach a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Builder: attach a shared progress sender.
    pub fn with_progress(mut self, progress: Arc<ProgressSender>) -> Self {
        self.progress = progress;
        self
    }
}
