use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// How a unit of background work runs and is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Tokio task. Cancellation is advisory and takes effect at the body's
    /// next suspension point.
    Cooperative,
    /// Named OS thread. The body polls a [`StopFlag`]; the supervisor joins it
    /// with a bounded timeout.
    Preemptive,
}

impl TaskKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cooperative => "task",
            Self::Preemptive => "thread",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a unit finished.
#[derive(Debug)]
pub enum TaskOutcome {
    Completed,
    Failed(anyhow::Error),
    Panicked(String),
    Cancelled,
}

impl TaskOutcome {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Stop request shared between a thread body and its supervisor. The only
/// state a supervisor mutates across threads.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum StopControl {
    Cooperative(CancellationToken),
    Preemptive(StopFlag),
}

impl StopControl {
    pub(crate) fn stop(&self) {
        match self {
            Self::Cooperative(token) => token.cancel(),
            Self::Preemptive(flag) => flag.stop(),
        }
    }

    pub(crate) fn kind(&self) -> TaskKind {
        match self {
            Self::Cooperative(_) => TaskKind::Cooperative,
            Self::Preemptive(_) => TaskKind::Preemptive,
        }
    }
}

/// Handle to one started task or thread.
///
/// Dropping the handle does not stop the unit.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    control: StopControl,
    outcome: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub(crate) fn new(
        name: String,
        control: StopControl,
        outcome: oneshot::Receiver<TaskOutcome>,
    ) -> Self {
        Self {
            name,
            control,
            outcome,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.control.kind()
    }

    /// Requests the unit to stop: cancels the token of a task or raises the
    /// stop flag of a thread.
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Waits for the unit to finish.
    pub async fn join(self) -> TaskOutcome {
        // A dropped sender means the unit was torn down before reporting.
        self.outcome.await.unwrap_or(TaskOutcome::Cancelled)
    }

    /// Waits at most `timeout` for the unit to finish.
    pub async fn join_timeout(self, timeout: Duration) -> Option<TaskOutcome> {
        tokio::time::timeout(timeout, self.join()).await.ok()
    }
}
