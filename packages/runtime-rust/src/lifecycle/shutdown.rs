//! Service-wide shutdown trigger with lock-free state transitions.
//!
//! Signal handlers, the status monitor and any resource can request shutdown;
//! the coordinator waits on the trigger and then drives the shutdown phases.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::info;

/// Service state, transitioned by the shutdown controller.
///
/// State machine: Starting -> Running -> ShuttingDown -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Resources are being bound, configured and started.
    Starting,
    /// Startup finished; waiting for a shutdown trigger.
    Running,
    /// Shutdown was requested; resources are being stopped.
    ShuttingDown,
    /// Every shutdown phase has completed.
    Stopped,
}

/// Coordinates the shutdown request across the service.
///
/// 1. Anything holding the controller calls `trigger_shutdown(reason)`
/// 2. The coordinator wakes from `wait_for_shutdown()` and stops resources
/// 3. `mark_stopped()` records that shutdown completed
///
/// Only the first trigger is recorded; later ones are ignored.
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    state: Arc<ArcSwap<ServiceState>>,
    reason: Mutex<Option<String>>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            state: Arc::new(ArcSwap::from_pointee(ServiceState::Starting)),
            reason: Mutex::new(None),
        }
    }

    /// Transitions to `Running` unless shutdown was already requested.
    pub fn set_running(&self) {
        if !self.is_triggered() {
            self.state.store(Arc::new(ServiceState::Running));
        }
    }

    /// Returns a receiver that flips to `true` when shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Requests graceful shutdown.
    ///
    /// Returns `true` for the call that actually triggered it.
    pub fn trigger_shutdown(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        {
            let mut recorded = self.reason.lock();
            if recorded.is_some() {
                return false;
            }
            info!(reason = %reason, "shutdown requested");
            *recorded = Some(reason);
        }
        self.state.store(Arc::new(ServiceState::ShuttingDown));
        // Receivers may have been dropped.
        let _ = self.shutdown_signal.send(true);
        true
    }

    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.shutdown_signal.borrow()
    }

    /// Why shutdown was requested, if it was.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Resolves once shutdown has been triggered (immediately if it already was).
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_signal.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Records that every shutdown phase has completed.
    pub fn mark_stopped(&self) {
        self.state.store(Arc::new(ServiceState::Stopped));
    }

    /// Returns the current service state.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        **self.state.load()
    }

    /// Returns a shared handle to the state for readers outside the coordinator.
    #[must_use]
    pub fn state_handle(&self) -> Arc<ArcSwap<ServiceState>> {
        Arc::clone(&self.state)
    }

    /// Returns to `Starting` with no pending trigger.
    pub fn reset(&self) {
        *self.reason.lock() = None;
        self.state.store(Arc::new(ServiceState::Starting));
        let _ = self.shutdown_signal.send(false);
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
