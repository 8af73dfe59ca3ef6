//! Forced-exit deadline for graceful shutdown.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, warn};

/// Action taken when the grace period expires.
pub type ExitHook = Arc<dyn Fn() + Send + Sync>;

/// Hook that terminates the process with exit code 1.
#[must_use]
pub fn process_exit_hook() -> ExitHook {
    Arc::new(|| std::process::exit(1))
}

/// OS thread that runs an exit hook unless disarmed within the grace period.
///
/// Runs outside the async runtime so a wedged shutdown phase cannot starve it.
pub struct GraceWatchdog {
    disarm: Option<mpsc::Sender<()>>,
    join: Option<thread::JoinHandle<bool>>,
}

impl GraceWatchdog {
    /// Starts the countdown.
    ///
    /// If the watchdog thread cannot be spawned, shutdown proceeds without a
    /// deadline and the failure is logged.
    #[must_use]
    pub fn arm(grace_period: Duration, on_expiry: ExitHook) -> Self {
        let (tx, rx) = mpsc::channel::<()>();
        let spawned = thread::Builder::new()
            .name("hearth-grace-watchdog".to_string())
            .spawn(move || match rx.recv_timeout(grace_period) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    error!(
                        grace_period_ms = grace_period.as_millis(),
                        "graceful shutdown did not finish in time, forcing exit"
                    );
                    on_expiry();
                    true
                }
                // Disarmed, or the watchdog handle was dropped.
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => false,
            });

        let join = match spawned {
            Ok(join) => Some(join),
            Err(error) => {
                warn!(error = %error, "failed to spawn shutdown watchdog");
                None
            }
        };
        Self {
            disarm: Some(tx),
            join,
        }
    }

    /// Cancels the deadline. Returns `true` if the hook had already fired.
    pub fn disarm(mut self) -> bool {
        if let Some(tx) = self.disarm.take() {
            let _ = tx.send(());
        }
        self.join
            .take()
            .is_some_and(|join| join.join().unwrap_or(false))
    }
}

impl Drop for GraceWatchdog {
    fn drop(&mut self) {
        if let Some(tx) = self.disarm.take() {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for GraceWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraceWatchdog")
            .field("armed", &self.disarm.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn counting_hook() -> (ExitHook, Arc<AtomicU32>) {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        let hook: ExitHook = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (hook, fired)
    }

    #[test]
    fn fires_when_not_disarmed() {
        let (hook, fired) = counting_hook();
        let watchdog = GraceWatchdog::arm(Duration::from_millis(20), hook);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(watchdog.disarm());
    }

    #[test]
    fn disarm_before_deadline_prevents_hook() {
        let (hook, fired) = counting_hook();
        let watchdog = GraceWatchdog::arm(Duration::from_secs(10), hook);
        assert!(!watchdog.disarm());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_disarms() {
        let (hook, fired) = counting_hook();
        drop(GraceWatchdog::arm(Duration::from_millis(50), hook));
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
