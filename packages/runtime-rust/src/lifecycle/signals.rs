//! Signal handler registry.
//!
//! Handlers are keyed by signal number. Synchronous handlers run inline with
//! panics caught; asynchronous handlers are spawned with a deadline and are
//! never retried. While a listener is active, registering a handler for a new
//! signal number hooks that number immediately.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::tasks::panic_message;

pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGQUIT: i32 = 3;
pub const SIGTERM: i32 = 15;

type SyncHandler = Arc<dyn Fn(i32) + Send + Sync>;
type AsyncHandler = Arc<dyn Fn(i32) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
enum SignalHandler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

/// OS signal streams installed by an active listener.
struct Hooks {
    registry: Weak<SignalRegistry>,
    cancel: CancellationToken,
    hooked: BTreeSet<i32>,
    tasks: Vec<JoinHandle<()>>,
}

impl Hooks {
    /// Installs a stream for `signum` unless one exists.
    fn ensure(&mut self, signum: i32) -> io::Result<()> {
        if self.hooked.contains(&signum) {
            return Ok(());
        }
        if let Some(task) = hook_signal(self.registry.clone(), signum, self.cancel.clone())? {
            self.tasks.push(task);
        }
        self.hooked.insert(signum);
        debug!(signum, "signal hooked");
        Ok(())
    }
}

/// Handlers per signal number, dispatched in registration order.
pub struct SignalRegistry {
    handlers: RwLock<BTreeMap<i32, Vec<SignalHandler>>>,
    handler_timeout: Duration,
    hooks: Mutex<Option<Hooks>>,
}

impl SignalRegistry {
    /// Creates a registry whose async handlers get `handler_timeout` to finish.
    #[must_use]
    pub fn new(handler_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(BTreeMap::new()),
            handler_timeout,
            hooks: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.signal_handler_timeout)
    }

    /// Adds a handler invoked directly on dispatch.
    pub fn register_sync<F>(&self, signum: i32, handler: F)
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        self.push(signum, SignalHandler::Sync(Arc::new(handler)));
    }

    /// Adds a handler spawned on the runtime on dispatch.
    pub fn register_async<F, Fut>(&self, signum: i32, handler: F)
    where
        F: Fn(i32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |signum| handler(signum).boxed());
        self.push(signum, SignalHandler::Async(handler));
    }

    fn push(&self, signum: i32, handler: SignalHandler) {
        debug!(signum, "signal handler registered");
        self.handlers.write().entry(signum).or_default().push(handler);
        if let Some(hooks) = self.hooks.lock().as_mut() {
            if let Err(error) = hooks.ensure(signum) {
                error!(signum, error = %error, "cannot hook signal");
            }
        }
    }

    /// Signal numbers with at least one handler, ascending.
    #[must_use]
    pub fn signals(&self) -> Vec<i32> {
        self.handlers.read().keys().copied().collect()
    }

    /// Signal numbers with an installed OS stream, ascending. Empty while no
    /// listener is active.
    #[must_use]
    pub fn hooked_signals(&self) -> Vec<i32> {
        self.hooks
            .lock()
            .as_ref()
            .map(|hooks| hooks.hooked.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of handlers registered for `signum`.
    #[must_use]
    pub fn handler_count(&self, signum: i32) -> usize {
        self.handlers.read().get(&signum).map_or(0, Vec::len)
    }

    /// Runs every handler registered for `signum`.
    ///
    /// Returns one join handle per async handler, resolving to `true` if the
    /// handler finished within the deadline. Must be called within a tokio
    /// runtime when async handlers are registered.
    pub fn dispatch(&self, signum: i32) -> Vec<JoinHandle<bool>> {
        let handlers = self.handlers.read().get(&signum).cloned().unwrap_or_default();
        if handlers.is_empty() {
            debug!(signum, "no handlers for signal");
            return Vec::new();
        }

        let mut spawned = Vec::new();
        for handler in handlers {
            match handler {
                SignalHandler::Sync(handler) => {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(signum))) {
                        error!(signum, panic = %panic_message(payload.as_ref()), "signal handler panicked");
                    }
                }
                SignalHandler::Async(handler) => {
                    let deadline = self.handler_timeout;
                    spawned.push(tokio::spawn(async move {
                        match tokio::time::timeout(deadline, AssertUnwindSafe(handler(signum)).catch_unwind()).await {
                            Ok(Ok(())) => true,
                            Ok(Err(payload)) => {
                                error!(
                                    signum,
                                    panic = %panic_message(payload.as_ref()),
                                    "async signal handler panicked"
                                );
                                false
                            }
                            Err(_) => {
                                warn!(
                                    signum,
                                    timeout_ms = deadline.as_millis(),
                                    "async signal handler timed out and was cancelled"
                                );
                                false
                            }
                        }
                    }));
                }
            }
        }
        spawned
    }

    /// Installs OS signal streams for every registered signal number and
    /// dispatches each delivery. Numbers registered later, while the returned
    /// listener is alive, are hooked on registration.
    ///
    /// # Errors
    ///
    /// [`io::ErrorKind::AlreadyExists`] if a listener is already active, or
    /// the OS error if a signal cannot be hooked (e.g. `SIGKILL`).
    pub fn listen(self: &Arc<Self>) -> io::Result<SignalListener> {
        let mut slot = self.hooks.lock();
        if slot.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "signal listener already active",
            ));
        }
        let mut hooks = Hooks {
            registry: Arc::downgrade(self),
            cancel: CancellationToken::new(),
            hooked: BTreeSet::new(),
            tasks: Vec::new(),
        };
        for signum in self.signals() {
            if let Err(error) = hooks.ensure(signum) {
                hooks.cancel.cancel();
                return Err(error);
            }
        }
        *slot = Some(hooks);
        Ok(SignalListener {
            registry: Arc::clone(self),
        })
    }

    /// Drops every handler.
    pub fn clear(&self) {
        self.handlers.write().clear();
    }
}

impl std::fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalRegistry")
            .field("signals", &self.signals())
            .field("hooked", &self.hooked_signals())
            .field("handler_timeout", &self.handler_timeout)
            .finish()
    }
}

impl Default for SignalRegistry {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

#[cfg(unix)]
fn hook_signal(
    registry: Weak<SignalRegistry>,
    signum: i32,
    cancel: CancellationToken,
) -> io::Result<Option<JoinHandle<()>>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut stream = signal(SignalKind::from_raw(signum))?;
    Ok(Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = stream.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!(signum, "signal received");
                    let Some(registry) = registry.upgrade() else { break };
                    registry.dispatch(signum);
                }
            }
        }
    })))
}

/// Only Ctrl-C can be observed portably; it is dispatched as `SIGINT`. Other
/// numbers are accepted but never delivered.
#[cfg(not(unix))]
fn hook_signal(
    registry: Weak<SignalRegistry>,
    signum: i32,
    cancel: CancellationToken,
) -> io::Result<Option<JoinHandle<()>>> {
    if signum != SIGINT {
        debug!(signum, "signal cannot be observed on this platform");
        return Ok(None);
    }
    Ok(Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = tokio::signal::ctrl_c() => {
                    if received.is_err() {
                        break;
                    }
                    info!(signum = SIGINT, "signal received");
                    let Some(registry) = registry.upgrade() else { break };
                    registry.dispatch(SIGINT);
                }
            }
        }
    })))
}

/// Active OS signal listener. Dropping it stops listening.
#[derive(Debug)]
pub struct SignalListener {
    registry: Arc<SignalRegistry>,
}

impl SignalListener {
    fn detach(&self) -> Option<Hooks> {
        let hooks = self.registry.hooks.lock().take();
        if let Some(hooks) = &hooks {
            hooks.cancel.cancel();
        }
        hooks
    }

    /// Stops listening and waits for the listener tasks to exit.
    pub async fn stop(self) {
        if let Some(hooks) = self.detach() {
            for task in hooks.tasks {
                let _ = task.await;
            }
        }
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.detach();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
