//! Registration, admission, isolation and teardown of background work.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use hearth_core::{Counter, FlyweightRegistry};
use parking_lot::Mutex;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handle::{StopControl, StopFlag, TaskHandle, TaskKind, TaskOutcome};
use crate::config::RuntimeConfig;

/// Body of a cooperative task. Receives the token that cancels it.
pub type TaskBody =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Body of an OS thread. Should return soon after the flag is raised.
pub type ThreadBody = Box<dyn FnOnce(StopFlag) -> anyhow::Result<()> + Send>;

const THREAD_JOIN_POLL: Duration = Duration::from_millis(10);

/// Errors from registering or addressing background work.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("a task or thread named {0:?} is already registered or running")]
    DuplicateName(String),
    #[error("no task or thread named {0:?}")]
    UnknownTask(String),
    #[error("failed to spawn thread {name:?}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TaskEntry {
    id: u64,
    token: CancellationToken,
}

#[derive(Debug)]
struct ThreadEntry {
    flag: StopFlag,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct SupervisorState {
    registered_tasks: Vec<(String, TaskBody)>,
    registered_threads: Vec<(String, ThreadBody)>,
    /// Admitted tasks waiting for a slot; their bodies have not run yet.
    pending: HashMap<String, TaskEntry>,
    running_tasks: HashMap<String, TaskEntry>,
    running_threads: HashMap<String, ThreadEntry>,
}

impl SupervisorState {
    /// Joins and forgets threads that have already exited.
    fn prune_finished_threads(&mut self) {
        let finished: Vec<String> = self
            .running_threads
            .iter()
            .filter(|(_, entry)| entry.join.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        for name in finished {
            if let Some(entry) = self.running_threads.remove(&name) {
                let _ = entry.join.join();
            }
        }
    }

    fn ensure_unique(&mut self, name: &str) -> Result<(), TaskError> {
        self.prune_finished_threads();
        let taken = self.registered_tasks.iter().any(|(n, _)| n == name)
            || self.registered_threads.iter().any(|(n, _)| n == name)
            || self.pending.contains_key(name)
            || self.running_tasks.contains_key(name)
            || self.running_threads.contains_key(name);
        if taken {
            return Err(TaskError::DuplicateName(name.to_string()));
        }
        Ok(())
    }
}

enum Admission {
    Immediate,
    Granted(OwnedSemaphorePermit),
    Queue(Arc<Semaphore>),
}

struct Inner {
    state: Mutex<SupervisorState>,
    /// Parent of every task token; replaced after each `stop_all`.
    root: Mutex<CancellationToken>,
    admission: Option<Arc<Semaphore>>,
    task_limit: Option<usize>,
    join_timeout: Duration,
    meters: Arc<FlyweightRegistry<Counter>>,
    next_id: AtomicU64,
}

impl Inner {
    fn new_entry(&self) -> TaskEntry {
        TaskEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            token: self.root.lock().child_token(),
        }
    }

    fn count(&self, meter: &str, kind: TaskKind) {
        self.meters
            .handle(meter, [("kind", kind.as_str())])
            .increment();
    }

    /// Moves an admitted task from pending to running.
    fn promote(&self, name: &str, id: u64) {
        let mut state = self.state.lock();
        if state.pending.get(name).is_some_and(|entry| entry.id == id) {
            if let Some(entry) = state.pending.remove(name) {
                state.running_tasks.insert(name.to_string(), entry);
            }
        }
    }

    /// Removes a task's tracking entry unless the name was reused since.
    fn forget_task(&self, name: &str, id: u64) {
        let mut state = self.state.lock();
        if state.pending.get(name).is_some_and(|entry| entry.id == id) {
            state.pending.remove(name);
        }
        if state.running_tasks.get(name).is_some_and(|entry| entry.id == id) {
            state.running_tasks.remove(name);
        }
    }

    fn report(
        &self,
        name: &str,
        kind: TaskKind,
        outcome: TaskOutcome,
        tx: oneshot::Sender<TaskOutcome>,
    ) {
        match &outcome {
            TaskOutcome::Completed => debug!(name, %kind, "background work completed"),
            TaskOutcome::Failed(error) => {
                self.count("tasks.failed", kind);
                error!(name, %kind, error = %format!("{error:#}"), "background work failed");
            }
            TaskOutcome::Panicked(message) => {
                self.count("tasks.failed", kind);
                error!(name, %kind, panic = %message, "background work panicked");
            }
            TaskOutcome::Cancelled => {
                self.count("tasks.cancelled", kind);
                debug!(name, %kind, "background work cancelled");
            }
        }
        // The handle may have been dropped.
        let _ = tx.send(outcome);
    }

    fn launch_task(
        self: &Arc<Self>,
        state: &mut SupervisorState,
        name: String,
        entry: TaskEntry,
        body: TaskBody,
        admission: Admission,
    ) -> TaskHandle {
        let (id, token) = (entry.id, entry.token.clone());
        if matches!(admission, Admission::Queue(_)) {
            state.pending.insert(name.clone(), entry);
        } else {
            state.running_tasks.insert(name.clone(), entry);
        }

        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(self);
        let task_name = name.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            let permit = match admission {
                Admission::Immediate => None,
                Admission::Granted(permit) => Some(permit),
                Admission::Queue(semaphore) => {
                    let acquired = tokio::select! {
                        () = task_token.cancelled() => None,
                        permit = semaphore.acquire_owned() => permit.ok(),
                    };
                    let Some(permit) = acquired else {
                        inner.forget_task(&task_name, id);
                        inner.report(&task_name, TaskKind::Cooperative, TaskOutcome::Cancelled, tx);
                        return;
                    };
                    inner.promote(&task_name, id);
                    Some(permit)
                }
            };

            inner.count("tasks.started", TaskKind::Cooperative);
            let outcome = run_cooperative(body, task_token).await;
            drop(permit);
            inner.forget_task(&task_name, id);
            inner.report(&task_name, TaskKind::Cooperative, outcome, tx);
        });

        TaskHandle::new(name, StopControl::Cooperative(token), rx)
    }

    fn launch_thread(
        self: &Arc<Self>,
        state: &mut SupervisorState,
        name: String,
        body: ThreadBody,
    ) -> Result<TaskHandle, TaskError> {
        let flag = StopFlag::new();
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(self);
        let thread_name = name.clone();
        let thread_flag = flag.clone();

        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                inner.count("tasks.started", TaskKind::Preemptive);
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| body(thread_flag.clone())));
                let outcome = match result {
                    Ok(Ok(())) if thread_flag.is_stopped() => TaskOutcome::Cancelled,
                    Ok(Ok(())) => TaskOutcome::Completed,
                    Ok(Err(error)) => TaskOutcome::Failed(error),
                    Err(payload) => TaskOutcome::Panicked(panic_message(payload.as_ref())),
                };
                inner.report(&thread_name, TaskKind::Preemptive, outcome, tx);
            })
            .map_err(|source| TaskError::Spawn {
                name: name.clone(),
                source,
            })?;

        state.running_threads.insert(
            name.clone(),
            ThreadEntry {
                flag: flag.clone(),
                join,
            },
        );
        Ok(TaskHandle::new(name, StopControl::Preemptive(flag), rx))
    }

    /// Waits up to the join timeout for a stopped thread to exit. A thread
    /// that does not exit in time is detached.
    async fn join_thread(&self, name: &str, entry: ThreadEntry) -> bool {
        let deadline = tokio::time::Instant::now() + self.join_timeout;
        loop {
            if entry.join.is_finished() {
                let _ = entry.join.join();
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    name,
                    timeout_ms = u64::try_from(self.join_timeout.as_millis()).unwrap_or(u64::MAX),
                    "thread did not stop in time, detaching"
                );
                return false;
            }
            tokio::time::sleep(THREAD_JOIN_POLL).await;
        }
    }
}

async fn run_cooperative(body: TaskBody, token: CancellationToken) -> TaskOutcome {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| body(token.clone()))) {
        Ok(future) => future,
        Err(payload) => return TaskOutcome::Panicked(panic_message(payload.as_ref())),
    };
    tokio::select! {
        biased;
        () = token.cancelled() => TaskOutcome::Cancelled,
        result = AssertUnwindSafe(future).catch_unwind() => match result {
            Ok(Ok(())) => TaskOutcome::Completed,
            Ok(Err(error)) => TaskOutcome::Failed(error),
            Err(payload) => TaskOutcome::Panicked(panic_message(payload.as_ref())),
        },
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Releases a name reserved by `wait_for_start_task` if the waiting future is
/// dropped before the task launches.
struct PendingReservation<'a> {
    inner: &'a Inner,
    name: &'a str,
    id: u64,
    armed: bool,
}

impl PendingReservation<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(name = self.name, "admission wait abandoned, releasing name");
            self.inner.forget_task(self.name, self.id);
        }
    }
}

pub(crate) fn boxed_task<F, Fut>(body: F) -> TaskBody
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |token| body(token).boxed())
}

// ---------------------------------------------------------------------------
// TaskSupervisor
// ---------------------------------------------------------------------------

/// Starts, isolates, limits and stops cooperative tasks and OS threads.
///
/// Every body runs inside a wrapper that catches errors and panics and reports
/// the [`TaskOutcome`] to the unit's own [`TaskHandle`] only. Cheap to clone;
/// clones share state.
#[derive(Clone)]
pub struct TaskSupervisor {
    inner: Arc<Inner>,
}

impl TaskSupervisor {
    /// Creates a supervisor. With `task_limit`, at most that many admitted
    /// cooperative bodies run at once.
    #[must_use]
    pub fn new(
        task_limit: Option<usize>,
        join_timeout: Duration,
        meters: Arc<FlyweightRegistry<Counter>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SupervisorState::default()),
                root: Mutex::new(CancellationToken::new()),
                admission: task_limit.map(|limit| Arc::new(Semaphore::new(limit))),
                task_limit,
                join_timeout,
                meters,
                next_id: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn from_config(config: &RuntimeConfig, meters: Arc<FlyweightRegistry<Counter>>) -> Self {
        Self::new(config.task_limit, config.thread_join_timeout, meters)
    }

    #[must_use]
    pub fn task_limit(&self) -> Option<usize> {
        self.inner.task_limit
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Registers a cooperative task to be launched by [`start_all`](Self::start_all).
    ///
    /// # Errors
    ///
    /// [`TaskError::DuplicateName`] if the name is registered, pending or running.
    pub fn register_task<F, Fut>(&self, name: impl Into<String>, body: F) -> Result<(), TaskError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_boxed_task(name.into(), boxed_task(body))
    }

    pub(crate) fn register_boxed_task(&self, name: String, body: TaskBody) -> Result<(), TaskError> {
        let mut state = self.inner.state.lock();
        state.ensure_unique(&name)?;
        debug!(name = %name, "task registered");
        state.registered_tasks.push((name, body));
        Ok(())
    }

    /// Registers an OS thread to be launched by [`start_all`](Self::start_all).
    ///
    /// # Errors
    ///
    /// [`TaskError::DuplicateName`] if the name is registered, pending or running.
    pub fn register_thread<F>(&self, name: impl Into<String>, body: F) -> Result<(), TaskError>
    where
        F: FnOnce(StopFlag) -> anyhow::Result<()> + Send + 'static,
    {
        let name = name.into();
        let mut state = self.inner.state.lock();
        state.ensure_unique(&name)?;
        debug!(name = %name, "thread registered");
        state.registered_threads.push((name, Box::new(body)));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Starting
    // -----------------------------------------------------------------------

    /// Launches every registered task and thread. Tasks go through admission
    /// when a task limit is set. Must be called within a tokio runtime.
    pub fn start_all(&self) -> Vec<TaskHandle> {
        let mut state = self.inner.state.lock();
        let tasks = std::mem::take(&mut state.registered_tasks);
        let threads = std::mem::take(&mut state.registered_threads);
        let (task_count, thread_count) = (tasks.len(), threads.len());

        let mut handles = Vec::with_capacity(task_count + thread_count);
        for (name, body) in tasks {
            let admission = match &self.inner.admission {
                Some(semaphore) => Admission::Queue(Arc::clone(semaphore)),
                None => Admission::Immediate,
            };
            let entry = self.inner.new_entry();
            handles.push(self.inner.launch_task(&mut state, name, entry, body, admission));
        }
        for (name, body) in threads {
            match self.inner.launch_thread(&mut state, name, body) {
                Ok(handle) => handles.push(handle),
                Err(error) => error!(error = %error, "failed to start registered thread"),
            }
        }
        info!(tasks = task_count, threads = thread_count, "registered background work started");
        handles
    }

    /// Starts a cooperative task now, bypassing admission.
    ///
    /// # Errors
    ///
    /// [`TaskError::DuplicateName`] if the name is in use.
    pub fn start_task<F, Fut>(&self, name: impl Into<String>, body: F) -> Result<TaskHandle, TaskError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.start_boxed_task(name.into(), boxed_task(body))
    }

    pub(crate) fn start_boxed_task(&self, name: String, body: TaskBody) -> Result<TaskHandle, TaskError> {
        let mut state = self.inner.state.lock();
        state.ensure_unique(&name)?;
        let entry = self.inner.new_entry();
        Ok(self
            .inner
            .launch_task(&mut state, name, entry, body, Admission::Immediate))
    }

    /// Starts an OS thread now.
    ///
    /// # Errors
    ///
    /// [`TaskError::DuplicateName`] if the name is in use, [`TaskError::Spawn`]
    /// if the OS refuses the thread.
    pub fn start_thread<F>(&self, name: impl Into<String>, body: F) -> Result<TaskHandle, TaskError>
    where
        F: FnOnce(StopFlag) -> anyhow::Result<()> + Send + 'static,
    {
        let name = name.into();
        let mut state = self.inner.state.lock();
        state.ensure_unique(&name)?;
        self.inner.launch_thread(&mut state, name, Box::new(body))
    }

    /// Starts a cooperative task once a slot is free.
    ///
    /// Without a task limit this is [`start_task`](Self::start_task). With one,
    /// the name is reserved while waiting for a permit; the permit is held
    /// until the body finishes. A `stop_all` during the wait yields a handle
    /// whose outcome is `Cancelled`.
    ///
    /// # Errors
    ///
    /// [`TaskError::DuplicateName`] if the name is in use.
    pub async fn wait_for_start_task<F, Fut>(
        &self,
        name: impl Into<String>,
        body: F,
    ) -> Result<TaskHandle, TaskError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let Some(semaphore) = self.inner.admission.clone() else {
            return self.start_task(name, body);
        };

        let entry = {
            let mut state = self.inner.state.lock();
            state.ensure_unique(&name)?;
            let entry = self.inner.new_entry();
            state.pending.insert(name.clone(), entry.clone());
            entry
        };

        let mut reservation = PendingReservation {
            inner: &self.inner,
            name: &name,
            id: entry.id,
            armed: true,
        };
        let acquired = tokio::select! {
            () = entry.token.cancelled() => None,
            permit = semaphore.acquire_owned() => permit.ok(),
        };
        reservation.disarm();
        drop(reservation);

        let Some(permit) = acquired else {
            self.inner.forget_task(&name, entry.id);
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(TaskOutcome::Cancelled);
            return Ok(TaskHandle::new(name, StopControl::Cooperative(entry.token), rx));
        };

        let mut state = self.inner.state.lock();
        if state.pending.get(&name).is_some_and(|pending| pending.id == entry.id) {
            state.pending.remove(&name);
        }
        Ok(self.inner.launch_task(
            &mut state,
            name,
            entry,
            boxed_task(body),
            Admission::Granted(permit),
        ))
    }

    // -----------------------------------------------------------------------
    // Stopping
    // -----------------------------------------------------------------------

    /// Cancels one cooperative task (or drops it if not yet started).
    ///
    /// # Errors
    ///
    /// [`TaskError::UnknownTask`] if no such task exists.
    pub fn stop_task(&self, name: &str) -> Result<(), TaskError> {
        let mut state = self.inner.state.lock();
        if let Some(index) = state.registered_tasks.iter().position(|(n, _)| n == name) {
            state.registered_tasks.remove(index);
            return Ok(());
        }
        let entry = state
            .pending
            .remove(name)
            .or_else(|| state.running_tasks.remove(name))
            .ok_or_else(|| TaskError::UnknownTask(name.to_string()))?;
        entry.token.cancel();
        debug!(name, "task stop requested");
        Ok(())
    }

    /// Raises one thread's stop flag and waits for it up to the join timeout
    /// (or drops it if not yet started).
    ///
    /// # Errors
    ///
    /// [`TaskError::UnknownTask`] if no such thread exists.
    pub async fn stop_thread(&self, name: &str) -> Result<(), TaskError> {
        let entry = {
            let mut state = self.inner.state.lock();
            if let Some(index) = state.registered_threads.iter().position(|(n, _)| n == name) {
                state.registered_threads.remove(index);
                return Ok(());
            }
            state
                .running_threads
                .remove(name)
                .ok_or_else(|| TaskError::UnknownTask(name.to_string()))?
        };
        entry.flag.stop();
        self.inner.join_thread(name, entry).await;
        Ok(())
    }

    /// Cancels every pending and running task, stops every thread and joins
    /// each with the bounded timeout, then forgets everything.
    pub async fn stop_all(&self) {
        let root = std::mem::replace(&mut *self.inner.root.lock(), CancellationToken::new());
        root.cancel();

        let (task_count, threads) = {
            let mut state = self.inner.state.lock();
            state.registered_tasks.clear();
            state.registered_threads.clear();
            let task_count = state.pending.drain().count() + state.running_tasks.drain().count();
            let threads: Vec<(String, ThreadEntry)> = state.running_threads.drain().collect();
            (task_count, threads)
        };

        for (_, entry) in &threads {
            entry.flag.stop();
        }
        let thread_count = threads.len();
        let mut detached = 0_usize;
        for (name, entry) in threads {
            if !self.inner.join_thread(&name, entry).await {
                detached += 1;
            }
        }
        info!(
            tasks = task_count,
            threads = thread_count,
            detached,
            "background work stopped"
        );
    }

    /// Drops all tracking without waiting: cancels tasks, raises thread flags
    /// and detaches threads.
    pub fn reset(&self) {
        let root = std::mem::replace(&mut *self.inner.root.lock(), CancellationToken::new());
        root.cancel();
        let mut state = self.inner.state.lock();
        for (_, entry) in state.running_threads.drain() {
            entry.flag.stop();
        }
        *state = SupervisorState::default();
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn registered(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut names: Vec<String> = state
            .registered_tasks
            .iter()
            .map(|(n, _)| n.clone())
            .chain(state.registered_threads.iter().map(|(n, _)| n.clone()))
            .collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn pending_tasks(&self) -> Vec<String> {
        sorted_keys(&self.inner.state.lock().pending)
    }

    #[must_use]
    pub fn running_tasks(&self) -> Vec<String> {
        sorted_keys(&self.inner.state.lock().running_tasks)
    }

    /// Names of threads that have not exited yet.
    #[must_use]
    pub fn running_threads(&self) -> Vec<String> {
        let mut state = self.inner.state.lock();
        state.prune_finished_threads();
        sorted_keys(&state.running_threads)
    }
}

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort();
    keys
}

impl std::fmt::Debug for TaskSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("task_limit", &self.inner.task_limit)
            .field("join_timeout", &self.inner.join_timeout)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize};

    use hearth_core::FlyweightKey;
    use tokio::sync::Notify;

    use super::*;

    fn supervisor(task_limit: Option<usize>) -> (TaskSupervisor, Arc<FlyweightRegistry<Counter>>) {
        let meters = Arc::new(FlyweightRegistry::new());
        (
            TaskSupervisor::new(task_limit, Duration::from_millis(300), meters.clone()),
            meters,
        )
    }

    fn meter(meters: &FlyweightRegistry<Counter>, id: &str, kind: &str) -> u64 {
        meters
            .get(&FlyweightKey::new(id, [("kind", kind)]))
            .map_or(0, |counter| counter.value())
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected_across_kinds() {
        let (tasks, _) = supervisor(None);
        tasks.register_task("t1", |_| async { anyhow::Ok(()) }).unwrap();
        assert!(matches!(
            tasks.register_task("t1", |_| async { anyhow::Ok(()) }),
            Err(TaskError::DuplicateName(name)) if name == "t1"
        ));
        assert!(matches!(
            tasks.register_thread("t1", |_| anyhow::Ok(())),
            Err(TaskError::DuplicateName(_))
        ));

        let gate = Arc::new(Notify::new());
        let wait = gate.clone();
        let handle = tasks
            .start_task("busy", move |_| async move {
                wait.notified().await;
                anyhow::Ok(())
            })
            .unwrap();
        assert!(matches!(
            tasks.register_task("busy", |_| async { anyhow::Ok(()) }),
            Err(TaskError::DuplicateName(_))
        ));
        gate.notify_one();
        assert!(handle.join().await.is_completed());
    }

    #[tokio::test]
    async fn start_all_launches_tasks_and_threads() {
        let (tasks, meters) = supervisor(None);
        let ran = Arc::new(AtomicU32::new(0));

        let counter = ran.clone();
        tasks
            .register_task("task", move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            })
            .unwrap();
        let counter = ran.clone();
        tasks
            .register_thread("thread", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            })
            .unwrap();
        assert_eq!(tasks.registered(), vec!["task", "thread"]);

        let handles = tasks.start_all();
        assert!(tasks.registered().is_empty());
        for handle in handles {
            assert!(handle.join().await.is_completed());
        }
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert!(tasks.running_tasks().is_empty());
        assert!(tasks.running_threads().is_empty());
        assert_eq!(meter(&meters, "tasks.started", "task"), 1);
        assert_eq!(meter(&meters, "tasks.started", "thread"), 1);
    }

    #[tokio::test]
    async fn failures_and_panics_are_isolated() {
        let (tasks, meters) = supervisor(None);
        let failing = tasks
            .start_task("failing", |_| async { Err::<(), _>(anyhow::anyhow!("boom")) })
            .unwrap();
        let panicking = tasks
            .start_task("panicking", |_| async {
                if true {
                    panic!("kaboom");
                }
                anyhow::Ok(())
            })
            .unwrap();
        let thread = tasks
            .start_thread("panicking-thread", |_| panic!("thread kaboom"))
            .unwrap();
        let healthy = tasks.start_task("healthy", |_| async { anyhow::Ok(()) }).unwrap();

        assert!(matches!(failing.join().await, TaskOutcome::Failed(e) if e.to_string() == "boom"));
        assert!(matches!(panicking.join().await, TaskOutcome::Panicked(m) if m == "kaboom"));
        assert!(matches!(thread.join().await, TaskOutcome::Panicked(m) if m == "thread kaboom"));
        assert!(healthy.join().await.is_completed());
        assert_eq!(meter(&meters, "tasks.failed", "task"), 2);
        assert_eq!(meter(&meters, "tasks.failed", "thread"), 1);
    }

    #[tokio::test]
    async fn finished_task_frees_its_name() {
        let (tasks, _) = supervisor(None);
        let handle = tasks.start_task("once", |_| async { anyhow::Ok(()) }).unwrap();
        handle.join().await;
        tokio::task::yield_now().await;
        assert!(tasks.start_task("once", |_| async { anyhow::Ok(()) }).is_ok());
    }

    #[tokio::test]
    async fn task_limit_bounds_concurrency() {
        let (tasks, _) = supervisor(Some(2));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..6 {
            let current = current.clone();
            let peak = peak.clone();
            tasks
                .register_task(format!("worker-{i}"), move |_| async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    anyhow::Ok(())
                })
                .unwrap();
        }

        let handles = tasks.start_all();
        tokio::task::yield_now().await;
        assert!(tasks.running_tasks().len() <= 2);
        for handle in handles {
            assert!(handle.join().await.is_completed());
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wait_for_start_task_waits_for_a_free_slot() {
        let (tasks, _) = supervisor(Some(1));
        let gate = Arc::new(Notify::new());
        let wait = gate.clone();
        let first = tasks
            .wait_for_start_task("first", move |_| async move {
                wait.notified().await;
                anyhow::Ok(())
            })
            .await
            .unwrap();

        let second_tasks = tasks.clone();
        let second = tokio::spawn(async move {
            second_tasks
                .wait_for_start_task("second", |_| async { anyhow::Ok(()) })
                .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!second.is_finished());
        assert_eq!(tasks.pending_tasks(), vec!["second"]);

        gate.notify_one();
        assert!(first.join().await.is_completed());
        let second = second.await.unwrap().unwrap();
        assert!(second.join().await.is_completed());
    }

    #[tokio::test]
    async fn abandoned_admission_wait_releases_its_name() {
        let (tasks, _) = supervisor(Some(1));
        let gate = Arc::new(Notify::new());
        let wait = gate.clone();
        let busy = tasks
            .wait_for_start_task("busy", move |_| async move {
                wait.notified().await;
                anyhow::Ok(())
            })
            .await
            .unwrap();

        let waiter_tasks = tasks.clone();
        let waiter = tokio::spawn(async move {
            waiter_tasks
                .wait_for_start_task("w", |_| async { anyhow::Ok(()) })
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(tasks.pending_tasks(), vec!["w"]);

        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert!(tasks.pending_tasks().is_empty());
        tasks.register_task("w", |_| async { anyhow::Ok(()) }).unwrap();

        let timed_out = tokio::time::timeout(
            Duration::from_millis(20),
            tasks.wait_for_start_task("late", |_| async { anyhow::Ok(()) }),
        )
        .await;
        assert!(timed_out.is_err());
        assert!(tasks.pending_tasks().is_empty());

        gate.notify_one();
        assert!(busy.join().await.is_completed());
    }

    #[tokio::test]
    async fn stop_task_cancels_at_next_suspension_point() {
        let (tasks, meters) = supervisor(None);
        let handle = tasks
            .start_task("sleeper", |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                anyhow::Ok(())
            })
            .unwrap();
        tokio::task::yield_now().await;
        tasks.stop_task("sleeper").unwrap();
        assert!(handle.join().await.is_cancelled());
        assert_eq!(meter(&meters, "tasks.cancelled", "task"), 1);
        assert!(matches!(tasks.stop_task("sleeper"), Err(TaskError::UnknownTask(_))));
    }

    #[tokio::test]
    async fn stop_thread_raises_flag_and_joins() {
        let (tasks, _) = supervisor(None);
        let handle = tasks
            .start_thread("poller", |flag| {
                while !flag.is_stopped() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                anyhow::Ok(())
            })
            .unwrap();
        tasks.stop_thread("poller").await.unwrap();
        assert!(tasks.running_threads().is_empty());
        assert!(handle.join().await.is_cancelled());
    }

    #[tokio::test]
    async fn stop_all_clears_everything() {
        let (tasks, _) = supervisor(Some(1));
        for i in 0..3 {
            tasks
                .register_task(format!("sleeper-{i}"), |_| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    anyhow::Ok(())
                })
                .unwrap();
        }
        tasks
            .register_thread("poller", |flag| {
                while !flag.is_stopped() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                anyhow::Ok(())
            })
            .unwrap();
        tasks
            .register_thread("stubborn", |_| {
                std::thread::sleep(Duration::from_secs(2));
                anyhow::Ok(())
            })
            .unwrap();
        tasks.register_task("quick", |_| async { anyhow::Ok(()) }).unwrap();

        let handles = tasks.start_all();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tasks.running_tasks().len(), 1);
        assert_eq!(tasks.pending_tasks().len(), 3);

        tasks.stop_all().await;
        assert!(tasks.running_tasks().is_empty());
        assert!(tasks.pending_tasks().is_empty());
        assert!(tasks.registered().is_empty());
        assert!(tasks.running_threads().is_empty());

        let mut cancelled = 0;
        for handle in handles {
            if handle.kind() == TaskKind::Cooperative && handle.join().await.is_cancelled() {
                cancelled += 1;
            }
        }
        assert_eq!(cancelled, 4);

        // Supervisor is usable again after stop_all.
        let handle = tasks.start_task("after", |_| async { anyhow::Ok(()) }).unwrap();
        assert!(handle.join().await.is_completed());
    }
}
