//! Drives a service's resources through startup and shutdown.
//!
//! Startup is strictly sequential in resolved dependency order:
//! 1. `bind` every resource (fatal on error)
//! 2. start settings, read `<root>.deploy_name`, log environment information
//! 3. `configure_settings` with a view over `<root>.resources.<name>`
//! 4. `pre_start`, `start`, launch registered background work, `post_start`
//!
//! Phase errors after binding are logged and mark the resource `Failed`;
//! the remaining resources are still processed. Shutdown runs `stop` and then
//! `post_stop` in the same forward order, stops settings watches and all
//! background work, under a forced-exit deadline.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::process::ExitCode;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use hearth_core::{global_status, ResolveError, ResourceStatus};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::informer::EnvironmentInfo;
use super::resource::{ResourceEntry, ResourceState, ServiceDescriptor};
use super::signals::{SIGINT, SIGTERM};
use super::watchdog::{process_exit_hook, ExitHook, GraceWatchdog};
use crate::context::ServiceContext;
use crate::settings::SettingsError;
use crate::tasks::panic_message;

/// Exit code when the resource dependency graph cannot be ordered.
pub const EXIT_UNSOLVABLE_DEPENDENCIES: u8 = 12;
/// Exit code when a resource fails to bind.
pub const EXIT_BIND_FAILURE: u8 = 11;
/// Exit code for any other startup failure.
pub const EXIT_STARTUP_FAILURE: u8 = 1;

/// Fatal startup errors.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("cannot order resources: {0}")]
    Resolve(#[from] ResolveError),

    #[error("resource {resource:?} failed to bind: {message}")]
    Bind { resource: String, message: String },

    #[error("resource {0:?} is declared more than once")]
    DuplicateName(String),

    #[error("settings failed to start: {0}")]
    Settings(#[from] SettingsError),
}

impl LifecycleError {
    /// Process exit code for this failure.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Resolve(_) | Self::DuplicateName(_) => EXIT_UNSOLVABLE_DEPENDENCIES,
            Self::Bind { .. } => EXIT_BIND_FAILURE,
            Self::Settings(_) => EXIT_STARTUP_FAILURE,
        }
    }
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    PreStart,
    Start,
    PostStart,
    Stop,
    PostStop,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::PreStart => "pre_start",
            Self::Start => "start",
            Self::PostStart => "post_start",
            Self::Stop => "stop",
            Self::PostStop => "post_stop",
        }
    }

    fn reached(self) -> ResourceState {
        match self {
            Self::PreStart => ResourceState::PreStarted,
            Self::Start => ResourceState::Started,
            Self::PostStart => ResourceState::PostStarted,
            Self::Stop | Self::PostStop => ResourceState::Stopped,
        }
    }

    fn call(self, entry: &ResourceEntry) -> BoxFuture<'_, anyhow::Result<()>> {
        let resource = &entry.resource;
        match self {
            Self::PreStart => resource.pre_start(),
            Self::Start => resource.start(),
            Self::PostStart => resource.post_start(),
            Self::Stop => resource.stop(),
            Self::PostStop => resource.post_stop(),
        }
    }
}

/// Awaits a resource call, turning a panic into an error.
async fn guarded(call: BoxFuture<'_, anyhow::Result<()>>) -> anyhow::Result<()> {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

// ---------------------------------------------------------------------------
// LifecycleCoordinator
// ---------------------------------------------------------------------------

/// Owns the resolved resource order and the per-resource lifecycle state.
pub struct LifecycleCoordinator {
    ctx: Arc<ServiceContext>,
    resources: Vec<ResourceEntry>,
    states: Mutex<HashMap<String, ResourceState>>,
    exit_hook: ExitHook,
}

impl LifecycleCoordinator {
    /// Resolves the start order of `descriptor` and installs the resources
    /// into the context.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Resolve`] on a dependency cycle or a dependency on an
    /// undeclared resource.
    pub fn new(ctx: Arc<ServiceContext>, descriptor: ServiceDescriptor) -> Result<Self, LifecycleError> {
        let order = descriptor.graph().resolve()?;
        let mut declared: HashMap<String, ResourceEntry> = descriptor
            .into_entries()
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect();
        let resources: Vec<ResourceEntry> = order
            .iter()
            .filter_map(|name| declared.remove(name))
            .collect();

        ctx.set_resources(
            resources
                .iter()
                .map(|entry| (entry.name.clone(), Arc::clone(&entry.resource)))
                .collect(),
        );
        let states = resources
            .iter()
            .map(|entry| (entry.name.clone(), ResourceState::NotStarted))
            .collect();
        info!(order = ?order, "resource start order resolved");

        Ok(Self {
            ctx,
            resources,
            states: Mutex::new(states),
            exit_hook: process_exit_hook(),
        })
    }

    /// Replaces the action taken when graceful shutdown overruns the grace
    /// period.
    #[must_use]
    pub fn with_exit_hook(mut self, hook: ExitHook) -> Self {
        self.exit_hook = hook;
        self
    }

    #[must_use]
    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    /// Resource names in start order.
    #[must_use]
    pub fn order(&self) -> Vec<String> {
        self.resources.iter().map(|entry| entry.name.clone()).collect()
    }

    #[must_use]
    pub fn state(&self, name: &str) -> Option<ResourceState> {
        self.states.lock().get(name).copied()
    }

    /// Lifecycle state of every resource, in start order.
    #[must_use]
    pub fn states(&self) -> Vec<(String, ResourceState)> {
        let states = self.states.lock();
        self.resources
            .iter()
            .map(|entry| {
                let state = states.get(&entry.name).copied().unwrap_or(ResourceState::NotStarted);
                (entry.name.clone(), state)
            })
            .collect()
    }

    /// Reported status of every resource.
    #[must_use]
    pub fn statuses(&self) -> HashMap<String, ResourceStatus> {
        self.resources
            .iter()
            .map(|entry| (entry.name.clone(), entry.resource.status()))
            .collect()
    }

    /// `200`, `500` or `102` aggregated over [`statuses`](Self::statuses).
    #[must_use]
    pub fn global_status(&self) -> u16 {
        global_status(&self.statuses())
    }

    fn set_state(&self, name: &str, state: ResourceState) {
        self.states.lock().insert(name.to_string(), state);
    }

    fn advance(&self, name: &str, phase: Phase) {
        let mut states = self.states.lock();
        let state = states.entry(name.to_string()).or_insert(ResourceState::NotStarted);
        if *state == ResourceState::Failed && phase != Phase::Stop {
            return;
        }
        *state = phase.reached();
    }

    async fn run_phase(&self, phase: Phase) {
        debug!(phase = phase.as_str(), "running lifecycle phase");
        for entry in &self.resources {
            if phase == Phase::Stop {
                let failed = self.state(&entry.name) == Some(ResourceState::Failed);
                if !failed {
                    self.set_state(&entry.name, ResourceState::Stopping);
                }
            }
            match guarded(phase.call(entry)).await {
                Ok(()) => self.advance(&entry.name, phase),
                Err(error) => {
                    error!(
                        resource = %entry.name,
                        phase = phase.as_str(),
                        error = %format!("{error:#}"),
                        "resource phase failed"
                    );
                    self.set_state(&entry.name, ResourceState::Failed);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Runs every startup step.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Bind`] if a resource fails to bind (later resources
    /// are not bound), [`LifecycleError::Settings`] if the settings store
    /// cannot start.
    pub async fn startup(&self) -> Result<(), LifecycleError> {
        info!(service = %self.ctx.name(), resources = self.resources.len(), "starting service");

        for entry in &self.resources {
            guarded(entry.resource.bind(&self.ctx, &entry.name))
                .await
                .map_err(|error| LifecycleError::Bind {
                    resource: entry.name.clone(),
                    message: format!("{error:#}"),
                })?;
            self.set_state(&entry.name, ResourceState::Bound);
        }

        self.start_settings().await?;

        for entry in &self.resources {
            let view = self.ctx.resource_view(&entry.name);
            match guarded(entry.resource.configure_settings(view)).await {
                Ok(()) => self.set_state(&entry.name, ResourceState::SettingsConfigured),
                Err(error) => {
                    error!(
                        resource = %entry.name,
                        error = %format!("{error:#}"),
                        "resource settings configuration failed"
                    );
                    self.set_state(&entry.name, ResourceState::Failed);
                }
            }
        }

        self.run_phase(Phase::PreStart).await;
        self.run_phase(Phase::Start).await;
        let launched = self.ctx.tasks().start_all();
        debug!(units = launched.len(), "background work launched");
        self.run_phase(Phase::PostStart).await;

        self.ctx.shutdown().set_running();
        info!(
            service = %self.ctx.name(),
            global_status = self.global_status(),
            "service started"
        );
        Ok(())
    }

    async fn start_settings(&self) -> Result<(), LifecycleError> {
        let settings = self.ctx.settings();
        settings.start().await?;

        let key = self.ctx.settings_root().join("deploy_name");
        match settings.get_as::<String>(key.clone()).await {
            Ok(deploy_name) => self.ctx.set_deploy_name(deploy_name),
            Err(error) if error.is_not_found() => {
                debug!(key = %key, "deploy name not configured");
            }
            Err(error) => warn!(key = %key, error = %error, "cannot read deploy name"),
        }

        EnvironmentInfo::collect(&self.ctx).log();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stops every resource, settings watches and background work.
    pub async fn shutdown(&self) {
        self.ctx.shutdown().trigger_shutdown("shutdown requested");
        info!(service = %self.ctx.name(), "stopping service");

        self.run_phase(Phase::Stop).await;
        self.run_phase(Phase::PostStop).await;
        self.ctx.settings().stop().await;
        self.ctx.tasks().stop_all().await;

        self.ctx.shutdown().mark_stopped();
        info!(service = %self.ctx.name(), "service stopped");
    }

    /// Starts the service, waits for a shutdown trigger (`SIGINT`, `SIGTERM`
    /// or any caller of the shutdown controller), then shuts down under the
    /// grace period.
    ///
    /// # Errors
    ///
    /// See [`startup`](Self::startup).
    pub async fn run(&self) -> Result<(), LifecycleError> {
        for signum in [SIGINT, SIGTERM] {
            let shutdown = Arc::clone(self.ctx.shutdown());
            self.ctx.signals().register_sync(signum, move |signum| {
                shutdown.trigger_shutdown(format!("signal {signum}"));
            });
        }
        let listener = match self.ctx.signals().listen() {
            Ok(listener) => Some(listener),
            Err(error) => {
                warn!(error = %error, "cannot install signal listeners");
                None
            }
        };

        let outcome = match self.startup().await {
            Ok(()) => {
                self.ctx.shutdown().wait_for_shutdown().await;
                let watchdog =
                    GraceWatchdog::arm(self.ctx.config().grace_period, Arc::clone(&self.exit_hook));
                self.shutdown().await;
                watchdog.disarm();
                Ok(())
            }
            Err(error) => Err(error),
        };

        if let Some(listener) = listener {
            listener.stop().await;
        }
        outcome
    }
}

impl std::fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("service", &self.ctx.name())
            .field("states", &self.states())
            .finish_non_exhaustive()
    }
}

/// Builds the coordinator and runs the service until shutdown.
///
/// # Errors
///
/// Any [`LifecycleError`] from building or starting the service.
pub async fn serve(ctx: Arc<ServiceContext>, descriptor: ServiceDescriptor) -> Result<(), LifecycleError> {
    LifecycleCoordinator::new(ctx, descriptor)?.run().await
}

/// [`serve`], with the outcome mapped to a process exit code.
pub async fn run_service(ctx: Arc<ServiceContext>, descriptor: ServiceDescriptor) -> ExitCode {
    match serve(ctx, descriptor).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = %error, exit_code = error.exit_code(), "service failed");
            ExitCode::from(error.exit_code())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use hearth_core::{SettingKey, SettingsTree, StatusCode, GLOBAL_OK};

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::lifecycle::{Resource, ResourceCell, ServiceState, SIGHUP};
    use crate::settings::{MemoryBackend, SettingsStore, SettingsView};

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records every phase call as `phase:name`.
    struct Recorder {
        cell: ResourceCell,
        log: Log,
        fail_in: Option<&'static str>,
    }

    impl Recorder {
        fn new(log: &Log) -> Arc<Self> {
            Self::failing(log, None)
        }

        fn failing(log: &Log, fail_in: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                cell: ResourceCell::new(),
                log: Arc::clone(log),
                fail_in,
            })
        }

        fn record(&self, phase: &'static str) -> anyhow::Result<()> {
            self.log.lock().push(format!("{phase}:{}", self.cell.name()));
            if self.fail_in == Some(phase) {
                anyhow::bail!("{phase} exploded");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Resource for Recorder {
        async fn bind(&self, ctx: &Arc<ServiceContext>, name: &str) -> anyhow::Result<()> {
            self.cell.bind(ctx, name);
            self.record("bind")
        }

        async fn configure_settings(&self, view: SettingsView) -> anyhow::Result<()> {
            self.cell.set_view(view);
            self.record("configure")
        }

        async fn pre_start(&self) -> anyhow::Result<()> {
            self.record("pre_start")
        }

        async fn start(&self) -> anyhow::Result<()> {
            self.record("start")?;
            self.cell.mark_started();
            Ok(())
        }

        async fn post_start(&self) -> anyhow::Result<()> {
            self.record("post_start")
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.record("stop")?;
            self.cell.mark_stopped();
            Ok(())
        }

        async fn post_stop(&self) -> anyhow::Result<()> {
            self.record("post_stop")
        }

        fn status(&self) -> ResourceStatus {
            self.cell.status()
        }
    }

    fn context() -> Arc<ServiceContext> {
        Arc::new(ServiceContext::new(RuntimeConfig::for_service("svc")))
    }

    fn context_with(tree: SettingsTree) -> Arc<ServiceContext> {
        let store = SettingsStore::new().with_backend(Arc::new(MemoryBackend::from_tree(tree)));
        Arc::new(ServiceContext::with_settings(RuntimeConfig::for_service("svc"), store))
    }

    fn position(log: &[String], entry: &str) -> usize {
        log.iter()
            .position(|candidate| candidate == entry)
            .unwrap_or_else(|| panic!("{entry} missing from {log:?}"))
    }

    fn three_tier(log: &Log) -> ServiceDescriptor {
        let mut descriptor = ServiceDescriptor::new();
        descriptor
            .resource("api", Recorder::new(log), ["cache", "db"])
            .unwrap()
            .resource("cache", Recorder::new(log), ["db"])
            .unwrap()
            .resource("db", Recorder::new(log), Vec::<String>::new())
            .unwrap();
        descriptor
    }

    #[tokio::test]
    async fn startup_runs_each_phase_for_all_resources_in_dependency_order() {
        let log: Log = Arc::default();
        let coordinator = LifecycleCoordinator::new(context(), three_tier(&log)).unwrap();
        assert_eq!(coordinator.order(), vec!["db", "cache", "api"]);

        coordinator.startup().await.unwrap();

        let log = log.lock().clone();
        assert_eq!(log.len(), 15);
        for phase in ["bind", "configure", "pre_start", "start", "post_start"] {
            assert!(position(&log, &format!("{phase}:db")) < position(&log, &format!("{phase}:cache")));
            assert!(position(&log, &format!("{phase}:cache")) < position(&log, &format!("{phase}:api")));
        }
        assert!(position(&log, "bind:api") < position(&log, "configure:db"));
        assert!(position(&log, "pre_start:api") < position(&log, "start:db"));
        assert!(position(&log, "start:api") < position(&log, "post_start:db"));

        assert!(coordinator
            .states()
            .iter()
            .all(|(_, state)| *state == ResourceState::PostStarted));
        assert_eq!(coordinator.global_status(), GLOBAL_OK);
        assert_eq!(coordinator.context().shutdown().state(), ServiceState::Running);
    }

    #[tokio::test]
    async fn shutdown_runs_stop_then_post_stop_in_forward_order() {
        let log: Log = Arc::default();
        let coordinator = LifecycleCoordinator::new(context(), three_tier(&log)).unwrap();
        coordinator.startup().await.unwrap();
        log.lock().clear();

        coordinator.shutdown().await;

        assert_eq!(
            *log.lock(),
            vec![
                "stop:db",
                "stop:cache",
                "stop:api",
                "post_stop:db",
                "post_stop:cache",
                "post_stop:api"
            ]
        );
        assert!(coordinator
            .states()
            .iter()
            .all(|(_, state)| *state == ResourceState::Stopped));
        assert_eq!(coordinator.context().shutdown().state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn failing_phase_is_isolated_and_sticky_until_stop() {
        let log: Log = Arc::default();
        let mut descriptor = ServiceDescriptor::new();
        descriptor
            .resource("flaky", Recorder::failing(&log, Some("start")), Vec::<String>::new())
            .unwrap()
            .resource("steady", Recorder::new(&log), ["flaky"])
            .unwrap();
        let coordinator = LifecycleCoordinator::new(context(), descriptor).unwrap();

        coordinator.startup().await.unwrap();

        assert_eq!(coordinator.state("flaky"), Some(ResourceState::Failed));
        assert_eq!(coordinator.state("steady"), Some(ResourceState::PostStarted));
        assert!(log.lock().contains(&"post_start:flaky".to_string()));
        assert_eq!(coordinator.statuses()["flaky"].status, StatusCode::NotStarted);

        coordinator.shutdown().await;
        assert_eq!(coordinator.state("flaky"), Some(ResourceState::Stopped));
    }

    #[tokio::test]
    async fn panicking_phase_is_recorded_as_failure() {
        struct Explodes;

        #[async_trait]
        impl Resource for Explodes {
            async fn pre_start(&self) -> anyhow::Result<()> {
                panic!("pre_start bug");
            }

            fn status(&self) -> ResourceStatus {
                ResourceStatus::default()
            }
        }

        let mut descriptor = ServiceDescriptor::new();
        descriptor
            .resource("explodes", Arc::new(Explodes), Vec::<String>::new())
            .unwrap();
        let coordinator = LifecycleCoordinator::new(context(), descriptor).unwrap();

        coordinator.startup().await.unwrap();
        assert_eq!(coordinator.state("explodes"), Some(ResourceState::Failed));
    }

    #[tokio::test]
    async fn bind_failure_is_fatal_with_exit_code_11() {
        let log: Log = Arc::default();
        let mut descriptor = ServiceDescriptor::new();
        descriptor
            .resource("first", Recorder::failing(&log, Some("bind")), Vec::<String>::new())
            .unwrap()
            .resource("second", Recorder::new(&log), ["first"])
            .unwrap();
        let coordinator = LifecycleCoordinator::new(context(), descriptor).unwrap();

        let err = coordinator.startup().await.unwrap_err();
        assert!(matches!(&err, LifecycleError::Bind { resource, .. } if resource == "first"));
        assert_eq!(err.exit_code(), EXIT_BIND_FAILURE);
        assert_eq!(*log.lock(), vec!["bind:first"]);
        assert_eq!(coordinator.state("second"), Some(ResourceState::NotStarted));
    }

    #[test]
    fn dependency_cycle_is_rejected_with_exit_code_12() {
        let log: Log = Arc::default();
        let mut descriptor = ServiceDescriptor::new();
        descriptor
            .resource("x", Recorder::new(&log), ["y"])
            .unwrap()
            .resource("y", Recorder::new(&log), ["x"])
            .unwrap();

        let err = LifecycleCoordinator::new(context(), descriptor).unwrap_err();
        assert!(matches!(err, LifecycleError::Resolve(_)));
        assert_eq!(err.exit_code(), EXIT_UNSOLVABLE_DEPENDENCIES);
    }

    #[tokio::test]
    async fn deploy_name_and_resource_views_come_from_settings() {
        let mut tree = SettingsTree::new();
        tree.set(&SettingKey::new("system.deploy_name"), "canary".into());
        tree.set(&SettingKey::new("system.resources.http.port"), 8080.into());
        tree.set(
            &SettingKey::new("system.microservices.svc.resources.http.port"),
            9000.into(),
        );
        let ctx = context_with(tree);

        let log: Log = Arc::default();
        let http = Recorder::new(&log);
        let mut descriptor = ServiceDescriptor::new();
        descriptor
            .resource("http", Arc::clone(&http) as Arc<dyn Resource>, Vec::<String>::new())
            .unwrap();
        let coordinator = LifecycleCoordinator::new(Arc::clone(&ctx), descriptor).unwrap();
        coordinator.startup().await.unwrap();

        assert_eq!(ctx.deploy_name(), "canary");
        let view = http.cell.view().unwrap();
        assert_eq!(view.prefix().to_string(), "system.resources.http");
        assert_eq!(view.get_as::<u16>("port").await.unwrap(), 9000);
    }

    #[tokio::test]
    async fn background_work_starts_after_start_and_stops_on_shutdown() {
        struct Spawner {
            cell: ResourceCell,
        }

        #[async_trait]
        impl Resource for Spawner {
            async fn bind(&self, ctx: &Arc<ServiceContext>, name: &str) -> anyhow::Result<()> {
                self.cell.bind(ctx, name);
                Ok(())
            }

            async fn start(&self) -> anyhow::Result<()> {
                let ctx = self.cell.context().ok_or_else(|| anyhow::anyhow!("unbound"))?;
                ctx.tasks().register_task("spawner.loop", |token| async move {
                    token.cancelled().await;
                    anyhow::Ok(())
                })?;
                self.cell.mark_started();
                Ok(())
            }

            fn status(&self) -> ResourceStatus {
                self.cell.status()
            }
        }

        let ctx = context();
        let mut descriptor = ServiceDescriptor::new();
        descriptor
            .resource(
                "spawner",
                Arc::new(Spawner {
                    cell: ResourceCell::new(),
                }),
                Vec::<String>::new(),
            )
            .unwrap();
        let coordinator = LifecycleCoordinator::new(Arc::clone(&ctx), descriptor).unwrap();

        coordinator.startup().await.unwrap();
        assert_eq!(ctx.tasks().running_tasks(), vec!["spawner.loop"]);

        coordinator.shutdown().await;
        assert!(ctx.tasks().running_tasks().is_empty());
    }

    #[tokio::test]
    async fn run_returns_after_shutdown_is_triggered() {
        let log: Log = Arc::default();
        let ctx = context();
        let fired = Arc::new(AtomicU32::new(0));
        let hook_counter = Arc::clone(&fired);
        let coordinator = Arc::new(
            LifecycleCoordinator::new(Arc::clone(&ctx), three_tier(&log))
                .unwrap()
                .with_exit_hook(Arc::new(move || {
                    hook_counter.fetch_add(1, Ordering::SeqCst);
                })),
        );

        let runner = Arc::clone(&coordinator);
        let run = tokio::spawn(async move { runner.run().await });

        tokio::time::timeout(Duration::from_secs(2), async {
            while ctx.shutdown().state() != ServiceState::Running {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(ctx.signals().handler_count(SIGTERM), 1);

        ctx.shutdown().trigger_shutdown("test over");
        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(ctx.shutdown().state(), ServiceState::Stopped);
        assert!(log.lock().contains(&"post_stop:api".to_string()));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    /// Installs a `SIGHUP` handler from its `start` phase.
    #[derive(Default)]
    struct ReloadOnHangup {
        cell: ResourceCell,
    }

    #[async_trait]
    impl Resource for ReloadOnHangup {
        async fn bind(&self, ctx: &Arc<ServiceContext>, name: &str) -> anyhow::Result<()> {
            self.cell.bind(ctx, name);
            Ok(())
        }

        async fn start(&self) -> anyhow::Result<()> {
            let ctx = self
                .cell
                .context()
                .ok_or_else(|| anyhow::anyhow!("not bound"))?;
            ctx.signals().register_sync(SIGHUP, |_| {});
            self.cell.mark_started();
            Ok(())
        }

        fn status(&self) -> ResourceStatus {
            self.cell.status()
        }
    }

    #[tokio::test]
    async fn signals_registered_during_startup_are_hooked() {
        let ctx = context();
        let mut descriptor = ServiceDescriptor::new();
        descriptor
            .resource("reload", Arc::new(ReloadOnHangup::default()), Vec::<String>::new())
            .unwrap();
        let coordinator = Arc::new(LifecycleCoordinator::new(Arc::clone(&ctx), descriptor).unwrap());

        let runner = Arc::clone(&coordinator);
        let run = tokio::spawn(async move { runner.run().await });
        tokio::time::timeout(Duration::from_secs(2), async {
            while ctx.shutdown().state() != ServiceState::Running {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(ctx.signals().hooked_signals(), vec![SIGHUP, SIGINT, SIGTERM]);

        ctx.shutdown().trigger_shutdown("test over");
        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(ctx.signals().hooked_signals().is_empty());
    }

    #[tokio::test]
    async fn serve_rejects_self_dependency_before_binding() {
        let log: Log = Arc::default();
        let mut descriptor = ServiceDescriptor::new();
        descriptor.resource("a", Recorder::new(&log), ["a"]).unwrap();

        let err = serve(context(), descriptor).await.unwrap_err();
        assert_eq!(err.exit_code(), EXIT_UNSOLVABLE_DEPENDENCIES);
        assert!(log.lock().is_empty());
    }
}
