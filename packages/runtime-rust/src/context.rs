//! Per-service dependency container shared by `Arc`.
//!
//! Holds every service-wide collaborator (settings store, task supervisor,
//! meters, signal handlers, shutdown trigger) so resources receive them
//! explicitly instead of reaching for process globals.

use std::sync::Arc;

use arc_swap::ArcSwap;
use hearth_core::{Counter, FlyweightRegistry, SettingKey};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::lifecycle::{Resource, ShutdownController, SignalRegistry};
use crate::settings::{SettingsStore, SettingsView};
use crate::tasks::TaskSupervisor;

/// Name reported until `<root>.deploy_name` is read from settings.
pub const DEFAULT_DEPLOY_NAME: &str = "default";

/// Everything a resource may need from its service.
pub struct ServiceContext {
    config: Arc<RuntimeConfig>,
    instance_id: Uuid,
    deploy_name: ArcSwap<String>,
    settings: Arc<SettingsStore>,
    tasks: TaskSupervisor,
    meters: Arc<FlyweightRegistry<Counter>>,
    signals: Arc<SignalRegistry>,
    shutdown: Arc<ShutdownController>,
    resources: RwLock<Vec<(String, Arc<dyn Resource>)>>,
}

impl ServiceContext {
    /// Context with a settings store built from `config` (no backend injected).
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let settings = SettingsStore::from_config(&config);
        Self::with_settings(config, settings)
    }

    /// Context around a preconfigured settings store.
    #[must_use]
    pub fn with_settings(config: RuntimeConfig, settings: SettingsStore) -> Self {
        let meters = Arc::new(FlyweightRegistry::new());
        let tasks = TaskSupervisor::from_config(&config, Arc::clone(&meters));
        let signals = Arc::new(SignalRegistry::from_config(&config));
        Self {
            config: Arc::new(config),
            instance_id: Uuid::new_v4(),
            deploy_name: ArcSwap::from_pointee(DEFAULT_DEPLOY_NAME.to_string()),
            settings: Arc::new(settings),
            tasks,
            meters,
            signals,
            shutdown: Arc::new(ShutdownController::new()),
            resources: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.service_name
    }

    /// Random id of this process instance.
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    #[must_use]
    pub fn deploy_name(&self) -> String {
        String::clone(&self.deploy_name.load())
    }

    pub fn set_deploy_name(&self, deploy_name: impl Into<String>) {
        self.deploy_name.store(Arc::new(deploy_name.into()));
    }

    #[must_use]
    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    #[must_use]
    pub fn tasks(&self) -> &TaskSupervisor {
        &self.tasks
    }

    #[must_use]
    pub fn meters(&self) -> &Arc<FlyweightRegistry<Counter>> {
        &self.meters
    }

    /// Shared counter for `id` and `labels`; equal keys return the same handle.
    #[must_use]
    pub fn counter(&self, id: &str, labels: &[(&str, &str)]) -> Arc<Counter> {
        self.meters.handle(id, labels.iter().copied())
    }

    #[must_use]
    pub fn signals(&self) -> &Arc<SignalRegistry> {
        &self.signals
    }

    #[must_use]
    pub fn shutdown(&self) -> &Arc<ShutdownController> {
        &self.shutdown
    }

    /// Root key of framework settings.
    #[must_use]
    pub fn settings_root(&self) -> SettingKey {
        SettingKey::new(&self.config.settings_root)
    }

    /// View over `prefix` with this service as consumer.
    #[must_use]
    pub fn settings_view(&self, prefix: impl Into<SettingKey>) -> SettingsView {
        SettingsView::new(
            Arc::clone(&self.settings),
            prefix,
            Some(self.config.service_name.clone()),
        )
    }

    /// View handed to the resource `name`: `<root>.resources.<name>`.
    #[must_use]
    pub fn resource_view(&self, name: &str) -> SettingsView {
        let prefix = self.settings_root().join("resources").join(name);
        self.settings_view(prefix)
    }

    /// Resources in start order, as installed by the coordinator.
    #[must_use]
    pub fn resources(&self) -> Vec<(String, Arc<dyn Resource>)> {
        self.resources.read().clone()
    }

    #[must_use]
    pub fn resource(&self, name: &str) -> Option<Arc<dyn Resource>> {
        self.resources
            .read()
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, resource)| Arc::clone(resource))
    }

    pub(crate) fn set_resources(&self, resources: Vec<(String, Arc<dyn Resource>)>) {
        *self.resources.write() = resources;
    }

    /// Returns the context to its freshly constructed state, keeping the
    /// configuration and instance id. For test isolation.
    pub fn reset(&self) {
        self.settings.clear();
        self.tasks.reset();
        self.meters.clear();
        self.signals.clear();
        self.shutdown.reset();
        self.resources.write().clear();
        self.set_deploy_name(DEFAULT_DEPLOY_NAME);
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let resources: Vec<String> = self
            .resources
            .read()
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        f.debug_struct("ServiceContext")
            .field("name", &self.config.service_name)
            .field("instance_id", &self.instance_id)
            .field("deploy_name", &self.deploy_name())
            .field("resources", &resources)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
