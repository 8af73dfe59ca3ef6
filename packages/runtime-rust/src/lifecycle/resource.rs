use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use hearth_core::{DependencyGraph, ResourceStatus, StatusCode};
use parking_lot::RwLock;

use super::LifecycleError;
use crate::context::ServiceContext;
use crate::settings::SettingsView;

// ---------------------------------------------------------------------------
// Resource trait
// ---------------------------------------------------------------------------

/// A pluggable service component driven through the lifecycle phases.
///
/// Every phase defaults to a no-op. `bind` errors abort startup; errors from
/// the other phases mark the resource `Failed` and processing continues.
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    /// Attaches the resource to its service under `name`.
    async fn bind(&self, _ctx: &Arc<ServiceContext>, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Receives the settings view scoped to `<root>.resources.<name>`.
    async fn configure_settings(&self, _view: SettingsView) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Current health as reported to status aggregation.
    fn status(&self) -> ResourceStatus;
}

// ---------------------------------------------------------------------------
// ResourceState
// ---------------------------------------------------------------------------

/// Where a resource is in the lifecycle, as tracked by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    NotStarted,
    Bound,
    SettingsConfigured,
    PreStarted,
    Started,
    PostStarted,
    Stopping,
    Stopped,
    /// A phase returned an error. Sticky until a successful stop.
    Failed,
}

impl ResourceState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Bound => "bound",
            Self::SettingsConfigured => "settings_configured",
            Self::PreStarted => "pre_started",
            Self::Started => "started",
            Self::PostStarted => "post_started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ResourceCell
// ---------------------------------------------------------------------------

/// Reusable state for `Resource` implementations: the bound name and context,
/// the settings view, and the reported status.
///
/// `mark_started` and `mark_stopped` give the usual `start -> STARTED`,
/// `stop -> STOPPED` transitions.
#[derive(Debug, Default)]
pub struct ResourceCell {
    name: RwLock<String>,
    context: RwLock<Weak<ServiceContext>>,
    view: RwLock<Option<SettingsView>>,
    status: ArcSwap<ResourceStatus>,
}

impl ResourceCell {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the name and a weak handle to the service context.
    pub fn bind(&self, ctx: &Arc<ServiceContext>, name: &str) {
        name.clone_into(&mut self.name.write());
        *self.context.write() = Arc::downgrade(ctx);
    }

    /// Bound name, empty before `bind`.
    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// The service context, if bound and still alive.
    #[must_use]
    pub fn context(&self) -> Option<Arc<ServiceContext>> {
        self.context.read().upgrade()
    }

    pub fn set_view(&self, view: SettingsView) {
        *self.view.write() = Some(view);
    }

    #[must_use]
    pub fn view(&self) -> Option<SettingsView> {
        self.view.read().clone()
    }

    #[must_use]
    pub fn status(&self) -> ResourceStatus {
        ResourceStatus::clone(&self.status.load())
    }

    pub fn set_status(&self, status: impl Into<ResourceStatus>) {
        self.status.store(Arc::new(status.into()));
    }

    pub fn mark_started(&self) {
        self.set_status(StatusCode::Started);
    }

    pub fn mark_stopped(&self) {
        self.set_status(StatusCode::Stopped);
    }

    /// Reports `FAILED` with a human-readable detail.
    pub fn mark_failed(&self, detail: impl Into<String>) {
        self.set_status(ResourceStatus::new(StatusCode::Failed).with_detail(detail));
    }
}

// ---------------------------------------------------------------------------
// ServiceDescriptor
// ---------------------------------------------------------------------------

/// A declared resource: its unique name, implementation and dependencies.
#[derive(Clone)]
pub struct ResourceEntry {
    pub name: String,
    pub resource: Arc<dyn Resource>,
    pub depends_on: Vec<String>,
}

impl fmt::Debug for ResourceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceEntry")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

/// Explicit list of the resources a service is built from.
#[derive(Debug, Clone, Default)]
pub struct ServiceDescriptor {
    entries: Vec<ResourceEntry>,
    names: HashSet<String>,
}

impl ServiceDescriptor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a resource started after every name in `depends_on`.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::DuplicateName`] if `name` was already declared.
    pub fn resource<D>(
        &mut self,
        name: impl Into<String>,
        resource: Arc<dyn Resource>,
        depends_on: D,
    ) -> Result<&mut Self, LifecycleError>
    where
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let name = name.into();
        if !self.names.insert(name.clone()) {
            return Err(LifecycleError::DuplicateName(name));
        }
        self.entries.push(ResourceEntry {
            name,
            resource,
            depends_on: depends_on.into_iter().map(Into::into).collect(),
        });
        Ok(self)
    }

    /// Dependency graph of the declared resources.
    #[must_use]
    pub fn graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for entry in &self.entries {
            graph.add(entry.name.clone(), entry.depends_on.iter().cloned());
        }
        graph
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_entries(self) -> Vec<ResourceEntry> {
        self.entries
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
