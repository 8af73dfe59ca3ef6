//! Resource that watches the other resources' statuses and applies a restart
//! policy to failures.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use hearth_core::{ResourceStatus, StatusCode};
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use super::resource::{Resource, ResourceCell};
use crate::context::ServiceContext;
use crate::settings::{SettingsError, SettingsView};
use crate::tasks::{TaskHandle, TimerSpec};

/// Settings key (under the monitor's view) listing resources whose failure
/// shuts the whole service down.
pub const SHUTDOWN_ON_FAILURE_KEY: &str = "restart_policy.resources.restart_microservice_on_failure";
/// Settings key listing resources restarted in place on failure.
pub const RESTART_ON_FAILURE_KEY: &str = "restart_policy.resources.restart_resource_on_failure";

/// A set of resource names; the name `all` matches every resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSelection {
    all: bool,
    names: BTreeSet<String>,
}

impl ResourceSelection {
    pub fn from_names<I>(names: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let names: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        Self {
            all: names.contains("all"),
            names,
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.all || self.names.contains(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.all && self.names.is_empty()
    }
}

/// What to do when a resource reports `FAILED`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartPolicy {
    pub shutdown_on_failure: ResourceSelection,
    pub restart_on_failure: ResourceSelection,
}

/// Actions taken by one policy check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enforcement {
    /// The failed resource that triggered service shutdown.
    pub shutdown_for: Option<String>,
    pub restarted: Vec<String>,
}

impl RestartPolicy {
    /// Reads both lists from `view`; missing keys mean empty selections.
    ///
    /// # Errors
    ///
    /// Backend failures, or [`SettingsError::Decode`] if a key is not a list
    /// of names.
    pub async fn load(view: &SettingsView) -> Result<Self, SettingsError> {
        let shutdown = view
            .get_as_or::<Vec<String>>(SHUTDOWN_ON_FAILURE_KEY, Vec::new())
            .await?;
        let restart = view
            .get_as_or::<Vec<String>>(RESTART_ON_FAILURE_KEY, Vec::new())
            .await?;
        Ok(Self {
            shutdown_on_failure: ResourceSelection::from_names(shutdown),
            restart_on_failure: ResourceSelection::from_names(restart),
        })
    }

    /// Checks every resource of `ctx` except `own_name` once.
    ///
    /// A failed resource selected for shutdown triggers graceful shutdown and
    /// ends the check. Otherwise each failed resource selected for restart is
    /// stopped and started again; a restart that fails to start triggers
    /// shutdown.
    pub async fn enforce(&self, ctx: &ServiceContext, own_name: &str) -> Enforcement {
        let mut outcome = Enforcement::default();
        let failed: Vec<(String, Arc<dyn Resource>)> = ctx
            .resources()
            .into_iter()
            .filter(|(name, resource)| {
                name != own_name && resource.status().status == StatusCode::Failed
            })
            .collect();

        if let Some((name, _)) = failed
            .iter()
            .find(|(name, _)| self.shutdown_on_failure.contains(name))
        {
            error!(resource = %name, service = %ctx.name(), "critical resource failed, closing service");
            ctx.shutdown().trigger_shutdown(format!("resource {name} failed"));
            outcome.shutdown_for = Some(name.clone());
            return outcome;
        }

        for (name, resource) in failed {
            if !self.restart_on_failure.contains(&name) {
                continue;
            }
            warn!(resource = %name, "restarting failed resource");
            if let Err(error) = resource.stop().await {
                warn!(resource = %name, error = %format!("{error:#}"), "failed resource did not stop cleanly");
            }
            if let Err(error) = resource.start().await {
                error!(
                    resource = %name,
                    error = %format!("{error:#}"),
                    "failed resource could not be restarted, closing service"
                );
                ctx.shutdown()
                    .trigger_shutdown(format!("resource {name} could not be restarted"));
                outcome.shutdown_for = Some(name);
                return outcome;
            }
            outcome.restarted.push(name);
        }
        outcome
    }
}

/// Periodically applies the [`RestartPolicy`] read from its settings view.
///
/// Declare it like any other resource; it reports `STARTED` while checking.
#[derive(Debug, Default)]
pub struct StatusMonitor {
    cell: ResourceCell,
    policy: RwLock<Arc<RestartPolicy>>,
    checks: Mutex<Option<TaskHandle>>,
}

impl StatusMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy in effect since the last `start`.
    #[must_use]
    pub fn policy(&self) -> RestartPolicy {
        RestartPolicy::clone(&self.policy.read())
    }
}

#[async_trait]
impl Resource for StatusMonitor {
    async fn bind(&self, ctx: &Arc<ServiceContext>, name: &str) -> anyhow::Result<()> {
        self.cell.bind(ctx, name);
        Ok(())
    }

    async fn configure_settings(&self, view: SettingsView) -> anyhow::Result<()> {
        self.cell.set_view(view);
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        let ctx = self
            .cell
            .context()
            .ok_or_else(|| anyhow::anyhow!("status monitor started before bind"))?;
        let policy = match self.cell.view() {
            Some(view) => RestartPolicy::load(&view).await?,
            None => RestartPolicy::default(),
        };
        let policy = Arc::new(policy);
        *self.policy.write() = Arc::clone(&policy);

        let own_name = self.cell.name();
        let period = ctx.config().status_check_period;
        let weak: Weak<ServiceContext> = Arc::downgrade(&ctx);
        let tick_name = own_name.clone();
        let handle = ctx.tasks().start_timer(
            format!("{own_name}.checks"),
            TimerSpec::every(period),
            move || {
                let weak = weak.clone();
                let policy = Arc::clone(&policy);
                let own_name = tick_name.clone();
                async move {
                    if let Some(ctx) = weak.upgrade() {
                        policy.enforce(&ctx, &own_name).await;
                    }
                    anyhow::Ok(())
                }
            },
        )?;

        if let Some(previous) = self.checks.lock().replace(handle) {
            previous.stop();
        }
        info!(resource = %own_name, period_ms = period.as_millis(), "status checks started");
        self.cell.mark_started();
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let handle = self.checks.lock().take();
        if let Some(handle) = handle {
            handle.stop();
        }
        self.cell.mark_stopped();
        Ok(())
    }

    fn status(&self) -> ResourceStatus {
        self.cell.status()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
