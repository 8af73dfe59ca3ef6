//! Example service: a cache with live-tunable capacity, a heartbeat thread and
//! the status monitor, run until SIGINT/SIGTERM.

use std::process::ExitCode;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use hearth_core::{ResourceStatus, SettingKey, SettingValue, SettingsTree};
use hearth_runtime::lifecycle::{run_service, Resource, ResourceCell, ServiceDescriptor, StatusMonitor};
use hearth_runtime::settings::{MemoryBackend, SettingsStore, SettingsView};
use hearth_runtime::tasks::TimerSpec;
use hearth_runtime::{telemetry, RuntimeArgs, RuntimeConfig, ServiceContext};
use tracing::{debug, info};

const DEFAULT_CAPACITY: i64 = 128;

/// In-process cache whose capacity follows the `capacity` setting.
struct Cache {
    cell: ResourceCell,
    capacity: Arc<AtomicI64>,
}

#[async_trait]
impl Resource for Cache {
    async fn bind(&self, ctx: &Arc<ServiceContext>, name: &str) -> anyhow::Result<()> {
        self.cell.bind(ctx, name);
        Ok(())
    }

    async fn configure_settings(&self, view: SettingsView) -> anyhow::Result<()> {
        let capacity = view.get_as_or::<i64>("capacity", DEFAULT_CAPACITY).await?;
        self.capacity.store(capacity, Ordering::Relaxed);

        let live = Arc::clone(&self.capacity);
        view.watch("capacity", move |key, value| {
            let live = Arc::clone(&live);
            async move {
                let capacity = value
                    .as_ref()
                    .and_then(SettingValue::as_i64)
                    .unwrap_or(DEFAULT_CAPACITY);
                live.store(capacity, Ordering::Relaxed);
                info!(key = %key, capacity, "cache capacity updated");
            }
        })
        .await;
        self.cell.set_view(view);
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        let ctx = self
            .cell
            .context()
            .ok_or_else(|| anyhow::anyhow!("cache started before bind"))?;
        let evictions = ctx.counter("cache.evictions", &[("resource", "cache")]);
        let capacity = Arc::clone(&self.capacity);
        ctx.tasks().register_timer(
            "cache.evict",
            TimerSpec::every(Duration::from_secs(5)),
            move || {
                let evictions = Arc::clone(&evictions);
                let capacity = capacity.load(Ordering::Relaxed);
                async move {
                    evictions.increment();
                    debug!(capacity, runs = evictions.value(), "eviction pass");
                    anyhow::Ok(())
                }
            },
        )?;
        self.cell.mark_started();
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.cell.mark_stopped();
        Ok(())
    }

    fn status(&self) -> ResourceStatus {
        self.cell.status()
    }
}

/// Emits a heartbeat from a dedicated OS thread.
#[derive(Default)]
struct Heartbeat {
    cell: ResourceCell,
}

#[async_trait]
impl Resource for Heartbeat {
    async fn bind(&self, ctx: &Arc<ServiceContext>, name: &str) -> anyhow::Result<()> {
        self.cell.bind(ctx, name);
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        let ctx = self
            .cell
            .context()
            .ok_or_else(|| anyhow::anyhow!("heartbeat started before bind"))?;
        let beats = ctx.counter("heartbeat.beats", &[]);
        ctx.tasks().register_thread("heartbeat", move |stop| {
            while !stop.is_stopped() {
                beats.increment();
                std::thread::sleep(Duration::from_millis(500));
            }
            info!(beats = beats.value(), "heartbeat stopped");
            Ok(())
        })?;
        self.cell.mark_started();
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.cell.mark_stopped();
        Ok(())
    }

    fn status(&self) -> ResourceStatus {
        self.cell.status()
    }
}

/// Settings used when no settings file is configured.
fn local_settings(config: &RuntimeConfig) -> SettingsTree {
    let root = SettingKey::new(&config.settings_root);
    let mut tree = SettingsTree::new();
    tree.set(&root.join("deploy_name"), "local".into());
    tree.set(&root.join("resources.cache.capacity"), DEFAULT_CAPACITY.into());
    tree.set(
        &root.join("resources.status.restart_policy.resources.restart_resource_on_failure"),
        SettingValue::from(vec!["cache"]),
    );
    tree
}

fn describe() -> anyhow::Result<ServiceDescriptor> {
    let mut descriptor = ServiceDescriptor::new();
    descriptor
        .resource(
            "cache",
            Arc::new(Cache {
                cell: ResourceCell::new(),
                capacity: Arc::new(AtomicI64::new(DEFAULT_CAPACITY)),
            }),
            Vec::<String>::new(),
        )?
        .resource("heartbeat", Arc::new(Heartbeat::default()), Vec::<String>::new())?
        .resource("status", Arc::new(StatusMonitor::new()), ["cache", "heartbeat"])?;
    Ok(descriptor)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let config = RuntimeConfig::from(RuntimeArgs::parse());
    if let Err(error) = telemetry::init(&config) {
        eprintln!("demo-service: {error}");
        return ExitCode::FAILURE;
    }

    let settings = if config.settings_file.is_some() {
        SettingsStore::from_config(&config)
    } else {
        SettingsStore::from_config(&config)
            .with_backend(Arc::new(MemoryBackend::from_tree(local_settings(&config))))
    };
    let ctx = Arc::new(ServiceContext::with_settings(config, settings));

    let descriptor = match describe() {
        Ok(descriptor) => descriptor,
        Err(error) => {
            tracing::error!(error = %error, "invalid service definition");
            return ExitCode::FAILURE;
        }
    };
    run_service(ctx, descriptor).await
}
