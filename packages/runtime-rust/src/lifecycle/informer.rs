//! Startup report of the environment a service runs in.

use serde::Serialize;
use tracing::info;

use crate::context::ServiceContext;

/// Reported as the container id outside a container.
pub const NOT_IN_CONTAINER: &str = "not_in_container";

/// Process and platform facts logged once settings are loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentInfo {
    pub service: String,
    pub instance_id: String,
    pub deploy_name: String,
    pub process_id: u32,
    /// `HOSTNAME` as set by container runtimes.
    pub container_id: String,
    pub os: &'static str,
    pub arch: &'static str,
    pub executable: Option<String>,
    pub runtime_version: &'static str,
}

impl EnvironmentInfo {
    #[must_use]
    pub fn collect(ctx: &ServiceContext) -> Self {
        Self {
            service: ctx.name().to_string(),
            instance_id: ctx.instance_id().to_string(),
            deploy_name: ctx.deploy_name(),
            process_id: std::process::id(),
            container_id: std::env::var("HOSTNAME").unwrap_or_else(|_| NOT_IN_CONTAINER.to_string()),
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            executable: std::env::current_exe()
                .ok()
                .map(|path| path.display().to_string()),
            runtime_version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn log(&self) {
        info!(
            service = %self.service,
            instance_id = %self.instance_id,
            deploy_name = %self.deploy_name,
            process_id = self.process_id,
            container_id = %self.container_id,
            os = self.os,
            arch = self.arch,
            executable = self.executable.as_deref().unwrap_or("unknown"),
            runtime_version = self.runtime_version,
            "environment information"
        );
    }
}
