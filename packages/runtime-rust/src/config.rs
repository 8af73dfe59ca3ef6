//! Runtime configuration for a Hearth service.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable single line output.
    #[default]
    Compact,
    /// Structured JSON, one object per event.
    Json,
}

/// Process-level configuration consumed by the service context and the
/// lifecycle coordinator.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Service name, used as the consumer of every resource settings view.
    pub service_name: String,
    /// Root key of the framework settings (`<root>.deploy_name`,
    /// `<root>.resources.<name>`).
    pub settings_root: String,
    /// JSON or TOML file loaded as the settings backend when none is injected.
    pub settings_file: Option<PathBuf>,
    /// Maximum number of concurrently running admitted cooperative tasks.
    pub task_limit: Option<usize>,
    /// How long `stop_all` waits for each OS thread to exit.
    pub thread_join_timeout: Duration,
    /// Forced-exit deadline for graceful shutdown.
    pub grace_period: Duration,
    /// Deadline for async signal handlers.
    pub signal_handler_timeout: Duration,
    /// Pause between attempts to re-establish a failed settings watch.
    pub watch_retry_backoff: Duration,
    /// Poll period of the status monitor.
    pub status_check_period: Duration,
    /// Fallback `EnvFilter` directive when `RUST_LOG` is unset.
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            service_name: "hearth-service".to_string(),
            settings_root: "system".to_string(),
            settings_file: None,
            task_limit: None,
            thread_join_timeout: Duration::from_secs(3),
            grace_period: Duration::from_secs(30),
            signal_handler_timeout: Duration::from_secs(5),
            watch_retry_backoff: Duration::from_secs(5),
            status_check_period: Duration::from_secs(1),
            log_filter: "info".to_string(),
            log_format: LogFormat::Compact,
        }
    }
}

impl RuntimeConfig {
    /// Config with the given service name and defaults elsewhere.
    #[must_use]
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }
}

/// Command-line flags with `HEARTH_*` environment fallbacks.
#[derive(Debug, Clone, Parser)]
#[command(name = "hearth", about = "Run a Hearth service", long_about = None)]
pub struct RuntimeArgs {
    #[arg(long, env = "HEARTH_SERVICE_NAME", default_value = "hearth-service")]
    pub service_name: String,

    #[arg(long, env = "HEARTH_SETTINGS_ROOT", default_value = "system")]
    pub settings_root: String,

    /// JSON or TOML settings file.
    #[arg(long, env = "HEARTH_SETTINGS_FILE")]
    pub settings_file: Option<PathBuf>,

    #[arg(long, env = "HEARTH_TASK_LIMIT")]
    pub task_limit: Option<usize>,

    #[arg(long, env = "HEARTH_THREAD_JOIN_TIMEOUT_MS", default_value_t = 3_000)]
    pub thread_join_timeout_ms: u64,

    #[arg(long, env = "HEARTH_GRACE_PERIOD_SECS", default_value_t = 30)]
    pub grace_period_secs: u64,

    #[arg(long, env = "HEARTH_SIGNAL_HANDLER_TIMEOUT_MS", default_value_t = 5_000)]
    pub signal_handler_timeout_ms: u64,

    #[arg(long, env = "HEARTH_WATCH_RETRY_BACKOFF_MS", default_value_t = 5_000)]
    pub watch_retry_backoff_ms: u64,

    #[arg(long, env = "HEARTH_STATUS_CHECK_PERIOD_MS", default_value_t = 1_000)]
    pub status_check_period_ms: u64,

    #[arg(long, env = "HEARTH_LOG_FILTER", default_value = "info")]
    pub log_filter: String,

    #[arg(long, env = "HEARTH_LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

impl From<RuntimeArgs> for RuntimeConfig {
    fn from(args: RuntimeArgs) -> Self {
        Self {
            service_name: args.service_name,
            settings_root: args.settings_root,
            settings_file: args.settings_file,
            task_limit: args.task_limit,
            thread_join_timeout: Duration::from_millis(args.thread_join_timeout_ms),
            grace_period: Duration::from_secs(args.grace_period_secs),
            signal_handler_timeout: Duration::from_millis(args.signal_handler_timeout_ms),
            watch_retry_backoff: Duration::from_millis(args.watch_retry_backoff_ms),
            status_check_period: Duration::from_millis(args.status_check_period_ms),
            log_filter: args.log_filter,
            log_format: args.log_format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_config_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.settings_root, "system");
        assert!(config.settings_file.is_none());
        assert!(config.task_limit.is_none());
        assert_eq!(config.thread_join_timeout, Duration::from_secs(3));
        assert_eq!(config.grace_period, Duration::from_secs(30));
        assert_eq!(config.signal_handler_timeout, Duration::from_secs(5));
        assert_eq!(config.watch_retry_backoff, Duration::from_secs(5));
        assert_eq!(config.status_check_period, Duration::from_secs(1));
        assert_eq!(config.log_format, LogFormat::Compact);
    }

    #[test]
    fn args_defaults_match_config_defaults() {
        let args = RuntimeArgs::try_parse_from(["hearth"]).unwrap();
        let from_args = RuntimeConfig::from(args);
        let defaults = RuntimeConfig::default();
        assert_eq!(from_args.service_name, defaults.service_name);
        assert_eq!(from_args.grace_period, defaults.grace_period);
        assert_eq!(from_args.thread_join_timeout, defaults.thread_join_timeout);
        assert_eq!(from_args.watch_retry_backoff, defaults.watch_retry_backoff);
    }

    #[test]
    fn args_override_fields() {
        let args = RuntimeArgs::try_parse_from([
            "hearth",
            "--service-name",
            "billing",
            "--task-limit",
            "4",
            "--log-format",
            "json",
            "--settings-file",
            "/etc/billing.toml",
        ])
        .unwrap();
        let config = RuntimeConfig::from(args);
        assert_eq!(config.service_name, "billing");
        assert_eq!(config.task_limit, Some(4));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.settings_file, Some(PathBuf::from("/etc/billing.toml")));
    }
}
