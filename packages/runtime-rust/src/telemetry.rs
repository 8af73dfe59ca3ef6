//! Tracing subscriber installation.

use std::io::{self, IsTerminal};
use std::sync::OnceLock;

use tracing::subscriber::SetGlobalDefaultError;
use tracing::Subscriber;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, RuntimeConfig};

static TELEMETRY_INSTALLED: OnceLock<()> = OnceLock::new();

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(String),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] SetGlobalDefaultError),
}

/// Installs the global tracing subscriber on first call; later calls are
/// no-ops.
///
/// `RUST_LOG` takes precedence over [`RuntimeConfig::log_filter`].
///
/// # Errors
///
/// Returns [`TelemetryError`] if the filter does not parse or another global
/// subscriber is already installed.
pub fn init(config: &RuntimeConfig) -> Result<(), TelemetryError> {
    if TELEMETRY_INSTALLED.get().is_some() {
        return Ok(());
    }
    install_subscriber(config)?;
    let _ = TELEMETRY_INSTALLED.set(());
    Ok(())
}

fn build_filter(config: &RuntimeConfig) -> Result<EnvFilter, TelemetryError> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(&config.log_filter),
    }
    .map_err(|error| TelemetryError::Filter(error.to_string()))
}

fn install_subscriber(config: &RuntimeConfig) -> Result<(), TelemetryError> {
    let filter = build_filter(config)?;

    let builder = |filter: EnvFilter| {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_names(true)
            .with_writer(io::stderr)
            .with_ansi(io::stderr().is_terminal())
    };

    let subscriber: Box<dyn Subscriber + Send + Sync> = match config.log_format {
        LogFormat::Json => Box::new(builder(filter).json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder(filter).compact().finish()),
    };

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
