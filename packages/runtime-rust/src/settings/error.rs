use hearth_core::{ConvertError, SettingKey};

/// Errors reported by a [`SettingsBackend`](super::SettingsBackend).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("key not found in backend: {0}")]
    NotFound(SettingKey),
    #[error("backend does not support {0}")]
    Unsupported(&'static str),
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse settings document: {0}")]
    Parse(String),
    #[error("watch stream lagged, {0} notifications dropped")]
    Lagged(u64),
    #[error("watch stream closed")]
    Closed,
}

/// Errors surfaced by the settings store, its views and promised settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("setting not found: {0}")]
    NotFound(SettingKey),
    #[error("setting {0} is not loaded yet")]
    NotLoadedYet(SettingKey),
    #[error("setting {key} has an unexpected shape: {source}")]
    Decode {
        key: SettingKey,
        #[source]
        source: ConvertError,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl SettingsError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
