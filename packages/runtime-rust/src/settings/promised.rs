use hearth_core::{Promise, PromiseError, SettingKey, SettingValue};
use serde::de::DeserializeOwned;

use super::SettingsError;

/// Forward reference to a setting, resolved once when the store starts.
///
/// After resolution the value is fixed; later writes to the key are not
/// reflected. Pair it with a watch to follow changes.
#[derive(Debug, Clone)]
pub struct PromisedSetting {
    key: SettingKey,
    promise: Promise<SettingValue>,
}

impl PromisedSetting {
    pub(crate) fn new(key: SettingKey, promise: Promise<SettingValue>) -> Self {
        Self { key, promise }
    }

    #[must_use]
    pub fn key(&self) -> &SettingKey {
        &self.key
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.promise.is_resolved()
    }

    /// The resolved value.
    ///
    /// # Errors
    ///
    /// [`SettingsError::NotLoadedYet`] until the store has resolved it.
    pub fn get(&self) -> Result<&SettingValue, SettingsError> {
        self.promise
            .get()
            .map_err(|_| SettingsError::NotLoadedYet(self.key.clone()))
    }

    /// The resolved value decoded into `T`.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), plus [`SettingsError::Decode`].
    pub fn get_as<T: DeserializeOwned>(&self) -> Result<T, SettingsError> {
        self.get()?.decode().map_err(|source| SettingsError::Decode {
            key: self.key.clone(),
            source,
        })
    }

    pub(crate) fn resolve(&self, value: SettingValue) -> Result<(), PromiseError> {
        self.promise.resolve(value)
    }
}
