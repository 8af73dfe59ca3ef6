use std::future::Future;
use std::sync::Arc;

use hearth_core::{SettingKey, SettingValue};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::promised::PromisedSetting;
use super::watch::watch_callback;
use super::{SettingsError, SettingsStore};

/// Prefix- and consumer-scoped facade over a [`SettingsStore`].
///
/// With prefix `p0.p1…pn` and consumer `c`, reads first try the consumer path
/// `p0.microservices.c.p1…pn.<key>` and fall back to the general path
/// `p0.p1…pn.<key>`. Writes and deletes always target the general path.
#[derive(Debug, Clone)]
pub struct SettingsView {
    store: Arc<SettingsStore>,
    prefix: SettingKey,
    consumer: Option<String>,
}

impl SettingsView {
    pub fn new(
        store: Arc<SettingsStore>,
        prefix: impl Into<SettingKey>,
        consumer: Option<String>,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            consumer,
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &SettingKey {
        &self.prefix
    }

    #[must_use]
    pub fn consumer(&self) -> Option<&str> {
        self.consumer.as_deref()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SettingsStore> {
        &self.store
    }

    /// View narrowed to `sub` below the current prefix, same consumer.
    #[must_use]
    pub fn scoped(&self, sub: &str) -> Self {
        Self {
            store: Arc::clone(&self.store),
            prefix: self.prefix.join(sub),
            consumer: self.consumer.clone(),
        }
    }

    /// Absolute general key for `key`.
    #[must_use]
    pub fn general_key(&self, key: &str) -> SettingKey {
        self.prefix.join(key)
    }

    /// Absolute consumer-specific key for `key`, if the view has a consumer.
    #[must_use]
    pub fn consumer_key(&self, key: &str) -> Option<SettingKey> {
        let consumer = self.consumer.as_deref()?;
        let segments = self.prefix.segments();
        let scoped = match segments.split_first() {
            Some((head, rest)) => SettingKey::new(head)
                .join("microservices")
                .join(consumer)
                .join(&rest.join(".")),
            None => SettingKey::new("microservices").join(consumer),
        };
        Some(scoped.join(key))
    }

    /// Value at `key`, consumer path first.
    ///
    /// # Errors
    ///
    /// [`SettingsError::NotFound`] if neither path has a value; backend
    /// failures on the consumer path are returned without trying the general
    /// one.
    pub async fn get(&self, key: &str) -> Result<SettingValue, SettingsError> {
        if let Some(consumer_key) = self.consumer_key(key) {
            match self.store.get(consumer_key).await {
                Err(SettingsError::NotFound(_)) => {}
                other => return other,
            }
        }
        self.store.get(self.general_key(key)).await
    }

    /// # Errors
    ///
    /// Backend failures.
    pub async fn get_or(
        &self,
        key: &str,
        default: impl Into<SettingValue>,
    ) -> Result<SettingValue, SettingsError> {
        match self.get(key).await {
            Err(SettingsError::NotFound(_)) => Ok(default.into()),
            other => other,
        }
    }

    /// # Errors
    ///
    /// As [`get`](Self::get), plus [`SettingsError::Decode`].
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, SettingsError> {
        let value = self.get(key).await?;
        value.decode().map_err(|source| SettingsError::Decode {
            key: self.general_key(key),
            source,
        })
    }

    /// # Errors
    ///
    /// Backend and decode failures.
    pub async fn get_as_or<T: DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, SettingsError> {
        match self.get_as(key).await {
            Err(SettingsError::NotFound(_)) => Ok(default),
            other => other,
        }
    }

    /// Writes at the general path.
    ///
    /// # Errors
    ///
    /// Backend failures.
    pub async fn set(&self, key: &str, value: impl Into<SettingValue>) -> Result<(), SettingsError> {
        self.store.set(self.general_key(key), value).await
    }

    /// Deletes at the general path.
    ///
    /// # Errors
    ///
    /// Backend failures.
    pub async fn delete(&self, key: &str) -> Result<(), SettingsError> {
        self.store.delete(self.general_key(key)).await
    }

    /// Subscribes `callback` to both the consumer and the general path.
    pub async fn watch<F, Fut>(&self, key: &str, callback: F)
    where
        F: Fn(SettingKey, Option<SettingValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback = watch_callback(callback);
        if let Some(consumer_key) = self.consumer_key(key) {
            self.store.watch_with(consumer_key, Arc::clone(&callback)).await;
        }
        self.store.watch_with(self.general_key(key), callback).await;
    }

    /// Promise for the general path of `key`.
    pub fn register_promise(&self, key: &str) -> PromisedSetting {
        self.store.register_promise(self.general_key(key))
    }

    /// Reads an absolute key, ignoring prefix and consumer.
    ///
    /// # Errors
    ///
    /// See [`SettingsStore::get`].
    pub async fn get_raw(&self, key: &str) -> Result<SettingValue, SettingsError> {
        self.store.get(key).await
    }

    /// # Errors
    ///
    /// See [`SettingsStore::set`].
    pub async fn set_raw(&self, key: &str, value: impl Into<SettingValue>) -> Result<(), SettingsError> {
        self.store.set(key, value).await
    }

    /// # Errors
    ///
    /// See [`SettingsStore::delete`].
    pub async fn delete_raw(&self, key: &str) -> Result<(), SettingsError> {
        self.store.delete(key).await
    }

    /// Watches an absolute key, ignoring prefix and consumer.
    pub async fn watch_raw<F, Fut>(&self, key: &str, callback: F)
    where
        F: Fn(SettingKey, Option<SettingValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.store.watch(key, callback).await;
    }

    /// Cache-only write of an absolute key. `None` removes it.
    pub fn update_internal_settings(&self, key: &str, value: Option<SettingValue>) {
        self.store.update_internal_settings(key, value);
        debug!(key, "internal setting updated");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
