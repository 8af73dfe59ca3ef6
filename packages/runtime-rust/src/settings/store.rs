//! Layered settings store: local cache in front of an optional authoritative
//! backend, with promised settings and per-key watch loops.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use hearth_core::{Promise, SettingKey, SettingValue, SettingsTree};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::SettingsBackend;
use super::file::FileBackend;
use super::promised::PromisedSetting;
use super::watch::{run_watch_loop, watch_callback, CallbackList, WatchCallback};
use super::{BackendError, SettingsError};
use crate::config::RuntimeConfig;

/// One watch loop and the callbacks it serves.
struct WatchEntry {
    callbacks: CallbackList,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Settings store shared by every resource of a service.
///
/// Reads are served from the local cache and fall through to the backend on a
/// miss, populating the cache. Writes hit the cache first, then the backend,
/// so a writer always reads back its own value.
pub struct SettingsStore {
    cache: RwLock<SettingsTree>,
    backend: RwLock<Option<Arc<dyn SettingsBackend>>>,
    settings_file: Option<PathBuf>,
    retry_backoff: Duration,
    promises: Mutex<Vec<PromisedSetting>>,
    started: AtomicBool,
    watches: Mutex<HashMap<SettingKey, WatchEntry>>,
}

impl SettingsStore {
    /// Store with no backend and the default watch retry backoff.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(SettingsTree::new()),
            backend: RwLock::new(None),
            settings_file: None,
            retry_backoff: RuntimeConfig::default().watch_retry_backoff,
            promises: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Store configured from the runtime config: settings file and backoff.
    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            settings_file: config.settings_file.clone(),
            retry_backoff: config.watch_retry_backoff,
            ..Self::new()
        }
    }

    /// Uses `backend` as the authoritative source.
    #[must_use]
    pub fn with_backend(self, backend: Arc<dyn SettingsBackend>) -> Self {
        *self.backend.write() = Some(backend);
        self
    }

    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Replaces the backend. Running watch loops keep the previous one.
    pub fn set_backend(&self, backend: Arc<dyn SettingsBackend>) {
        *self.backend.write() = Some(backend);
    }

    #[must_use]
    pub fn backend(&self) -> Option<Arc<dyn SettingsBackend>> {
        self.backend.read().clone()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Returns the value at `key`.
    ///
    /// # Errors
    ///
    /// [`SettingsError::NotFound`] if neither the cache nor the backend has the
    /// key, [`SettingsError::Backend`] if the backend read fails.
    pub async fn get(&self, key: impl Into<SettingKey>) -> Result<SettingValue, SettingsError> {
        let key = key.into();
        let cached = self.cache.read().get(&key).cloned();
        if let Some(value) = cached {
            return Ok(value);
        }

        let Some(backend) = self.backend() else {
            return Err(SettingsError::NotFound(key));
        };
        match backend.get(&key).await? {
            Some(value) => {
                self.cache.write().set(&key, value.clone());
                Ok(value)
            }
            None => Err(SettingsError::NotFound(key)),
        }
    }

    /// Like [`get`](Self::get), but a missing key yields `default`.
    ///
    /// # Errors
    ///
    /// Backend failures are still returned.
    pub async fn get_or(
        &self,
        key: impl Into<SettingKey>,
        default: impl Into<SettingValue>,
    ) -> Result<SettingValue, SettingsError> {
        match self.get(key).await {
            Err(SettingsError::NotFound(_)) => Ok(default.into()),
            other => other,
        }
    }

    /// Reads `key` and decodes it into `T`.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), plus [`SettingsError::Decode`] on a shape mismatch.
    pub async fn get_as<T: DeserializeOwned>(
        &self,
        key: impl Into<SettingKey>,
    ) -> Result<T, SettingsError> {
        let key = key.into();
        let value = self.get(key.clone()).await?;
        value
            .decode()
            .map_err(|source| SettingsError::Decode { key, source })
    }

    /// Like [`get_as`](Self::get_as), but a missing key yields `default`.
    ///
    /// # Errors
    ///
    /// Backend and decode failures are still returned.
    pub async fn get_as_or<T: DeserializeOwned>(
        &self,
        key: impl Into<SettingKey>,
        default: T,
    ) -> Result<T, SettingsError> {
        match self.get_as(key).await {
            Err(SettingsError::NotFound(_)) => Ok(default),
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Writes `value` at `key`, deep-merging mappings.
    ///
    /// # Errors
    ///
    /// [`SettingsError::Backend`] if the backend write fails. The cache has
    /// already been updated at that point.
    pub async fn set(
        &self,
        key: impl Into<SettingKey>,
        value: impl Into<SettingValue>,
    ) -> Result<(), SettingsError> {
        self.set_with_ttl(key, value, None).await
    }

    /// [`set`](Self::set) with an expiry forwarded to the backend.
    ///
    /// # Errors
    ///
    /// See [`set`](Self::set).
    pub async fn set_with_ttl(
        &self,
        key: impl Into<SettingKey>,
        value: impl Into<SettingValue>,
        ttl: Option<Duration>,
    ) -> Result<(), SettingsError> {
        let key = key.into();
        let value = value.into();
        self.cache.write().set(&key, value.clone());
        if let Some(backend) = self.backend() {
            backend.set(&key, value, ttl).await?;
        }
        Ok(())
    }

    /// Serializes `value` and writes it at `key`.
    ///
    /// # Errors
    ///
    /// [`SettingsError::Decode`] if `value` has no settings representation,
    /// otherwise as [`set`](Self::set).
    pub async fn set_as<T: Serialize>(
        &self,
        key: impl Into<SettingKey>,
        value: &T,
    ) -> Result<(), SettingsError> {
        let key = key.into();
        let value = SettingValue::encode(value).map_err(|source| SettingsError::Decode {
            key: key.clone(),
            source,
        })?;
        self.set(key, value).await
    }

    /// Removes `key` from the cache and the backend. A key missing from either
    /// layer is not an error.
    ///
    /// # Errors
    ///
    /// [`SettingsError::Backend`] for backend failures other than a missing key.
    pub async fn delete(&self, key: impl Into<SettingKey>) -> Result<(), SettingsError> {
        let key = key.into();
        self.cache.write().remove(&key);
        if let Some(backend) = self.backend() {
            match backend.delete(&key).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    /// Cache-only write used to mirror remote changes without writing them
    /// back. `None` removes the key.
    pub fn update_internal_settings(&self, key: impl Into<SettingKey>, value: Option<SettingValue>) {
        let key = key.into();
        let mut cache = self.cache.write();
        match value {
            Some(value) => cache.set(&key, value),
            None => {
                cache.remove(&key);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Watches
    // -----------------------------------------------------------------------

    /// Subscribes `callback` to changes of `key`.
    ///
    /// The first subscription to a key opens the backend watch before
    /// returning and hands it to a new watch loop, so every change committed
    /// after this call completes is delivered. Later subscriptions are
    /// appended and called in subscription order. Without a backend that
    /// supports change notification this only logs a warning.
    pub async fn watch<F, Fut>(&self, key: impl Into<SettingKey>, callback: F)
    where
        F: Fn(SettingKey, Option<SettingValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.watch_with(key.into(), watch_callback(callback)).await;
    }

    pub(crate) async fn watch_with(&self, key: SettingKey, callback: WatchCallback) {
        let backend = match self.backend() {
            Some(backend) if backend.supports_watch() => backend,
            Some(backend) => {
                warn!(key = %key, backend = backend.name(), "settings backend cannot watch, ignoring subscription");
                return;
            }
            None => {
                warn!(key = %key, "no settings backend configured, ignoring watch");
                return;
            }
        };

        {
            let watches = self.watches.lock();
            if let Some(entry) = watches.get(&key) {
                entry.callbacks.write().push(callback);
                return;
            }
        }

        let initial = backend.watch(&key).await;

        let mut watches = self.watches.lock();
        // Another subscriber may have opened the loop while we awaited.
        if let Some(entry) = watches.get(&key) {
            entry.callbacks.write().push(callback);
            return;
        }
        let callbacks: CallbackList = Arc::new(RwLock::new(vec![callback]));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watch_loop(
            backend,
            key.clone(),
            initial,
            Arc::clone(&callbacks),
            cancel.clone(),
            self.retry_backoff,
        ));
        watches.insert(
            key,
            WatchEntry {
                callbacks,
                cancel,
                handle,
            },
        );
    }

    /// Watches `key` and mirrors every change into the cache.
    pub async fn watch_and_update(self: &Arc<Self>, key: impl Into<SettingKey>) {
        let store: Weak<Self> = Arc::downgrade(self);
        self.watch(key, move |changed, value| {
            let store = store.clone();
            async move {
                if let Some(store) = store.upgrade() {
                    debug!(key = %changed, "mirroring watched setting into cache");
                    store.update_internal_settings(changed, value);
                }
            }
        })
        .await;
    }

    /// Keys with an active watch loop.
    #[must_use]
    pub fn watched_keys(&self) -> Vec<SettingKey> {
        let mut keys: Vec<SettingKey> = self.watches.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    // -----------------------------------------------------------------------
    // Promises
    // -----------------------------------------------------------------------

    /// Registers a forward reference to `key`, resolved once by
    /// [`start`](Self::start).
    ///
    /// A promise registered after start is never resolved.
    pub fn register_promise(&self, key: impl Into<SettingKey>) -> PromisedSetting {
        let promised = PromisedSetting::new(key.into(), Promise::new());
        if self.is_started() {
            warn!(key = %promised.key(), "promise registered after settings start, it will never resolve");
            return promised;
        }
        self.promises.lock().push(promised.clone());
        promised
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Installs the configured file backend when none was injected, then
    /// resolves every registered promise.
    ///
    /// # Errors
    ///
    /// [`SettingsError::Backend`] if the settings file cannot be loaded.
    /// Promise resolution failures are logged, never returned.
    pub async fn start(&self) -> Result<(), SettingsError> {
        if self.backend().is_none() {
            match &self.settings_file {
                Some(path) => {
                    let backend = FileBackend::open(path.clone())?;
                    self.set_backend(Arc::new(backend));
                }
                None => warn!("no settings backend configured, only the local cache is available"),
            }
        }

        self.started.store(true, Ordering::Release);
        let promises = std::mem::take(&mut *self.promises.lock());
        let total = promises.len();
        let mut resolved = 0_usize;
        for promised in promises {
            match self.get(promised.key().clone()).await {
                Ok(value) => match promised.resolve(value) {
                    Ok(()) => resolved += 1,
                    Err(error) => warn!(key = %promised.key(), error = %error, "promise not resolved"),
                },
                Err(error) => {
                    warn!(key = %promised.key(), error = %error, "cannot resolve promised setting");
                }
            }
        }
        info!(resolved, total, "settings started");
        Ok(())
    }

    /// Cancels and awaits every watch loop.
    pub async fn stop(&self) {
        let entries: Vec<(SettingKey, WatchEntry)> = self.watches.lock().drain().collect();
        for (_, entry) in &entries {
            entry.cancel.cancel();
        }
        for (key, entry) in entries {
            if let Err(error) = entry.handle.await {
                warn!(key = %key, error = %error, "watch loop ended abnormally");
            }
        }
        debug!("settings stopped");
    }

    /// Forgets cached values, pending promises and watch loops.
    pub fn clear(&self) {
        self.cache.write().clear();
        self.promises.lock().clear();
        for (_, entry) in self.watches.lock().drain() {
            entry.cancel.cancel();
            entry.handle.abort();
        }
        self.started.store(false, Ordering::Release);
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsStore")
            .field("backend", &self.backend().map(|b| b.name()))
            .field("started", &self.is_started())
            .field("watches", &self.watches.lock().len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
