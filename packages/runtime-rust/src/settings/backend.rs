use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use hearth_core::{SettingKey, SettingValue};

use super::BackendError;

/// A change reported by a watching backend.
///
/// `key` is the key whose value changed, which may lie below the watched key.
/// `value` is `None` when the key was deleted or expired.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub key: SettingKey,
    pub value: Option<SettingValue>,
    pub previous: Option<SettingValue>,
}

impl WatchEvent {
    /// `true` if the notification carries no actual change.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.value == self.previous
    }
}

/// Stream of changes under a watched key. An `Err` item ends the current
/// subscription; the caller re-establishes it.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, BackendError>>;

/// Contract every authoritative settings source satisfies.
///
/// The store keeps a local cache in front of the backend: reads fall through
/// to `get` on a cache miss, writes go to the cache first and then to `set`.
#[async_trait]
pub trait SettingsBackend: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Value at `key`, or `None` if absent.
    async fn get(&self, key: &SettingKey) -> Result<Option<SettingValue>, BackendError>;

    /// Writes `value` at `key`, expiring it after `ttl` if the backend supports
    /// expiry.
    async fn set(
        &self,
        key: &SettingKey,
        value: SettingValue,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError>;

    /// Removes `key`. A missing key yields [`BackendError::NotFound`].
    async fn delete(&self, key: &SettingKey) -> Result<(), BackendError>;

    /// Whether [`watch`](Self::watch) is available.
    fn supports_watch(&self) -> bool {
        false
    }

    /// Subscribes to changes at or below `key`.
    async fn watch(&self, key: &SettingKey) -> Result<WatchStream, BackendError> {
        let _ = key;
        Err(BackendError::Unsupported("watch"))
    }
}
