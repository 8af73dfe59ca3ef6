//! In-process authoritative backend with change notification.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use hearth_core::{SettingKey, SettingValue, SettingsTree};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::backend::{SettingsBackend, WatchEvent, WatchStream};
use super::BackendError;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// A committed write or delete, as published on the change channel.
#[derive(Debug, Clone)]
struct Mutation {
    key: SettingKey,
    value: Option<SettingValue>,
    previous: Option<SettingValue>,
}

impl Mutation {
    /// Converts the mutation into the event seen by a watcher of `watched`.
    ///
    /// Mutations at or below the watched key are reported as-is. Mutations of
    /// an ancestor are projected onto the watched key. Unrelated mutations
    /// yield `None`.
    fn project_onto(&self, watched: &SettingKey) -> Option<WatchEvent> {
        if self.key.starts_with(watched) {
            return Some(WatchEvent {
                key: self.key.clone(),
                value: self.value.clone(),
                previous: self.previous.clone(),
            });
        }
        let suffix = watched.strip_prefix(&self.key)?;
        let value = descend(self.value.as_ref(), &suffix);
        let previous = descend(self.previous.as_ref(), &suffix);
        if value.is_none() && previous.is_none() {
            return None;
        }
        Some(WatchEvent {
            key: watched.clone(),
            value,
            previous,
        })
    }
}

fn descend(value: Option<&SettingValue>, suffix: &SettingKey) -> Option<SettingValue> {
    let mut node = value?;
    for segment in suffix.segments() {
        node = node.as_map()?.get(segment)?;
    }
    Some(node.clone())
}

/// Settings backend that keeps the authoritative tree in memory.
///
/// Every committed mutation is broadcast to watchers. Keys written with a TTL
/// are purged lazily on the next access after they expire, which watchers
/// observe as a deletion.
pub struct MemoryBackend {
    tree: RwLock<SettingsTree>,
    expiries: Mutex<HashMap<SettingKey, Instant>>,
    changes: broadcast::Sender<Mutation>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::from_tree(SettingsTree::new())
    }

    /// Backend seeded with an existing tree.
    #[must_use]
    pub fn from_tree(tree: SettingsTree) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            tree: RwLock::new(tree),
            expiries: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// Snapshot of the whole tree.
    #[must_use]
    pub fn snapshot(&self) -> SettingValue {
        self.tree.read().to_value()
    }

    fn publish(&self, mutation: Mutation) {
        // No receivers is not an error.
        let _ = self.changes.send(mutation);
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        let expired: Vec<SettingKey> = {
            let mut expiries = self.expiries.lock();
            let keys: Vec<SettingKey> = expiries
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                expiries.remove(key);
            }
            keys
        };

        for key in expired {
            let previous = self.tree.write().remove(&key);
            if previous.is_some() {
                tracing::debug!(key = %key, "setting expired");
                self.publish(Mutation {
                    key,
                    value: None,
                    previous,
                });
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettingsBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &SettingKey) -> Result<Option<SettingValue>, BackendError> {
        self.purge_expired();
        let tree = self.tree.read();
        if key.is_root() {
            return Ok(Some(tree.to_value()));
        }
        Ok(tree.get(key).cloned())
    }

    async fn set(
        &self,
        key: &SettingKey,
        value: SettingValue,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        self.purge_expired();
        let (previous, current) = {
            let mut tree = self.tree.write();
            let previous = tree.get(key).cloned();
            tree.set(key, value);
            (previous, tree.get(key).cloned())
        };

        {
            let mut expiries = self.expiries.lock();
            match ttl {
                Some(ttl) => {
                    expiries.insert(key.clone(), Instant::now() + ttl);
                }
                None => {
                    expiries.remove(key);
                }
            }
        }

        self.publish(Mutation {
            key: key.clone(),
            value: current,
            previous,
        });
        Ok(())
    }

    async fn delete(&self, key: &SettingKey) -> Result<(), BackendError> {
        self.purge_expired();
        let previous = self
            .tree
            .write()
            .remove(key)
            .ok_or_else(|| BackendError::NotFound(key.clone()))?;
        self.expiries
            .lock()
            .retain(|expiring, _| !expiring.starts_with(key));
        self.publish(Mutation {
            key: key.clone(),
            value: None,
            previous: Some(previous),
        });
        Ok(())
    }

    fn supports_watch(&self) -> bool {
        true
    }

    async fn watch(&self, key: &SettingKey) -> Result<WatchStream, BackendError> {
        let receiver = self.changes.subscribe();
        let watched = key.clone();
        let events = stream::unfold(receiver, move |mut receiver| {
            let watched = watched.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(mutation) => {
                            if let Some(event) = mutation.project_onto(&watched) {
                                return Some((Ok(event), receiver));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            return Some((Err(BackendError::Lagged(skipped)), receiver));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(events.boxed())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> SettingKey {
        SettingKey::new(k)
    }

    #[tokio::test]
    async fn set_get_delete() {
        let backend = MemoryBackend::new();
        backend.set(&key("a.b"), 1.into(), None).await.unwrap();
        assert_eq!(backend.get(&key("a.b")).await.unwrap(), Some(1.into()));
        backend.delete(&key("a.b")).await.unwrap();
        assert_eq!(backend.get(&key("a.b")).await.unwrap(), None);
        assert!(matches!(
            backend.delete(&key("a.b")).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn watcher_sees_own_key_and_descendants() {
        let backend = MemoryBackend::new();
        let mut events = backend.watch(&key("svc")).await.unwrap();

        backend.set(&key("svc.port"), 80.into(), None).await.unwrap();
        backend.set(&key("other"), 1.into(), None).await.unwrap();
        backend.delete(&key("svc.port")).await.unwrap();

        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.key, key("svc.port"));
        assert_eq!(first.value, Some(80.into()));
        assert_eq!(first.previous, None);

        let second = events.next().await.unwrap().unwrap();
        assert_eq!(second.key, key("svc.port"));
        assert_eq!(second.value, None);
        assert_eq!(second.previous, Some(80.into()));
    }

    #[tokio::test]
    async fn ancestor_writes_are_projected_onto_watched_key() {
        let backend = MemoryBackend::new();
        let mut events = backend.watch(&key("svc.port")).await.unwrap();

        let update: SettingValue = [("port", 8080)].into_iter().collect();
        backend.set(&key("svc"), update, None).await.unwrap();

        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.key, key("svc.port"));
        assert_eq!(event.value, Some(8080.into()));
    }

    #[tokio::test]
    async fn rewriting_same_value_is_a_noop_event() {
        let backend = MemoryBackend::new();
        backend.set(&key("k"), "v".into(), None).await.unwrap();
        let mut events = backend.watch(&key("k")).await.unwrap();
        backend.set(&key("k"), "v".into(), None).await.unwrap();
        assert!(events.next().await.unwrap().unwrap().is_noop());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_reads_as_absent_and_notifies() {
        let backend = MemoryBackend::new();
        backend
            .set(&key("lease"), true.into(), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        let mut events = backend.watch(&key("lease")).await.unwrap();

        assert_eq!(backend.get(&key("lease")).await.unwrap(), Some(true.into()));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(backend.get(&key("lease")).await.unwrap(), None);

        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.value, None);
        assert_eq!(event.previous, Some(true.into()));
    }
}
