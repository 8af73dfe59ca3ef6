use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

/// Identity of an interned handle: an id plus a normalized label set.
///
/// Labels are kept in a `BTreeMap`, so the order in which they are supplied
/// does not affect identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlyweightKey {
    pub id: String,
    pub labels: BTreeMap<String, String>,
}

impl FlyweightKey {
    pub fn new<K, V>(id: impl Into<String>, labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            id: id.into(),
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl fmt::Display for FlyweightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)?;
        if !self.labels.is_empty() {
            let labels: Vec<String> = self
                .labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, "{{{}}}", labels.join(","))?;
        }
        Ok(())
    }
}

/// Registry of interned handles.
///
/// Asking twice for the same [`FlyweightKey`] returns the same `Arc`; identity
/// is the registry entry, not value equality.
pub struct FlyweightRegistry<T> {
    entries: DashMap<FlyweightKey, Arc<T>>,
}

impl<T> FlyweightRegistry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Returns the handle for `key`, creating it with `init` on first use.
    pub fn get_or_insert_with(&self, key: FlyweightKey, init: impl FnOnce() -> T) -> Arc<T> {
        Arc::clone(
            self.entries
                .entry(key)
                .or_insert_with(|| Arc::new(init()))
                .value(),
        )
    }

    /// Returns the handle for `key` if it has been created.
    #[must_use]
    pub fn get(&self, key: &FlyweightKey) -> Option<Arc<T>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of all entries, sorted by key.
    #[must_use]
    pub fn entries(&self) -> Vec<(FlyweightKey, Arc<T>)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry. Handles already given out stay valid but are no
    /// longer shared with new lookups.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl<T: Default> FlyweightRegistry<T> {
    /// Shorthand for [`get_or_insert_with`](Self::get_or_insert_with) using
    /// `T::default`.
    pub fn handle<K, V>(&self, id: &str, labels: impl IntoIterator<Item = (K, V)>) -> Arc<T>
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.get_or_insert_with(FlyweightKey::new(id, labels), T::default)
    }
}

impl<T> Default for FlyweightRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for FlyweightRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlyweightRegistry")
            .field("len", &self.entries.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::Counter;
    use super::*;

    #[test]
    fn same_key_yields_same_handle() {
        let registry: FlyweightRegistry<Counter> = FlyweightRegistry::new();
        let a = registry.handle("requests", [("route", "/a"), ("method", "GET")]);
        let b = registry.handle("requests", [("method", "GET"), ("route", "/a")]);
        assert!(Arc::ptr_eq(&a, &b));

        a.increment();
        assert_eq!(b.value(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn different_labels_yield_distinct_handles() {
        let registry: FlyweightRegistry<Counter> = FlyweightRegistry::new();
        let a = registry.handle("requests", [("route", "/a")]);
        let b = registry.handle("requests", [("route", "/b")]);
        let bare = registry.handle("requests", Vec::<(String, String)>::new());
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &bare));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn clear_forgets_entries() {
        let registry: FlyweightRegistry<Counter> = FlyweightRegistry::new();
        let before = registry.handle("x", [("k", "v")]);
        registry.clear();
        assert!(registry.is_empty());
        let after = registry.handle("x", [("k", "v")]);
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn key_display_lists_sorted_labels() {
        let key = FlyweightKey::new("tasks.started", [("kind", "thread"), ("a", "1")]);
        assert_eq!(key.to_string(), "tasks.started{a=1,kind=thread}");
        assert_eq!(FlyweightKey::new("x", Vec::<(&str, &str)>::new()).to_string(), "x");
    }
}
