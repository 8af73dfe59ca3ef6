use std::collections::BTreeMap;

use super::{SettingKey, SettingValue};

/// In-memory settings tree addressed by [`SettingKey`].
///
/// Used as the local cache of the settings store and as the storage of the
/// in-process backends. Writing a mapping onto an existing mapping deep-merges;
/// every other write replaces the addressed node.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsTree {
    root: BTreeMap<String, SettingValue>,
}

impl Default for SettingsTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: BTreeMap::new(),
        }
    }

    /// Creates a tree from a root mapping. A non-mapping value yields an empty
    /// tree.
    #[must_use]
    pub fn from_value(value: SettingValue) -> Self {
        match value {
            SettingValue::Map(root) => Self { root },
            _ => Self::new(),
        }
    }

    /// Snapshot of the whole tree as a mapping value.
    #[must_use]
    pub fn to_value(&self) -> SettingValue {
        SettingValue::Map(self.root.clone())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Returns the node at `key`, or `None` if any segment is missing or a
    /// scalar is found before the path ends.
    #[must_use]
    pub fn get(&self, key: &SettingKey) -> Option<&SettingValue> {
        let (first, rest) = key.segments().split_first()?;
        let mut node = self.root.get(first)?;
        for segment in rest {
            node = node.as_map()?.get(segment)?;
        }
        Some(node)
    }

    /// Returns `true` if a node exists at `key`.
    #[must_use]
    pub fn contains(&self, key: &SettingKey) -> bool {
        key.is_root() || self.get(key).is_some()
    }

    /// Writes `value` at `key`, creating intermediate mappings and replacing
    /// intermediate scalars. Mappings merge into existing mappings.
    ///
    /// Writing at the root merges a mapping into the whole tree; non-mapping
    /// values cannot be stored at the root and are ignored.
    pub fn set(&mut self, key: &SettingKey, value: SettingValue) {
        let Some((leaf, parents)) = key.segments().split_last() else {
            if let SettingValue::Map(update) = value {
                let mut root = SettingValue::Map(std::mem::take(&mut self.root));
                root.merge(SettingValue::Map(update));
                if let SettingValue::Map(merged) = root {
                    self.root = merged;
                }
            }
            return;
        };

        let mut node = &mut self.root;
        for segment in parents {
            let child = node
                .entry(segment.clone())
                .or_insert_with(SettingValue::empty_map);
            if !child.is_map() {
                *child = SettingValue::empty_map();
            }
            let SettingValue::Map(next) = child else {
                return;
            };
            node = next;
        }

        match node.get_mut(leaf) {
            Some(existing) => existing.merge(value),
            None => {
                node.insert(leaf.clone(), value);
            }
        }
    }

    /// Writes `value` at `key`, replacing whatever was there (no merge).
    pub fn replace(&mut self, key: &SettingKey, value: SettingValue) {
        self.remove(key);
        self.set(key, value);
    }

    /// Removes and returns the node at `key`. Removing the root clears the tree.
    pub fn remove(&mut self, key: &SettingKey) -> Option<SettingValue> {
        let Some((leaf, parents)) = key.segments().split_last() else {
            let root = std::mem::take(&mut self.root);
            return Some(SettingValue::Map(root));
        };

        let mut node = &mut self.root;
        for segment in parents {
            match node.get_mut(segment) {
                Some(SettingValue::Map(next)) => node = next,
                _ => return None,
            }
        }
        node.remove(leaf)
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.root.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> SettingKey {
        SettingKey::new(k)
    }

    #[test]
    fn set_then_get_nested_value() {
        let mut tree = SettingsTree::new();
        tree.set(&key("service.port"), 8080.into());
        assert_eq!(tree.get(&key("service.port")), Some(&SettingValue::Integer(8080)));
        assert!(tree.get(&key("service")).unwrap().is_map());
        assert_eq!(tree.get(&key("service.host")), None);
    }

    #[test]
    fn mapping_writes_deep_merge() {
        let mut tree = SettingsTree::new();
        tree.set(&key("a"), [("x", 1)].into_iter().collect());
        tree.set(&key("a"), [("y", 2)].into_iter().collect());
        let expected: SettingValue = [("x", 1), ("y", 2)].into_iter().collect();
        assert_eq!(tree.get(&key("a")), Some(&expected));
    }

    #[test]
    fn writing_below_a_scalar_replaces_it() {
        let mut tree = SettingsTree::new();
        tree.set(&key("a"), "flat".into());
        tree.set(&key("a.b"), true.into());
        assert_eq!(tree.get(&key("a.b")), Some(&SettingValue::Bool(true)));
    }

    #[test]
    fn get_through_scalar_is_none() {
        let mut tree = SettingsTree::new();
        tree.set(&key("a"), 1.into());
        assert_eq!(tree.get(&key("a.b")), None);
    }

    #[test]
    fn remove_returns_node_and_leaves_siblings() {
        let mut tree = SettingsTree::new();
        tree.set(&key("a.b"), 1.into());
        tree.set(&key("a.c"), 2.into());
        assert_eq!(tree.remove(&key("a.b")), Some(SettingValue::Integer(1)));
        assert_eq!(tree.get(&key("a.b")), None);
        assert_eq!(tree.get(&key("a.c")), Some(&SettingValue::Integer(2)));
        assert_eq!(tree.remove(&key("a.zzz")), None);
        assert_eq!(tree.remove(&key("missing.path")), None);
    }

    #[test]
    fn replace_discards_previous_mapping() {
        let mut tree = SettingsTree::new();
        tree.set(&key("a"), [("x", 1)].into_iter().collect());
        tree.replace(&key("a"), [("y", 2)].into_iter().collect());
        let expected: SettingValue = [("y", 2)].into_iter().collect();
        assert_eq!(tree.get(&key("a")), Some(&expected));
    }

    #[test]
    fn root_writes_merge_into_tree() {
        let mut tree = SettingsTree::new();
        tree.set(&key("a.b"), 1.into());
        let update: SettingValue = [("c", 2)].into_iter().collect();
        tree.set(&SettingKey::root(), update);
        assert!(tree.contains(&key("a.b")));
        assert!(tree.contains(&key("c")));
        assert!(tree.get(&SettingKey::root()).is_none());
    }
}
