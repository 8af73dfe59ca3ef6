use std::fmt;

use serde::{Deserialize, Serialize};

/// Dot-delimited path into a settings tree (`"system.resources.http.port"`).
///
/// Empty segments are dropped on construction, so `".a..b."` and `"a.b"` name
/// the same key. The empty key addresses the root of the tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct SettingKey {
    segments: Vec<String>,
}

impl SettingKey {
    /// Parses a dotted key.
    #[must_use]
    pub fn new(key: &str) -> Self {
        Self {
            segments: key
                .split('.')
                .filter(|segment| !segment.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    /// The root key (no segments).
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Path segments in order.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment, if any.
    #[must_use]
    pub fn leaf(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The key one level up, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Appends a (possibly dotted) suffix.
    #[must_use]
    pub fn join(&self, suffix: &str) -> Self {
        let mut joined = self.clone();
        joined
            .segments
            .extend(Self::new(suffix).segments);
        joined
    }

    /// Returns `true` if `self` equals `other` or lies below it.
    #[must_use]
    pub fn starts_with(&self, other: &Self) -> bool {
        self.segments.starts_with(&other.segments)
    }

    /// Segments of `self` below `ancestor`, or `None` if `ancestor` is not a
    /// prefix of `self`.
    #[must_use]
    pub fn strip_prefix(&self, ancestor: &Self) -> Option<Self> {
        self.segments
            .strip_prefix(ancestor.segments.as_slice())
            .map(|rest| Self {
                segments: rest.to_vec(),
            })
    }

    /// Native path form used by hierarchical stores: `/a/b/c`.
    #[must_use]
    pub fn to_backend_path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    /// Inverse of [`to_backend_path`](Self::to_backend_path).
    #[must_use]
    pub fn from_backend_path(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

impl From<&str> for SettingKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for SettingKey {
    fn from(key: String) -> Self {
        Self::new(&key)
    }
}

impl From<&String> for SettingKey {
    fn from(key: &String) -> Self {
        Self::new(key)
    }
}

impl From<&SettingKey> for SettingKey {
    fn from(key: &SettingKey) -> Self {
        key.clone()
    }
}

impl From<SettingKey> for String {
    fn from(key: SettingKey) -> Self {
        key.to_string()
    }
}
