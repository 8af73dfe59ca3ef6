use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A configuration value: a scalar, a list, or a nested mapping.
///
/// Serializes untagged, so JSON and TOML documents map onto it directly.
/// Lists are treated as leaves: they are replaced wholesale, never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<SettingValue>),
    /// Nested mapping. `BTreeMap` keeps iteration and serialization stable.
    Map(BTreeMap<String, SettingValue>),
}

/// Failure converting between [`SettingValue`] and a typed value.
#[derive(Debug, thiserror::Error)]
#[error("cannot convert setting value: {0}")]
pub struct ConvertError(#[from] serde_json::Error);

impl SettingValue {
    /// An empty mapping.
    #[must_use]
    pub fn empty_map() -> Self {
        Self::Map(BTreeMap::new())
    }

    #[must_use]
    pub fn is_map(&self) -> bool {
        matches!(self, Self::Map(_))
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, SettingValue>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            #[allow(clippy::cast_precision_loss)]
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[SettingValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Deep-merges `update` into `self`.
    ///
    /// When both sides are mappings, keys present only in `self` are kept, keys
    /// present in `update` overwrite (recursively for nested mappings). Any other
    /// combination replaces `self` with `update`.
    pub fn merge(&mut self, update: SettingValue) {
        match (self, update) {
            (Self::Map(target), Self::Map(update)) => {
                for (key, value) in update {
                    match target.get_mut(&key) {
                        Some(existing) => existing.merge(value),
                        None => {
                            target.insert(key, value);
                        }
                    }
                }
            }
            (target, update) => *target = update,
        }
    }

    /// Converts into a typed value through serde.
    ///
    /// # Errors
    ///
    /// Returns [`ConvertError`] if the shape does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ConvertError> {
        let json = serde_json::to_value(self)?;
        Ok(serde_json::from_value(json)?)
    }

    /// Builds a value from any serializable type.
    ///
    /// # Errors
    ///
    /// Returns [`ConvertError`] for values with no settings representation
    /// (e.g. `null`).
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, ConvertError> {
        let json = serde_json::to_value(value)?;
        Ok(serde_json::from_value(json)?)
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for SettingValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u16> for SettingValue {
    fn from(value: u16) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for SettingValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl<T: Into<SettingValue>> From<Vec<T>> for SettingValue {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<String>, V: Into<SettingValue>> FromIterator<(K, V)> for SettingValue {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::Map(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, SettingValue)]) -> SettingValue {
        entries.iter().cloned().collect()
    }

    #[test]
    fn merge_preserves_existing_leaves() {
        let mut target = map(&[("x", 1.into())]);
        target.merge(map(&[("y", 2.into())]));
        assert_eq!(target, map(&[("x", 1.into()), ("y", 2.into())]));
    }

    #[test]
    fn merge_overwrites_conflicting_leaves_recursively() {
        let mut target = map(&[(
            "http",
            map(&[("port", 80.into()), ("host", "localhost".into())]),
        )]);
        target.merge(map(&[("http", map(&[("port", 8080.into())]))]));
        assert_eq!(
            target,
            map(&[(
                "http",
                map(&[("port", 8080.into()), ("host", "localhost".into())])
            )])
        );
    }

    #[test]
    fn scalar_targets_are_replaced() {
        let mut target = SettingValue::from("old");
        target.merge(map(&[("a", true.into())]));
        assert!(target.is_map());

        let mut target = map(&[("a", true.into())]);
        target.merge(SettingValue::from(3));
        assert_eq!(target, SettingValue::Integer(3));
    }

    #[test]
    fn lists_are_replaced_not_merged() {
        let mut target = SettingValue::from(vec!["a", "b"]);
        target.merge(SettingValue::from(vec!["c"]));
        assert_eq!(target, SettingValue::from(vec!["c"]));
    }

    #[test]
    fn json_shapes_deserialize_to_expected_variants() {
        let value: SettingValue =
            serde_json::from_str(r#"{"port": 8080, "ratio": 0.5, "debug": true, "tags": ["a"], "name": "svc"}"#)
                .unwrap();
        let fields = value.as_map().unwrap();
        assert_eq!(fields["port"].as_i64(), Some(8080));
        assert_eq!(fields["ratio"].as_f64(), Some(0.5));
        assert_eq!(fields["debug"].as_bool(), Some(true));
        assert_eq!(fields["tags"].as_list().map(<[_]>::len), Some(1));
        assert_eq!(fields["name"].as_str(), Some("svc"));
    }

    #[test]
    fn typed_decode_and_encode() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Http {
            host: String,
            port: u16,
        }

        let value = map(&[("host", "0.0.0.0".into()), ("port", 9000.into())]);
        let http: Http = value.decode().unwrap();
        assert_eq!(http, Http { host: "0.0.0.0".into(), port: 9000 });
        assert_eq!(SettingValue::encode(&http).unwrap(), value);
        assert!(value.decode::<u16>().is_err());
    }
}
