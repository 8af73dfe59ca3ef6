//! Resource health codes and their aggregation into a service-level status.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Health of a single resource. Serialized as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum StatusCode {
    #[default]
    NotStarted = 0,
    Connecting = 1,
    Started = 2,
    Stopping = 3,
    Stopped = 4,
    Failed = 5,
}

impl StatusCode {
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Maps an integer code back to a status, `None` for unknown codes.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::NotStarted,
            1 => Self::Connecting,
            2 => Self::Started,
            3 => Self::Stopping,
            4 => Self::Stopped,
            5 => Self::Failed,
            _ => return None,
        })
    }

    /// `true` for the terminal states that make the whole service unhealthy.
    #[must_use]
    pub fn is_down(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Connecting => "CONNECTING",
            Self::Started => "STARTED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

impl Serialize for StatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for StatusCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown status code {code}")))
    }
}

/// Status report of a resource: `{"status": <code>}` plus an optional detail.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub status: StatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ResourceStatus {
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl From<StatusCode> for ResourceStatus {
    fn from(status: StatusCode) -> Self {
        Self::new(status)
    }
}

/// Every resource is started.
pub const GLOBAL_OK: u16 = 200;
/// Some resource is still coming up or going down.
pub const GLOBAL_PROCESSING: u16 = 102;
/// Some resource is stopped or failed.
pub const GLOBAL_ERROR: u16 = 500;

/// Aggregates per-resource statuses into an HTTP-style service status.
///
/// `500` if any resource is stopped or failed, otherwise `200` if every
/// resource is started (an empty map counts as healthy), otherwise `102`.
#[must_use]
pub fn global_status<S: std::hash::BuildHasher>(
    statuses: &HashMap<String, ResourceStatus, S>,
) -> u16 {
    if statuses.values().any(|s| s.status.is_down()) {
        GLOBAL_ERROR
    } else if statuses.values().all(|s| s.status == StatusCode::Started) {
        GLOBAL_OK
    } else {
        GLOBAL_PROCESSING
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn statuses(codes: &[(&str, StatusCode)]) -> HashMap<String, ResourceStatus> {
        codes
            .iter()
            .map(|(name, code)| ((*name).to_string(), ResourceStatus::new(*code)))
            .collect()
    }

    #[test]
    fn all_started_is_ok() {
        let map = statuses(&[("http", StatusCode::Started), ("db", StatusCode::Started)]);
        assert_eq!(global_status(&map), 200);
    }

    #[test]
    fn empty_map_is_ok() {
        assert_eq!(global_status(&HashMap::new()), 200);
    }

    #[test]
    fn any_failed_or_stopped_is_error() {
        let map = statuses(&[("http", StatusCode::Started), ("db", StatusCode::Failed)]);
        assert_eq!(global_status(&map), 500);
        let map = statuses(&[("http", StatusCode::Connecting), ("db", StatusCode::Stopped)]);
        assert_eq!(global_status(&map), 500);
    }

    #[test]
    fn transitional_states_are_processing() {
        let map = statuses(&[("http", StatusCode::Started), ("db", StatusCode::Connecting)]);
        assert_eq!(global_status(&map), 102);
        let map = statuses(&[("http", StatusCode::NotStarted)]);
        assert_eq!(global_status(&map), 102);
    }

    #[test]
    fn status_serializes_as_integer_code() {
        let json = serde_json::to_string(&ResourceStatus::new(StatusCode::Failed)).unwrap();
        assert_eq!(json, r#"{"status":5}"#);
        let parsed: ResourceStatus = serde_json::from_str(r#"{"status":2}"#).unwrap();
        assert_eq!(parsed.status, StatusCode::Started);
        assert!(serde_json::from_str::<ResourceStatus>(r#"{"status":9}"#).is_err());
    }
}
