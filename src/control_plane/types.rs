//! Control-plane message types
//!
//! Structured payloads are serialized as JSON; frame payloads travel as the
//! opaque encoded-image bytes with no extra framing (the topic name carries
//! the camera id).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Rolling statistics snapshot, published at most once per stats interval.
///
/// Counters accumulate for the worker process lifetime; a snapshot is a
/// point-in-time copy, and the newest one overwrites any prior snapshot for
/// the camera on the read side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub camera_id: String,
    /// Frames read from the source since process start
    pub total_frames: u64,
    /// Frames that went through detection
    pub processed_frames: u64,
    /// Additive per-class detection counters (person, violation classes, ...)
    #[serde(default)]
    pub class_counts: HashMap<String, u64>,
    pub avg_fps: f64,
    pub avg_processing_time_ms: f64,
    pub sampled_at: DateTime<Utc>,
}

/// Kind of configuration change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Update,
    Delete,
}

/// Known configuration domains. Unknown domains round-trip as `Other` and
/// are ignored by consumers rather than treated as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigDomain {
    HumanDetection,
    HairnetDetection,
    BehaviorRecognition,
    Streaming,
    Other(String),
}

impl ConfigDomain {
    pub fn as_str(&self) -> &str {
        match self {
            ConfigDomain::HumanDetection => "human_detection",
            ConfigDomain::HairnetDetection => "hairnet_detection",
            ConfigDomain::BehaviorRecognition => "behavior_recognition",
            ConfigDomain::Streaming => "streaming",
            ConfigDomain::Other(s) => s,
        }
    }
}

impl From<String> for ConfigDomain {
    fn from(s: String) -> Self {
        match s.as_str() {
            "human_detection" => ConfigDomain::HumanDetection,
            "hairnet_detection" => ConfigDomain::HairnetDetection,
            "behavior_recognition" => ConfigDomain::BehaviorRecognition,
            "streaming" => ConfigDomain::Streaming,
            _ => ConfigDomain::Other(s),
        }
    }
}

impl From<ConfigDomain> for String {
    fn from(d: ConfigDomain) -> Self {
        d.as_str().to_string()
    }
}

impl Serialize for ConfigDomain {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ConfigDomain {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(ConfigDomain::from(String::deserialize(deserializer)?))
    }
}

/// A typed configuration change, published by the control/API layer and
/// consumed by detection workers filtering on `camera_id`.
///
/// Delivery is at-most-once with no acknowledgment; consumers re-derive their
/// authoritative configuration on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDelta {
    /// Target camera; `None` means global (applies to every worker)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<String>,
    pub domain: ConfigDomain,
    pub key: String,
    pub value: serde_json::Value,
    pub change_kind: ChangeKind,
    pub issued_at: DateTime<Utc>,
}

impl ConfigDelta {
    /// Whether this delta applies to the given camera (global deltas apply
    /// to every camera).
    pub fn applies_to(&self, camera_id: &str) -> bool {
        match &self.camera_id {
            None => true,
            Some(id) => id == camera_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_domain_roundtrip() {
        let json = serde_json::to_string(&ConfigDomain::HairnetDetection).unwrap();
        assert_eq!(json, "\"hairnet_detection\"");
        let parsed: ConfigDomain = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ConfigDomain::HairnetDetection);
    }

    #[test]
    fn test_unknown_domain_parses_as_other() {
        let parsed: ConfigDomain = serde_json::from_str("\"pose_estimation\"").unwrap();
        assert_eq!(parsed, ConfigDomain::Other("pose_estimation".to_string()));
    }

    #[test]
    fn test_delta_scoping() {
        let global = ConfigDelta {
            camera_id: None,
            domain: ConfigDomain::HumanDetection,
            key: "confidence".to_string(),
            value: json!(0.5),
            change_kind: ChangeKind::Update,
            issued_at: Utc::now(),
        };
        assert!(global.applies_to("cam1"));
        assert!(global.applies_to("cam2"));

        let scoped = ConfigDelta {
            camera_id: Some("cam1".to_string()),
            ..global
        };
        assert!(scoped.applies_to("cam1"));
        assert!(!scoped.applies_to("cam2"));
    }

    #[test]
    fn test_delta_deserializes_without_camera_id() {
        let json = r#"{
            "domain": "streaming",
            "key": "jpeg_quality",
            "value": 70,
            "change_kind": "update",
            "issued_at": "2026-08-01T00:00:00Z"
        }"#;
        let delta: ConfigDelta = serde_json::from_str(json).unwrap();
        assert!(delta.camera_id.is_none());
        assert_eq!(delta.change_kind, ChangeKind::Update);
    }
}
