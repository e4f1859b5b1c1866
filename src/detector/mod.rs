//! Detector - External Detection Collaborator
//!
//! ## Responsibilities
//!
//! - `Detector` trait: the black-box `detect(frame) -> result` seam
//! - HTTP adapter posting frames to an inference server
//! - Live detector parameters with hot-reload from config deltas
//!
//! The detection algorithms themselves are out of scope; this module only
//! defines the contract the detection loop drives.

use crate::capture::RawFrame;
use crate::control_plane::{ChangeKind, ConfigDelta, ConfigDomain};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Result of one detection pass
#[derive(Debug, Clone, Default)]
pub struct Detections {
    /// Detected objects per class for this frame (person, no_hairnet, ...)
    pub class_counts: HashMap<String, u64>,
    /// Optionally, the annotated frame to publish instead of the raw one
    pub annotated: Option<Vec<u8>>,
}

/// Live detector parameters. Held in an `ArcSwap` by the detection loop and
/// replaced wholesale when a config delta arrives, so a reload is applied
/// between frames without locking the capture cycle.
#[derive(Debug, Clone)]
pub struct DetectorParams {
    /// Minimum confidence forwarded to the detector
    pub confidence: f64,
    /// Process only every Nth frame (1 = every frame)
    pub process_every: u32,
    /// JPEG quality for published frames
    pub jpeg_quality: u8,
    /// Publish skipped (undetected) frames for smooth viewing
    pub forward_skipped: bool,
    /// Per-domain toggles
    pub human_detection: bool,
    pub hairnet_detection: bool,
    pub behavior_recognition: bool,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            confidence: 0.5,
            process_every: 3,
            jpeg_quality: 70,
            forward_skipped: true,
            human_detection: true,
            hairnet_detection: true,
            behavior_recognition: false,
        }
    }
}

impl DetectorParams {
    /// Apply one config delta, returning the updated params.
    ///
    /// Unknown domains and unknown keys are ignored, not errors: newer
    /// control planes may publish keys this worker build does not know.
    /// A `Delete` resets the key to its default.
    pub fn apply_delta(&self, delta: &ConfigDelta) -> Self {
        let mut next = self.clone();
        let defaults = Self::default();
        let deleted = delta.change_kind == ChangeKind::Delete;

        match &delta.domain {
            ConfigDomain::HumanDetection => match delta.key.as_str() {
                "enabled" => {
                    next.human_detection = if deleted {
                        defaults.human_detection
                    } else {
                        delta.value.as_bool().unwrap_or(next.human_detection)
                    }
                }
                "confidence" => {
                    next.confidence = if deleted {
                        defaults.confidence
                    } else {
                        delta.value.as_f64().unwrap_or(next.confidence)
                    }
                }
                _ => {
                    tracing::debug!(key = %delta.key, "Ignoring unknown human_detection key");
                }
            },
            ConfigDomain::HairnetDetection => match delta.key.as_str() {
                "enabled" => {
                    next.hairnet_detection = if deleted {
                        defaults.hairnet_detection
                    } else {
                        delta.value.as_bool().unwrap_or(next.hairnet_detection)
                    }
                }
                _ => {
                    tracing::debug!(key = %delta.key, "Ignoring unknown hairnet_detection key");
                }
            },
            ConfigDomain::BehaviorRecognition => match delta.key.as_str() {
                "enabled" => {
                    next.behavior_recognition = if deleted {
                        defaults.behavior_recognition
                    } else {
                        delta.value.as_bool().unwrap_or(next.behavior_recognition)
                    }
                }
                _ => {
                    tracing::debug!(key = %delta.key, "Ignoring unknown behavior_recognition key");
                }
            },
            ConfigDomain::Streaming => match delta.key.as_str() {
                "jpeg_quality" => {
                    next.jpeg_quality = if deleted {
                        defaults.jpeg_quality
                    } else {
                        delta
                            .value
                            .as_u64()
                            .map(|q| q.clamp(1, 100) as u8)
                            .unwrap_or(next.jpeg_quality)
                    }
                }
                "process_every" => {
                    next.process_every = if deleted {
                        defaults.process_every
                    } else {
                        delta
                            .value
                            .as_u64()
                            .map(|n| (n.max(1)) as u32)
                            .unwrap_or(next.process_every)
                    }
                }
                "forward_skipped" => {
                    next.forward_skipped = if deleted {
                        defaults.forward_skipped
                    } else {
                        delta.value.as_bool().unwrap_or(next.forward_skipped)
                    }
                }
                _ => {
                    tracing::debug!(key = %delta.key, "Ignoring unknown streaming key");
                }
            },
            ConfigDomain::Other(domain) => {
                tracing::debug!(domain = %domain, key = %delta.key, "Ignoring unknown config domain");
            }
        }

        next
    }
}

/// The black-box detection seam
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &RawFrame, params: &DetectorParams) -> Result<Detections>;
}

/// No-op detector: used when no inference endpoint is configured and in
/// tests. Never detects anything.
pub struct NullDetector;

impl Detector for NullDetector {
    fn detect(&self, _frame: &RawFrame, _params: &DetectorParams) -> Result<Detections> {
        Ok(Detections::default())
    }
}

/// Inference server response
#[derive(Debug, Deserialize)]
struct InferResponse {
    #[serde(default)]
    class_counts: HashMap<String, u64>,
}

/// HTTP adapter posting JPEG frames to an inference server.
///
/// Uses a blocking client because the detection loop is a synchronous
/// capture thread; the request timeout bounds each detection pass.
pub struct HttpDetector {
    client: reqwest::blocking::Client,
    base_url: String,
    camera_id: String,
}

impl HttpDetector {
    pub fn new(base_url: impl Into<String>, camera_id: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            camera_id: camera_id.into(),
        })
    }
}

impl Detector for HttpDetector {
    fn detect(&self, frame: &RawFrame, params: &DetectorParams) -> Result<Detections> {
        let jpeg = frame.to_jpeg(params.jpeg_quality)?;

        let mut domains = Vec::new();
        if params.human_detection {
            domains.push("human_detection");
        }
        if params.hairnet_detection {
            domains.push("hairnet_detection");
        }
        if params.behavior_recognition {
            domains.push("behavior_recognition");
        }

        let form = reqwest::blocking::multipart::Form::new()
            .text("camera_id", self.camera_id.clone())
            .text("confidence", params.confidence.to_string())
            .text("domains", domains.join(","))
            .part(
                "frame",
                reqwest::blocking::multipart::Part::bytes(jpeg)
                    .file_name("frame.jpg")
                    .mime_str("image/jpeg")
                    .map_err(|e| Error::Detector(e.to_string()))?,
            );

        let response = self
            .client
            .post(format!("{}/detect", self.base_url))
            .multipart(form)
            .send()?;

        if !response.status().is_success() {
            return Err(Error::Detector(format!(
                "inference server returned {}",
                response.status()
            )));
        }

        let parsed: InferResponse = response.json()?;
        Ok(Detections {
            class_counts: parsed.class_counts,
            annotated: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn delta(domain: ConfigDomain, key: &str, value: serde_json::Value) -> ConfigDelta {
        ConfigDelta {
            camera_id: None,
            domain,
            key: key.to_string(),
            value,
            change_kind: ChangeKind::Update,
            issued_at: Utc::now(),
        }
    }

    #[test]
    fn test_apply_delta_updates_known_key() {
        let params = DetectorParams::default();
        let next = params.apply_delta(&delta(
            ConfigDomain::HumanDetection,
            "confidence",
            json!(0.8),
        ));
        assert_eq!(next.confidence, 0.8);
    }

    #[test]
    fn test_apply_delta_ignores_unknown_key() {
        let params = DetectorParams::default();
        let next = params.apply_delta(&delta(
            ConfigDomain::HumanDetection,
            "nonexistent_knob",
            json!(42),
        ));
        assert_eq!(next.confidence, params.confidence);
        assert_eq!(next.human_detection, params.human_detection);
    }

    #[test]
    fn test_apply_delta_ignores_unknown_domain() {
        let params = DetectorParams::default();
        let next = params.apply_delta(&delta(
            ConfigDomain::Other("pose_estimation".to_string()),
            "enabled",
            json!(false),
        ));
        assert!(next.human_detection);
    }

    #[test]
    fn test_apply_delete_resets_to_default() {
        let params = DetectorParams {
            jpeg_quality: 95,
            ..DetectorParams::default()
        };
        let mut d = delta(ConfigDomain::Streaming, "jpeg_quality", json!(null));
        d.change_kind = ChangeKind::Delete;
        let next = params.apply_delta(&d);
        assert_eq!(next.jpeg_quality, DetectorParams::default().jpeg_quality);
    }

    #[test]
    fn test_process_every_floor_is_one() {
        let params = DetectorParams::default();
        let next = params.apply_delta(&delta(ConfigDomain::Streaming, "process_every", json!(0)));
        assert_eq!(next.process_every, 1);
    }

    #[test]
    fn test_null_detector_detects_nothing() {
        let frame = RawFrame {
            data: vec![0u8; 4 * 4 * 3],
            width: 4,
            height: 4,
        };
        let detections = NullDetector
            .detect(&frame, &DetectorParams::default())
            .unwrap();
        assert!(detections.class_counts.is_empty());
        assert!(detections.annotated.is_none());
    }
}
