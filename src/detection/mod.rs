use crate::error::Error;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

/// Alarm types recognized by the pipeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlarmType {
    Fall,
    Seizure,
    ManualEmergency,
    Other,
}

impl AlarmType {
    /// Severity rank used for cross-type collision tie-breaks and recipient
    /// tier selection: manual_emergency > seizure > fall > other
    pub fn severity(&self) -> u8 {
        match self {
            Self::ManualEmergency => 3,
            Self::Seizure => 2,
            Self::Fall => 1,
            Self::Other => 0,
        }
    }
}

impl Display for AlarmType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fall => write!(f, "fall"),
            Self::Seizure => write!(f, "seizure"),
            Self::ManualEmergency => write!(f, "manual_emergency"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl FromStr for AlarmType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fall" => Ok(Self::Fall),
            "seizure" => Ok(Self::Seizure),
            "manual_emergency" => Ok(Self::ManualEmergency),
            "other" => Ok(Self::Other),
            _ => Err(Error::InvalidInput(format!("Unknown alarm type: {}", s))),
        }
    }
}

/// Bounding box reported by a detector, normalized to the frame
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Canonical per-camera detection record as produced by a detection source
/// adapter. Ephemeral: candidates are fused into alarm requests and never
/// persisted directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionCandidate {
    /// Camera that produced the detection
    pub camera_id: Uuid,
    /// Physical area covered by the camera
    pub area_id: Uuid,
    /// Person monitored in the area
    pub subject_id: Uuid,
    /// Detected alarm type
    pub event_type: AlarmType,
    /// Detector confidence in [0, 1]
    pub confidence: f64,
    /// Capture timestamp at the camera
    pub captured_at: DateTime<Utc>,
    /// Optional bounding boxes from the detector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_boxes: Option<Vec<BoundingBox>>,
    /// Optional raw detector context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl DetectionCandidate {
    /// Boundary validation for the inbound detection feed
    pub fn validate(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.confidence) || self.confidence.is_nan() {
            return Err(Error::InvalidInput(format!(
                "Detection confidence out of range: {}",
                self.confidence
            )));
        }
        Ok(())
    }
}

/// A deduplicated, fused alarm creation request emitted by the fusion engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmRequest {
    pub subject_id: Uuid,
    pub area_id: Uuid,
    /// One camera, or two when corroborated
    pub camera_ids: Vec<Uuid>,
    pub event_type: AlarmType,
    /// Fused confidence in [0, 1]
    pub confidence: f64,
    /// Derived score reflecting corroboration and camera track record
    pub reliability: f64,
    pub captured_at: DateTime<Utc>,
    /// Context carried onto the alarm (bounding boxes, suppressed
    /// lower-severity detections, detector extras)
    pub context: serde_json::Value,
}
