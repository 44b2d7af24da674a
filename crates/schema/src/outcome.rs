use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown inspection result: {0}")]
    UnknownResult(String),

    #[error("unknown camera: {0}")]
    UnknownCamera(String),
}

/// Final classification of one inspected item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InspectionResult {
    Normal,
    Defect,
    Anomaly,
    Error,
}

impl InspectionResult {
    pub const ALL: [InspectionResult; 4] = [
        InspectionResult::Normal,
        InspectionResult::Defect,
        InspectionResult::Anomaly,
        InspectionResult::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InspectionResult::Normal => "Normal",
            InspectionResult::Defect => "Defect",
            InspectionResult::Anomaly => "Anomaly",
            InspectionResult::Error => "Error",
        }
    }
}

impl fmt::Display for InspectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InspectionResult {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseError::UnknownResult(s.to_string()))
    }
}

/// Camera that produced an image or a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Camera {
    Top,
    Side,
}

impl Camera {
    /// Tag used on the wire and in stores.
    pub fn as_str(&self) -> &'static str {
        match self {
            Camera::Top => "top",
            Camera::Side => "side",
        }
    }

    /// Upper-case role name used in reasons and archive file names.
    pub fn role(&self) -> &'static str {
        match self {
            Camera::Top => "TOP",
            Camera::Side => "SIDE",
        }
    }
}

impl fmt::Display for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Camera {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "top" => Ok(Camera::Top),
            "side" => Ok(Camera::Side),
            other => Err(ParseError::UnknownCamera(other.to_string())),
        }
    }
}

/// One detection reported by the inference peer for a single camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub camera: Camera,
    pub label: String,
    pub confidence: Option<f32>,
}

/// The bridge's final product for one inspected item.
///
/// Built once per completed pair and shared read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionOutcome {
    pub line: String,
    #[serde(with = "crate::timestamp")]
    pub timestamp: DateTime<Local>,
    pub result: InspectionResult,
    pub reason: String,
    pub top_path: Option<PathBuf>,
    pub side_path: Option<PathBuf>,
    pub detections: Vec<DetectionRecord>,
}

impl InspectionOutcome {
    pub fn detections_for(&self, camera: Camera) -> impl Iterator<Item = &DetectionRecord> {
        self.detections.iter().filter(move |d| d.camera == camera)
    }
}
