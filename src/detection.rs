//! Detection data model and the JSON event published per detection batch

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of detections serialized into one event payload.
pub const MAX_DETECTIONS: usize = 20;

/// One detected object in a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u32>,
    #[serde(default, skip_serializing_if = "zone_is_unset")]
    pub zone_id: Option<String>,
}

fn zone_is_unset(zone: &Option<String>) -> bool {
    zone.as_deref().map_or(true, str::is_empty)
}

impl Detection {
    /// Create a detection with no tracking or zone information
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
            track_id: None,
            zone_id: None,
        }
    }

    pub fn with_bounds(mut self, x: f32, y: f32, width: f32, height: f32) -> Self {
        self.x = x;
        self.y = y;
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_track_id(mut self, track_id: u32) -> Self {
        self.track_id = Some(track_id);
        self
    }

    pub fn with_zone(mut self, zone_id: impl Into<String>) -> Self {
        self.zone_id = Some(zone_id.into());
        self
    }
}

/// All detections produced for one frame of one stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    pub fn count(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

/// Payload published to `{prefix}/detections/{stream}`
///
/// `count` always reports the full number of detections even when the
/// `detections` array is truncated to [`MAX_DETECTIONS`].
#[derive(Debug, Serialize)]
pub struct DetectionEvent<'a> {
    pub stream: &'a str,
    pub timestamp: i64,
    pub count: usize,
    pub detections: &'a [Detection],
}

impl<'a> DetectionEvent<'a> {
    pub fn new(stream: &'a str, result: &'a DetectionResult, timestamp: DateTime<Utc>) -> Self {
        let shown = result.detections.len().min(MAX_DETECTIONS);
        Self {
            stream,
            timestamp: timestamp.timestamp(),
            count: result.count(),
            detections: &result.detections[..shown],
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One line of newline-delimited detection input read by the CLI
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionInput {
    pub stream: String,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub detections: Vec<Detection>,
}
