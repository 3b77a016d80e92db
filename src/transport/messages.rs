//! Telemetry messages handed to a [`super::RobotSession`].
//!
//! The runtime never serializes these; encoding them for the wire is up to
//! the transport implementation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::config::MapDescriptor;

/// A robot pose expressed in the coordinate frame `frame_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    /// Radians
    pub yaw: f64,
    pub frame_id: String,
}

impl Pose {
    pub fn new(x: f64, y: f64, yaw: f64, frame_id: impl Into<String>) -> Self {
        Self {
            x,
            y,
            yaw,
            frame_id: frame_id.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Odometry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linear_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angular_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linear_distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angular_distance: Option<f64>,
}

/// Host resource usage, all values in `0.0..=1.0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_load_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_usage_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdd_usage_percentage: Option<f64>,
}

/// Arbitrary key/value telemetry.
pub type KeyValues = Map<String, Value>;

/// Map metadata plus the location of its image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapMessage {
    pub file: PathBuf,
    pub map_id: String,
    pub map_label: Option<String>,
    pub frame_id: String,
    pub origin_x: f64,
    pub origin_y: f64,
    pub resolution: f64,
    /// Set when the map replaces one already known to the platform
    pub is_update: bool,
}

impl MapMessage {
    pub fn from_descriptor(frame_id: &str, map: &MapDescriptor, is_update: bool) -> Self {
        Self {
            file: map.file.clone(),
            map_id: map.map_id.clone(),
            map_label: map.map_label.clone(),
            frame_id: frame_id.to_string(),
            origin_x: map.origin_x,
            origin_y: map.origin_y,
            resolution: map.resolution,
            is_update,
        }
    }
}
