//! Normalized sensor reading produced by the payload parser.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Category;

/// Ultrasonic sensors per compartment.
pub const MAX_SENSORS: usize = 4;

/// Positional view of the distance array: index 0..=3 maps to the four
/// corners of the bin lid. Missing positions read as 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSlots {
    pub top_left: f64,
    pub top_right: f64,
    pub bottom_left: f64,
    pub bottom_right: f64,
}

impl SensorSlots {
    pub fn from_distances(distances: &[f64]) -> Self {
        let at = |i: usize| distances.get(i).copied().unwrap_or(0.0);
        Self {
            top_left: at(0),
            top_right: at(1),
            bottom_left: at(2),
            bottom_right: at(3),
        }
    }
}

/// Format-independent representation of one device message.
///
/// `timestamp` is always UTC; conversion to a display zone happens only when
/// readings are bucketed for charts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedReading {
    pub location: String,
    pub category: Category,
    /// Raw distances in cm, positional, at most [`MAX_SENSORS`] entries.
    pub sensor_distances: Vec<f64>,
    /// Mean of the valid distances, 0 when none are valid.
    pub average_distance_cm: f64,
    pub average_fill_percentage: f64,
    pub weight_grams: f64,
    pub timestamp: DateTime<Utc>,
}

impl NormalizedReading {
    pub fn slots(&self) -> SensorSlots {
        SensorSlots::from_distances(&self.sensor_distances)
    }
}
