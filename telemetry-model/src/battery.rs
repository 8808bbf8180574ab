//! Simulated battery state of a device.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One immutable entry in a device's battery history. The current level of a
/// device is the entry with the latest `last_updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryState {
    pub record_id: String,
    pub device_id: String,
    pub percentage: f64,
    pub error_count_24h: i32,
    pub last_updated: DateTime<Utc>,
}

impl BatteryState {
    pub fn new(device_id: &str, percentage: f64, error_count_24h: i32, at: DateTime<Utc>) -> Self {
        Self {
            record_id: format!("DH-{}-{}", device_id, at.timestamp_micros()),
            device_id: device_id.to_string(),
            percentage,
            error_count_24h,
            last_updated: at,
        }
    }
}
