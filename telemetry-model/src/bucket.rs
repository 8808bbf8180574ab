//! Chart buckets returned by the aggregation engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Category;

/// Supported bucket widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "5-minute")]
    FiveMinutes,
    #[serde(rename = "hourly")]
    Hourly,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown interval '{0}' (expected '5-minute' or 'hourly')")]
pub struct UnknownInterval(pub String);

impl Interval {
    pub fn seconds(self) -> i64 {
        match self {
            Interval::FiveMinutes => 5 * 60,
            Interval::Hourly => 60 * 60,
        }
    }

    pub fn width(self) -> Duration {
        Duration::seconds(self.seconds())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Interval::FiveMinutes => "5-minute",
            Interval::Hourly => "hourly",
        }
    }
}

impl FromStr for Interval {
    type Err = UnknownInterval;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "5-minute" | "5min" | "5m" | "5-minutes" => Ok(Interval::FiveMinutes),
            "hourly" | "hour" | "1h" => Ok(Interval::Hourly),
            _ => Err(UnknownInterval(s.to_string())),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One aggregated chart point for a (bucket, device, category) triple.
///
/// A side without samples reports an average of 0; the per-side counts tell
/// a defaulted 0 apart from a measured one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBucket {
    pub bucket_start_utc: DateTime<Utc>,
    /// Local display label, `HH:MM`.
    pub bucket_start_local: String,
    pub device_id: String,
    pub category: Category,
    pub sample_count: u32,
    pub weight_samples: u32,
    pub volume_samples: u32,
    pub average_weight: f64,
    pub average_fill_percentage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_interval_aliases() {
        assert_eq!("5-minute".parse::<Interval>().unwrap(), Interval::FiveMinutes);
        assert_eq!("5min".parse::<Interval>().unwrap(), Interval::FiveMinutes);
        assert_eq!("Hourly".parse::<Interval>().unwrap(), Interval::Hourly);
        assert!("daily".parse::<Interval>().is_err());
    }

    #[test]
    fn widths() {
        assert_eq!(Interval::FiveMinutes.width(), Duration::minutes(5));
        assert_eq!(Interval::Hourly.width(), Duration::hours(1));
    }
}
