//! Domain types shared across the waste-bin telemetry workspace.
//!
//! The ingest gateway produces [`NormalizedReading`]s and [`BatteryState`]
//! records; the analytics service turns stored samples into [`TimeBucket`]
//! rows. Both sides agree on [`Category`] and [`Interval`] through this crate.

pub mod battery;
pub mod bucket;
pub mod category;
pub mod reading;

pub use battery::BatteryState;
pub use bucket::{Interval, TimeBucket, UnknownInterval};
pub use category::{Category, UnknownCategory};
pub use reading::{NormalizedReading, SensorSlots, MAX_SENSORS};
