//! Time-bucketed aggregation.
//!
//! Buckets are aligned on the local display calendar (a fixed UTC offset),
//! so with +07:00 an hourly bucket labelled `00:00` starts at 17:00 UTC the
//! previous day. Weight and fill samples are grouped independently and
//! joined per (bucket, device, category); a side without samples reports 0.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use tracing::debug;

use telemetry_model::{Category, Interval, TimeBucket};

use crate::error::SourceError;
use crate::source::{RawSample, SampleFilter, SampleKind, SampleSource, UtcRange};

#[derive(Default)]
struct Acc {
    weight_sum: f64,
    weight_n: u32,
    volume_sum: f64,
    volume_n: u32,
}

impl Acc {
    fn add(&mut self, kind: SampleKind, value: f64) {
        match kind {
            SampleKind::Weight => {
                self.weight_sum += value;
                self.weight_n += 1;
            }
            SampleKind::Volume => {
                self.volume_sum += value;
                self.volume_n += 1;
            }
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn mean(sum: f64, n: u32) -> f64 {
    if n == 0 {
        0.0
    } else {
        round2(sum / f64::from(n))
    }
}

/// UTC epoch seconds of the local bucket containing `ts`.
pub fn bucket_start(ts: DateTime<Utc>, interval: Interval, offset: FixedOffset) -> i64 {
    let shift = i64::from(offset.local_minus_utc());
    let width = interval.seconds();
    let local = ts.timestamp() + shift;
    local.div_euclid(width) * width - shift
}

/// Pure aggregation. Samples outside `range` are ignored; an empty range
/// yields nothing.
pub fn aggregate(
    samples: &[RawSample],
    range: UtcRange,
    interval: Interval,
    offset: FixedOffset,
) -> Vec<TimeBucket> {
    if range.is_empty() {
        return Vec::new();
    }

    // Key order is the output order: bucket start, device, category.
    let mut groups: BTreeMap<(i64, String, Category), Acc> = BTreeMap::new();
    for s in samples.iter().filter(|s| range.contains(s.timestamp)) {
        let key = (bucket_start(s.timestamp, interval, offset), s.device_id.clone(), s.category);
        groups.entry(key).or_default().add(s.kind, s.value);
    }

    groups
        .into_iter()
        .filter_map(|((start, device_id, category), acc)| {
            let bucket_start_utc = DateTime::from_timestamp(start, 0)?;
            Some(TimeBucket {
                bucket_start_utc,
                bucket_start_local: bucket_start_utc
                    .with_timezone(&offset)
                    .format("%H:%M")
                    .to_string(),
                device_id,
                category,
                sample_count: acc.weight_n + acc.volume_n,
                weight_samples: acc.weight_n,
                volume_samples: acc.volume_n,
                average_weight: mean(acc.weight_sum, acc.weight_n),
                average_fill_percentage: mean(acc.volume_sum, acc.volume_n),
            })
        })
        .collect()
}

/// Fetches samples from a [`SampleSource`] and aggregates them.
pub struct AggregationEngine {
    source: Arc<dyn SampleSource>,
    offset: FixedOffset,
}

impl AggregationEngine {
    pub fn new(source: Arc<dyn SampleSource>, offset: FixedOffset) -> Self {
        Self { source, offset }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub async fn buckets(
        &self,
        filter: &SampleFilter,
        range: UtcRange,
        interval: Interval,
    ) -> Result<Vec<TimeBucket>, SourceError> {
        if range.is_empty() {
            debug!(start = %range.start, end = %range.end, "empty range, store not queried");
            return Ok(Vec::new());
        }
        let samples = self.source.query_samples(filter, range).await?;
        let buckets = aggregate(&samples, range, interval, self.offset);
        debug!(
            samples = samples.len(),
            buckets = buckets.len(),
            interval = %interval,
            "aggregated"
        );
        Ok(buckets)
    }
}
