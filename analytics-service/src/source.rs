//! SampleSource trait and implementations.
//!
//! A sample is one stored weight or fill measurement attributed to a device.
//! Sources may return samples slightly outside the requested range; the
//! engine filters again.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tracing::{info, warn};

use telemetry_model::Category;

use crate::error::SourceError;

// ------------------------------------------------------------------ //
//  Domain types                                                       //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleKind {
    /// Weight in the unit the store records it in.
    Weight,
    /// Fill level in percent.
    Volume,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub kind: SampleKind,
    pub device_id: String,
    pub category: Category,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleFilter {
    pub device_id: Option<String>,
    pub category: Option<Category>,
    pub trashbin_id: Option<String>,
}

impl SampleFilter {
    /// Device and category check; the trashbin filter is only known to
    /// sources that store bin membership.
    pub fn matches(&self, sample: &RawSample) -> bool {
        self.device_id.as_deref().map_or(true, |d| d == sample.device_id)
            && self.category.map_or(true, |c| c == sample.category)
    }
}

/// `[start, end)` in UTC, or `[start, end]` when built with
/// [`UtcRange::inclusive`]. `end <= start` is empty either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtcRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub end_inclusive: bool,
}

impl UtcRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            end_inclusive: false,
        }
    }

    /// Closed range, for callers that name the last second they want
    /// (`..T00:59:59`).
    pub fn inclusive(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            end_inclusive: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && (ts < self.end || (self.end_inclusive && ts == self.end))
    }
}

// ------------------------------------------------------------------ //
//  Trait                                                              //
// ------------------------------------------------------------------ //

#[async_trait]
pub trait SampleSource: Send + Sync {
    async fn query_samples(
        &self,
        filter: &SampleFilter,
        range: UtcRange,
    ) -> Result<Vec<RawSample>, SourceError>;
}

// ------------------------------------------------------------------ //
//  MemorySampleSource (for tests)                                     //
// ------------------------------------------------------------------ //

/// Fixed sample set. Applies the device/category filter; the range is
/// ignored.
#[derive(Debug, Default, Clone)]
pub struct MemorySampleSource {
    pub samples: Arc<Vec<RawSample>>,
    calls: Arc<AtomicUsize>,
}

impl MemorySampleSource {
    pub fn new(samples: Vec<RawSample>) -> Self {
        Self {
            samples: Arc::new(samples),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of `query_samples` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SampleSource for MemorySampleSource {
    async fn query_samples(
        &self,
        filter: &SampleFilter,
        _range: UtcRange,
    ) -> Result<Vec<RawSample>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .samples
            .iter()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect())
    }
}

// ------------------------------------------------------------------ //
//  PgSampleSource (production)                                        //
// ------------------------------------------------------------------ //

/// Samples recorded by the older pipeline: `weightdata` / `volumedata`,
/// attributed to devices through `sensor`. Their `timestamp` columns hold UTC
/// without a zone.
const RECORDED_SAMPLES: &str = r#"
            SELECT 'weight'::text AS kind, d.deviceid, d.category,
                   wd.timestamp AT TIME ZONE 'UTC' AS ts,
                   wd.weight_kg::float8 AS value
            FROM weightdata wd
            INNER JOIN sensor s ON wd.sensorid = s.sensorid
            INNER JOIN device d ON s.deviceid = d.deviceid
            WHERE wd.timestamp >= ($1::timestamptz AT TIME ZONE 'UTC')
              AND (wd.timestamp < ($2::timestamptz AT TIME ZONE 'UTC')
                   OR ($5 AND wd.timestamp = ($2::timestamptz AT TIME ZONE 'UTC')))
              AND ($3::text IS NULL OR d.deviceid = $3)
              AND ($4::text IS NULL OR d.trashbinid = $4)
              AND wd.weight_kg IS NOT NULL
            UNION ALL
            SELECT 'volume'::text AS kind, d.deviceid, d.category,
                   vd.timestamp AT TIME ZONE 'UTC' AS ts,
                   vd.fill_percentage::float8 AS value
            FROM volumedata vd
            INNER JOIN sensor s ON vd.sensorid = s.sensorid
            INNER JOIN device d ON s.deviceid = d.deviceid
            WHERE vd.timestamp >= ($1::timestamptz AT TIME ZONE 'UTC')
              AND (vd.timestamp < ($2::timestamptz AT TIME ZONE 'UTC')
                   OR ($5 AND vd.timestamp = ($2::timestamptz AT TIME ZONE 'UTC')))
              AND ($3::text IS NULL OR d.deviceid = $3)
              AND ($4::text IS NULL OR d.trashbinid = $4)
              AND vd.fill_percentage IS NOT NULL
"#;

/// Readings the ingest gateway persists into `sensor_readings`; each row is
/// one weight sample (grams, reported in kg like `weightdata`) and one fill
/// sample. Those rows carry no bin membership, so a trashbin filter skips
/// them.
const GATEWAY_SAMPLES: &str = r#"
            SELECT 'weight'::text AS kind, sr.device_id AS deviceid, sr.bin_type AS category,
                   sr.timestamp AS ts,
                   (sr.weight / 1000.0)::float8 AS value
            FROM sensor_readings sr
            WHERE sr.timestamp >= $1::timestamptz
              AND (sr.timestamp < $2::timestamptz OR ($5 AND sr.timestamp = $2::timestamptz))
              AND ($3::text IS NULL OR sr.device_id = $3)
              AND $4::text IS NULL
            UNION ALL
            SELECT 'volume'::text AS kind, sr.device_id AS deviceid, sr.bin_type AS category,
                   sr.timestamp AS ts,
                   sr.fill_percentage::float8 AS value
            FROM sensor_readings sr
            WHERE sr.timestamp >= $1::timestamptz
              AND (sr.timestamp < $2::timestamptz OR ($5 AND sr.timestamp = $2::timestamptz))
              AND ($3::text IS NULL OR sr.device_id = $3)
              AND $4::text IS NULL
"#;

/// Which sample tables exist in the connected database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleTables {
    pub recorded: bool,
    pub gateway: bool,
}

impl SampleTables {
    /// The UNION ALL over every present table, `None` when there is nothing
    /// to read.
    pub fn sql(&self) -> Option<String> {
        let tables = [
            (self.recorded, RECORDED_SAMPLES),
            (self.gateway, GATEWAY_SAMPLES),
        ];
        let branches: Vec<&str> = tables
            .into_iter()
            .filter_map(|(present, sql)| present.then_some(sql))
            .collect();
        if branches.is_empty() {
            None
        } else {
            Some(branches.join("            UNION ALL\n"))
        }
    }
}

/// Reads both the recorded sample tables and the gateway's
/// `sensor_readings`, whichever of them exist.
pub struct PgSampleSource {
    pool: PgPool,
}

impl PgSampleSource {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, SourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Checked per query; the gateway may create its table after startup.
    async fn tables(&self) -> Result<SampleTables, SourceError> {
        let row = sqlx::query(
            r#"
            SELECT (to_regclass('weightdata') IS NOT NULL
                    AND to_regclass('volumedata') IS NOT NULL
                    AND to_regclass('sensor') IS NOT NULL
                    AND to_regclass('device') IS NOT NULL) AS recorded,
                   to_regclass('sensor_readings') IS NOT NULL AS gateway
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(SampleTables {
            recorded: row.try_get("recorded")?,
            gateway: row.try_get("gateway")?,
        })
    }
}

#[async_trait]
impl SampleSource for PgSampleSource {
    async fn query_samples(
        &self,
        filter: &SampleFilter,
        range: UtcRange,
    ) -> Result<Vec<RawSample>, SourceError> {
        let tables = self.tables().await?;
        let Some(sql) = tables.sql() else {
            warn!("no sample tables found, returning no samples");
            return Ok(Vec::new());
        };

        let rows = sqlx::query(&sql)
            .bind(range.start)
            .bind(range.end)
            .bind(filter.device_id.as_deref())
            .bind(filter.trashbin_id.as_deref())
            .bind(range.end_inclusive)
            .fetch_all(&self.pool)
            .await?;

        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_category: String = row.try_get("category")?;
            // "Organic"/"Anorganic"/"Residue" in the recorded tables,
            // lowercase names in sensor_readings.
            let Some(category) = Category::from_alias(&raw_category) else {
                warn!(category = %raw_category, "skipping sample with unknown category");
                continue;
            };
            if filter.category.is_some_and(|c| c != category) {
                continue;
            }
            let kind = match row.try_get::<String, _>("kind")?.as_str() {
                "weight" => SampleKind::Weight,
                _ => SampleKind::Volume,
            };
            samples.push(RawSample {
                kind,
                device_id: row.try_get("deviceid")?,
                category,
                timestamp: row.try_get("ts")?,
                value: row.try_get("value")?,
            });
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn inclusive_range_keeps_the_end_second() {
        let start = Utc.with_ymd_and_hms(2024, 4, 30, 17, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 4, 30, 17, 59, 59).unwrap();
        assert!(!UtcRange::new(start, end).contains(end));
        assert!(UtcRange::inclusive(start, end).contains(end));
        assert!(!UtcRange::inclusive(start, end).contains(end + chrono::Duration::milliseconds(1)));
        assert!(UtcRange::inclusive(end, end).is_empty());
    }

    #[test]
    fn sample_sql_covers_present_tables_only() {
        let both = SampleTables { recorded: true, gateway: true }.sql().unwrap();
        assert!(both.contains("FROM weightdata"));
        assert!(both.contains("FROM sensor_readings"));
        assert_eq!(both.matches("UNION ALL").count(), 3);

        let gateway = SampleTables { recorded: false, gateway: true }.sql().unwrap();
        assert!(!gateway.contains("weightdata"));
        assert_eq!(gateway.matches("UNION ALL").count(), 1);
        // Every variant binds the same five parameters.
        for n in 1..=5 {
            assert!(gateway.contains(&format!("${n}")));
        }

        assert!(SampleTables { recorded: false, gateway: false }.sql().is_none());
    }

    #[tokio::test]
    async fn memory_source_applies_device_and_category_filter() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let sample = |device: &str, category| RawSample {
            kind: SampleKind::Volume,
            device_id: device.into(),
            category,
            timestamp: t,
            value: 1.0,
        };
        let source = MemorySampleSource::new(vec![
            sample("A", Category::Organic),
            sample("A", Category::Residual),
            sample("B", Category::Organic),
        ]);
        let filter = SampleFilter {
            device_id: Some("A".into()),
            category: Some(Category::Organic),
            trashbin_id: None,
        };
        let out = source.query_samples(&filter, UtcRange::new(t, t)).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(source.calls(), 1);
    }
}
