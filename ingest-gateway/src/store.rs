//! ReadingStore trait and implementations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tracing::info;

use telemetry_model::{BatteryState, NormalizedReading};

use crate::error::StoreError;

// ------------------------------------------------------------------ //
//  Domain types                                                       //
// ------------------------------------------------------------------ //

/// A reading attributed to a device, as handed to the persist queue.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReading {
    pub device_id: String,
    pub reading: NormalizedReading,
}

// ------------------------------------------------------------------ //
//  Trait                                                              //
// ------------------------------------------------------------------ //

/// Durable storage for raw readings and the battery history.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    async fn save_reading(&self, reading: &StoredReading) -> Result<(), StoreError>;

    /// Latest battery entry of `device_id`, `None` if it never reported.
    async fn last_battery_state(&self, device_id: &str) -> Result<Option<BatteryState>, StoreError>;

    async fn append_battery_state(&self, state: &BatteryState) -> Result<(), StoreError>;

    /// Latest entry per device, ordered by device id.
    async fn latest_battery_states(&self) -> Result<Vec<BatteryState>, StoreError>;

    /// Deletes raw readings older than `days`; returns the number removed.
    async fn prune_readings_older_than(&self, days: u32) -> Result<u64, StoreError>;
}

// ------------------------------------------------------------------ //
//  MemoryReadingStore (for tests)                                     //
// ------------------------------------------------------------------ //

/// In-memory store that keeps everything for test assertions.
///
/// `fail_*` switches make the next calls fail, and `with_latency` delays the
/// battery read so concurrent read-modify-write races become observable.
#[derive(Debug, Default, Clone)]
pub struct MemoryReadingStore {
    pub readings: Arc<Mutex<Vec<StoredReading>>>,
    pub battery: Arc<Mutex<Vec<BatteryState>>>,
    fail_saves: Arc<AtomicBool>,
    fail_battery: Arc<AtomicBool>,
    battery_read_latency: Option<Duration>,
}

impl MemoryReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.battery_read_latency = Some(latency);
        self
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn fail_battery(&self, fail: bool) {
        self.fail_battery.store(fail, Ordering::SeqCst);
    }

    /// Non-destructive snapshot of the saved readings.
    pub fn readings(&self) -> Vec<StoredReading> {
        self.readings.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Full battery history in insertion order.
    pub fn battery_history(&self) -> Vec<BatteryState> {
        self.battery.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn seed_battery(&self, state: BatteryState) {
        self.battery.lock().unwrap_or_else(PoisonError::into_inner).push(state);
    }

    fn check_battery(&self) -> Result<(), StoreError> {
        if self.fail_battery.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("battery table offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ReadingStore for MemoryReadingStore {
    async fn save_reading(&self, reading: &StoredReading) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("readings table offline".into()));
        }
        self.readings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(reading.clone());
        Ok(())
    }

    async fn last_battery_state(
        &self,
        device_id: &str,
    ) -> Result<Option<BatteryState>, StoreError> {
        self.check_battery()?;
        let latest = self
            .battery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.device_id == device_id)
            .max_by_key(|s| s.last_updated)
            .cloned();
        if let Some(latency) = self.battery_read_latency {
            tokio::time::sleep(latency).await;
        }
        Ok(latest)
    }

    async fn append_battery_state(&self, state: &BatteryState) -> Result<(), StoreError> {
        self.check_battery()?;
        self.battery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(state.clone());
        Ok(())
    }

    async fn latest_battery_states(&self) -> Result<Vec<BatteryState>, StoreError> {
        self.check_battery()?;
        let history = self.battery.lock().unwrap_or_else(PoisonError::into_inner);
        let mut latest: Vec<BatteryState> = Vec::new();
        for state in history.iter() {
            match latest.iter_mut().find(|s| s.device_id == state.device_id) {
                Some(slot) if slot.last_updated < state.last_updated => *slot = state.clone(),
                Some(_) => {}
                None => latest.push(state.clone()),
            }
        }
        latest.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(latest)
    }

    async fn prune_readings_older_than(&self, days: u32) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let mut readings = self.readings.lock().unwrap_or_else(PoisonError::into_inner);
        let before = readings.len();
        readings.retain(|r| r.reading.timestamp >= cutoff);
        Ok((before - readings.len()) as u64)
    }
}

// ------------------------------------------------------------------ //
//  PgReadingStore (production)                                        //
// ------------------------------------------------------------------ //

/// PostgreSQL store: raw readings in `sensor_readings`, battery history in
/// `devicehealth`.
pub struct PgReadingStore {
    pool: PgPool,
}

impl PgReadingStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
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

    /// Creates the raw-reading and battery tables if they don't exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sensor_readings (
                id                  BIGSERIAL PRIMARY KEY,
                device_id           TEXT NOT NULL,
                location            TEXT NOT NULL,
                bin_type            TEXT NOT NULL,
                sensor_top_left     DOUBLE PRECISION NOT NULL DEFAULT 0,
                sensor_top_right    DOUBLE PRECISION NOT NULL DEFAULT 0,
                sensor_bottom_left  DOUBLE PRECISION NOT NULL DEFAULT 0,
                sensor_bottom_right DOUBLE PRECISION NOT NULL DEFAULT 0,
                average_distance    DOUBLE PRECISION NOT NULL,
                fill_percentage     DOUBLE PRECISION NOT NULL,
                weight              DOUBLE PRECISION NOT NULL,
                timestamp           TIMESTAMPTZ NOT NULL,
                created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS sensor_readings_location_type_ts
                ON sensor_readings (location, bin_type, timestamp DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devicehealth (
                healthid           TEXT PRIMARY KEY,
                deviceid           TEXT NOT NULL,
                battery_percentage DOUBLE PRECISION NOT NULL,
                error_count_24h    INTEGER NOT NULL DEFAULT 0,
                timestamp          TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn battery_from_row(row: &sqlx::postgres::PgRow) -> Result<BatteryState, StoreError> {
    Ok(BatteryState {
        record_id: row.try_get("healthid")?,
        device_id: row.try_get("deviceid")?,
        percentage: row.try_get("battery_percentage")?,
        error_count_24h: row.try_get::<Option<i32>, _>("error_count_24h")?.unwrap_or(0),
        last_updated: row.try_get::<DateTime<Utc>, _>("timestamp")?,
    })
}

#[async_trait]
impl ReadingStore for PgReadingStore {
    async fn save_reading(&self, stored: &StoredReading) -> Result<(), StoreError> {
        let r = &stored.reading;
        // NaN marks a null sensor slot on the wire; store it as 0.
        let slot = |v: f64| if v.is_finite() { v } else { 0.0 };
        let slots = r.slots();
        sqlx::query(
            r#"
            INSERT INTO sensor_readings (
                device_id, location, bin_type,
                sensor_top_left, sensor_top_right, sensor_bottom_left, sensor_bottom_right,
                average_distance, fill_percentage, weight, timestamp
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&stored.device_id)
        .bind(&r.location)
        .bind(r.category.as_str())
        .bind(slot(slots.top_left))
        .bind(slot(slots.top_right))
        .bind(slot(slots.bottom_left))
        .bind(slot(slots.bottom_right))
        .bind(r.average_distance_cm)
        .bind(r.average_fill_percentage)
        .bind(r.weight_grams)
        .bind(r.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_battery_state(
        &self,
        device_id: &str,
    ) -> Result<Option<BatteryState>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT healthid, deviceid, battery_percentage::float8 AS battery_percentage,
                   error_count_24h, timestamp
            FROM devicehealth
            WHERE deviceid = $1
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(battery_from_row).transpose()
    }

    async fn append_battery_state(&self, state: &BatteryState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO devicehealth (healthid, deviceid, battery_percentage, error_count_24h, timestamp)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&state.record_id)
        .bind(&state.device_id)
        .bind(state.percentage)
        .bind(state.error_count_24h)
        .bind(state.last_updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_battery_states(&self) -> Result<Vec<BatteryState>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (deviceid)
                   healthid, deviceid, battery_percentage::float8 AS battery_percentage,
                   error_count_24h, timestamp
            FROM devicehealth
            ORDER BY deviceid, timestamp DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(battery_from_row).collect()
    }

    async fn prune_readings_older_than(&self, days: u32) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM sensor_readings
            WHERE timestamp < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(days as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
