//! Simulated battery drain.
//!
//! Devices carry no real battery telemetry, so every processed message
//! drains a fixed amount. The level lives in the store as an append-only
//! history; the ledger serializes the read-decay-append sequence per device
//! so concurrent messages never lose an update.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::Deserialize;
use tracing::{error, info, warn};

use telemetry_model::BatteryState;

use crate::error::StoreError;
use crate::store::ReadingStore;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BatteryModel {
    /// Level assumed for a device with no history, and the level a reset
    /// restores.
    pub initial_percentage: f64,
    /// Percentage points lost per processed message.
    pub decay_rate: f64,
    pub floor: f64,
    pub low_warning: f64,
}

impl Default for BatteryModel {
    fn default() -> Self {
        Self {
            initial_percentage: 94.0,
            decay_rate: 0.014,
            floor: 0.0,
            low_warning: 20.0,
        }
    }
}

impl BatteryModel {
    pub fn initial(&self) -> f64 {
        self.initial_percentage.clamp(0.0, 100.0)
    }

    /// Never below the floor, never outside 0..=100.
    pub fn decay(&self, current: f64) -> f64 {
        (current - self.decay_rate).max(self.floor).clamp(0.0, 100.0)
    }
}

/// Timestamp for the next history entry: now, or just after the previous
/// entry if the clock has not moved past it. Truncated to microseconds,
/// the resolution of the store.
fn next_timestamp(previous: Option<&BatteryState>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(6);
    match previous {
        Some(p) if now <= p.last_updated => p.last_updated + Duration::microseconds(1),
        _ => now,
    }
}

pub struct BatteryLedger {
    model: BatteryModel,
    store: Arc<dyn ReadingStore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BatteryLedger {
    pub fn new(model: BatteryModel, store: Arc<dyn ReadingStore>) -> Self {
        Self {
            model,
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn model(&self) -> &BatteryModel {
        &self.model
    }

    fn device_lock(&self, device_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(device_id.to_string()).or_default().clone()
    }

    /// Drains one step for `device_id` and appends the new level.
    pub async fn record_message(&self, device_id: &str) -> Result<BatteryState, StoreError> {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        let previous = self.store.last_battery_state(device_id).await?;
        let current = previous
            .as_ref()
            .map(|p| p.percentage)
            .unwrap_or_else(|| self.model.initial());
        let level = self.model.decay(current);
        let error_count = previous.as_ref().map(|p| p.error_count_24h).unwrap_or(0);
        let at = next_timestamp(previous.as_ref(), Utc::now());

        let state = BatteryState::new(device_id, level, error_count, at);
        self.store.append_battery_state(&state).await?;

        if level <= self.model.floor {
            error!(device_id, percentage = level, "battery depleted");
        } else if level <= self.model.low_warning {
            warn!(device_id, percentage = level, "battery low");
        }

        Ok(state)
    }

    /// Restores `device_id` to the initial level.
    pub async fn reset(&self, device_id: &str) -> Result<BatteryState, StoreError> {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        let previous = self.store.last_battery_state(device_id).await?;
        let error_count = previous.as_ref().map(|p| p.error_count_24h).unwrap_or(0);
        let at = next_timestamp(previous.as_ref(), Utc::now());

        let state = BatteryState::new(device_id, self.model.initial(), error_count, at);
        self.store.append_battery_state(&state).await?;
        info!(device_id, percentage = state.percentage, "battery reset");
        Ok(state)
    }

    pub async fn reset_all(&self, device_ids: &[String]) -> Result<Vec<BatteryState>, StoreError> {
        let mut states = Vec::with_capacity(device_ids.len());
        for id in device_ids {
            states.push(self.reset(id).await?);
        }
        Ok(states)
    }

    /// Latest known level per device.
    pub async fn status(&self) -> Result<Vec<BatteryState>, StoreError> {
        self.store.latest_battery_states().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryReadingStore;

    fn ledger(store: &MemoryReadingStore) -> BatteryLedger {
        BatteryLedger::new(BatteryModel::default(), Arc::new(store.clone()))
    }

    #[test]
    fn decay_respects_floor() {
        let model = BatteryModel::default();
        assert!((model.decay(94.0) - 93.986).abs() < 1e-9);
        assert_eq!(model.decay(0.01), 0.0);
        assert_eq!(model.decay(0.0), 0.0);
    }

    #[test]
    fn timestamps_strictly_increase() {
        let t = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let prev = BatteryState::new("D", 50.0, 0, t);
        assert_eq!(next_timestamp(Some(&prev), t), t + Duration::microseconds(1));
        assert_eq!(
            next_timestamp(Some(&prev), t - Duration::seconds(1)),
            t + Duration::microseconds(1)
        );
        assert_eq!(next_timestamp(Some(&prev), t + Duration::seconds(1)), t + Duration::seconds(1));
        assert_eq!(next_timestamp(None, t), t);
    }

    #[tokio::test]
    async fn first_message_starts_from_initial_level() {
        let store = MemoryReadingStore::new();
        let state = ledger(&store).record_message("DEV-LT2-ORG").await.unwrap();
        assert!((state.percentage - 93.986).abs() < 1e-9);
        assert!(state.record_id.starts_with("DH-DEV-LT2-ORG-"));
        assert_eq!(store.battery_history().len(), 1);
    }

    #[tokio::test]
    async fn error_count_is_carried_forward() {
        let store = MemoryReadingStore::new();
        let t = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        store.seed_battery(BatteryState::new("D", 50.0, 7, t));

        let state = ledger(&store).record_message("D").await.unwrap();
        assert_eq!(state.error_count_24h, 7);
        assert!((state.percentage - 49.986).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reset_restores_initial_level() {
        let store = MemoryReadingStore::new();
        let ledger = ledger(&store);
        for _ in 0..10 {
            ledger.record_message("D").await.unwrap();
        }
        let state = ledger.reset("D").await.unwrap();
        assert_eq!(state.percentage, 94.0);

        let next = ledger.record_message("D").await.unwrap();
        assert!((next.percentage - 93.986).abs() < 1e-9);
    }

    #[tokio::test]
    async fn store_failure_propagates() {
        let store = MemoryReadingStore::new();
        store.fail_battery(true);
        assert!(ledger(&store).record_message("D").await.is_err());
    }

    #[tokio::test]
    async fn concurrent_messages_never_lose_an_update() {
        let store = MemoryReadingStore::new().with_latency(std::time::Duration::from_millis(2));
        let ledger = Arc::new(ledger(&store));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move { ledger.record_message("D").await }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let last = store.last_battery_state("D").await.unwrap().unwrap();
        assert!((last.percentage - (94.0 - 20.0 * 0.014)).abs() < 1e-9);
        assert_eq!(store.battery_history().len(), 20);
    }
}
