//! Per-message ingestion pipeline.
//!
//! parse -> resolve device -> battery -> live cache -> persist -> fan-out.
//! Failures are contained per stage; nothing here returns an error to the
//! bus consumer, which always acknowledges the message afterwards.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use telemetry_model::{Category, NormalizedReading};

use crate::battery::BatteryLedger;
use crate::codec::{parser_for, PayloadParser};
use crate::config::IngestConfig;
use crate::live_cache::LiveCache;
use crate::persist::{PersistQueue, PersistStats};
use crate::routing::DeviceRoutes;
use crate::store::{ReadingStore, StoredReading};
use crate::subscribers::SubscriberRegistry;

/// One message as delivered by the bus.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub body: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessReport {
    pub device_id: String,
    pub category: Category,
    /// `None` when the battery update failed.
    pub battery_percentage: Option<f64>,
    pub persisted: bool,
    pub notified: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadingOutcome {
    Unrouted { location: String, category: Category },
    Processed(ProcessReport),
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Malformed(String),
    Readings(Vec<ReadingOutcome>),
}

impl IngestOutcome {
    pub fn processed(&self) -> usize {
        match self {
            IngestOutcome::Malformed(_) => 0,
            IngestOutcome::Readings(r) => r
                .iter()
                .filter(|o| matches!(o, ReadingOutcome::Processed(_)))
                .count(),
        }
    }
}

pub struct IngestGateway {
    parser: Box<dyn PayloadParser>,
    routes: DeviceRoutes,
    ledger: BatteryLedger,
    cache: Arc<LiveCache>,
    subscribers: Arc<SubscriberRegistry>,
    persist: PersistQueue,
    writer: Mutex<Option<JoinHandle<PersistStats>>>,
}

impl IngestGateway {
    /// Must be called inside a Tokio runtime; spawns the persist writer.
    pub fn new(
        cfg: &IngestConfig,
        store: Arc<dyn ReadingStore>,
        cache: Arc<LiveCache>,
        subscribers: Arc<SubscriberRegistry>,
    ) -> Self {
        let (persist, writer) = PersistQueue::spawn(store.clone(), cfg.persist.queue_capacity);
        Self {
            parser: parser_for(cfg.payload.format, cfg.payload.fill()),
            routes: DeviceRoutes::from_entries(&cfg.routes),
            ledger: BatteryLedger::new(cfg.battery, store),
            cache,
            subscribers,
            persist,
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn routes(&self) -> &DeviceRoutes {
        &self.routes
    }

    pub fn ledger(&self) -> &BatteryLedger {
        &self.ledger
    }

    pub fn cache(&self) -> &Arc<LiveCache> {
        &self.cache
    }

    pub fn subscribers(&self) -> &Arc<SubscriberRegistry> {
        &self.subscribers
    }

    pub async fn handle_message(&self, msg: RawMessage) -> IngestOutcome {
        let readings = match self.parser.parse(&msg.topic, &msg.body, msg.received_at) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    error = %e,
                    topic = %msg.topic,
                    format = ?self.parser.format(),
                    "dropping malformed message"
                );
                return IngestOutcome::Malformed(e.to_string());
            }
        };

        let mut outcomes = Vec::with_capacity(readings.len());
        for reading in readings {
            outcomes.push(self.process_reading(reading).await);
        }
        IngestOutcome::Readings(outcomes)
    }

    async fn process_reading(&self, reading: NormalizedReading) -> ReadingOutcome {
        let Some(device_id) = self
            .routes
            .resolve(&reading.location, reading.category)
            .map(str::to_string)
        else {
            warn!(
                location = %reading.location,
                category = %reading.category,
                "no device route, reading skipped"
            );
            return ReadingOutcome::Unrouted {
                location: reading.location,
                category: reading.category,
            };
        };

        let battery_percentage = match self.ledger.record_message(&device_id).await {
            Ok(state) => Some(state.percentage),
            Err(e) => {
                error!(error = %e, device_id = %device_id, "battery update failed");
                None
            }
        };

        self.cache.append(&reading);

        let stored = StoredReading {
            device_id: device_id.clone(),
            reading: reading.clone(),
        };
        let persisted = match self.persist.enqueue(stored).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, device_id = %device_id, "reading not queued for persistence");
                false
            }
        };

        let report = self.subscribers.notify_all(&reading);
        debug!(
            device_id = %device_id,
            fill = reading.average_fill_percentage,
            weight = reading.weight_grams,
            delivered = report.delivered,
            "reading ingested"
        );

        ReadingOutcome::Processed(ProcessReport {
            device_id,
            category: reading.category,
            battery_percentage,
            persisted,
            notified: report.delivered,
        })
    }

    /// Stops accepting readings for persistence and waits for the writer to
    /// drain. Safe to call more than once.
    pub async fn shutdown(&self) -> PersistStats {
        self.persist.close();
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        match writer {
            Some(handle) => match handle.await {
                Ok(stats) => stats,
                Err(e) => {
                    error!(error = %e, "persist writer task failed");
                    PersistStats::default()
                }
            },
            None => PersistStats::default(),
        }
    }
}
