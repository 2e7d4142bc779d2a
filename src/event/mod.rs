//! Counter events: the signed deltas emitted by successful toggles, the
//! ordered log that carries them, and the consumer plumbing that applies
//! them with at-least-once semantics.

mod consumer;
mod log;
mod producer;

pub use consumer::{ConsumeStats, EventConsumer, Outcome};
pub use log::{partition_for, EventLog, LogEntry, MemoryEventLog, RocksEventLog};
pub use producer::{CounterEventProducer, CounterListener};

use crate::config::{EventsConfig, StoreBackend, StoreConfig, EVENTS_DIR};
use crate::error::{CounterError, Result};
use crate::schema::Metric;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Consumer group that folds events into aggregation buckets.
pub const AGGREGATION_GROUP: &str = "counter-agg";

/// Consumer group used by disaster replay.
pub const REPLAY_GROUP: &str = "counter-rebuild";

/// One signed delta for one (entity, metric), produced by one toggle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterEvent {
    /// Idempotency key. Empty for payloads written without one, which then
    /// bypass dedup.
    #[serde(default)]
    pub event_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub metric: Metric,
    pub idx: usize,
    pub user_id: u64,
    pub delta: i32,
}

impl CounterEvent {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        metric: Metric,
        user_id: u64,
        add: bool,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            metric,
            idx: metric.index(),
            user_id,
            delta: if add { 1 } else { -1 },
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and validate a log payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let event: CounterEvent = serde_json::from_slice(payload)?;
        if event.idx != event.metric.index() {
            return Err(CounterError::MalformedEvent(format!(
                "metric {} does not live at index {}",
                event.metric, event.idx
            )));
        }
        if event.delta != 1 && event.delta != -1 {
            return Err(CounterError::MalformedEvent(format!(
                "event {} carries delta {}",
                event.event_id, event.delta
            )));
        }
        if event.entity_type.is_empty() || event.entity_id.is_empty() {
            return Err(CounterError::MalformedEvent(format!(
                "event {} has an empty entity key",
                event.event_id
            )));
        }
        Ok(event)
    }

    pub fn has_event_id(&self) -> bool {
        !self.event_id.is_empty()
    }
}

/// Open the event log selected by configuration. The RocksDB log shares the
/// store's data directory.
pub fn open_event_log(store: &StoreConfig, events: &EventsConfig) -> Result<Arc<dyn EventLog>> {
    match store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryEventLog::new(events.partitions))),
        StoreBackend::Rocksdb => {
            let dir = store.data_dir.as_ref().ok_or_else(|| {
                CounterError::Config("store.data_dir is required for the rocksdb backend".into())
            })?;
            Ok(Arc::new(RocksEventLog::open(
                dir.join(EVENTS_DIR),
                events.partitions,
            )?))
        }
    }
}
