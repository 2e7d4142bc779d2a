//! Event consumer that accumulates deltas into aggregation buckets.

use crate::config::{EventsConfig, MalformedEventPolicy};
use crate::error::Result;
use crate::event::{ConsumeStats, CounterEvent, EventConsumer, EventLog, Outcome, AGGREGATION_GROUP};
use crate::kv::{Dedup, KvStore, Reply, Script};
use crate::schema::keys;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Applies each event as `HINCRBY agg:{etype}:{eid} {idx} {delta}`, guarded
/// by the event id so a redelivered event is counted once.
pub struct AggregationConsumer {
    store: Arc<dyn KvStore>,
    consumer: EventConsumer,
    dedup_ttl: Duration,
}

impl AggregationConsumer {
    pub fn new(store: Arc<dyn KvStore>, log: Arc<dyn EventLog>, config: &EventsConfig) -> Self {
        Self::with_policy(store, log, config, config.malformed)
    }

    pub fn with_policy(
        store: Arc<dyn KvStore>,
        log: Arc<dyn EventLog>,
        config: &EventsConfig,
        policy: MalformedEventPolicy,
    ) -> Self {
        Self {
            store,
            consumer: EventConsumer::new(log, AGGREGATION_GROUP, policy, config.poll_batch),
            dedup_ttl: config.dedup_ttl(),
        }
    }

    pub fn apply(&self, event: &CounterEvent) -> Result<Outcome> {
        let dedup = event.has_event_id().then(|| Dedup {
            key: keys::dedup(AGGREGATION_GROUP, &event.event_id),
            ttl: self.dedup_ttl,
        });
        let reply = self.store.eval(&Script::IncrField {
            key: keys::bucket(&event.entity_type, &event.entity_id),
            field: event.idx.to_string(),
            delta: i64::from(event.delta),
            dedup,
        })?;
        Ok(match reply {
            Reply::Duplicate => Outcome::Duplicate,
            _ => Outcome::Applied,
        })
    }

    /// One batch per partition.
    pub fn poll_once(&self) -> Result<ConsumeStats> {
        self.consumer.poll_once(|event| self.apply(event))
    }

    /// Consume until caught up.
    pub fn drain(&self) -> Result<ConsumeStats> {
        self.consumer.drain(|event| self.apply(event))
    }

    /// Poll continuously, sleeping `idle` whenever a round finds nothing.
    pub async fn run(self: Arc<Self>, idle: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(group = AGGREGATION_GROUP, "aggregation consumer started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let worker = self.clone();
            let progressed = match tokio::task::spawn_blocking(move || worker.poll_once()).await {
                Ok(Ok(stats)) => stats.committed() > 0,
                Ok(Err(e)) => {
                    warn!(error = %e, "aggregation poll failed");
                    false
                }
                Err(e) => {
                    warn!(error = %e, "aggregation poll panicked");
                    false
                }
            };
            if progressed {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(group = AGGREGATION_GROUP, "aggregation consumer stopped");
    }

    pub fn spawn(self: Arc<Self>, idle: Duration, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(idle, shutdown))
    }
}
