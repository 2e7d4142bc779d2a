use super::{CounterEvent, EventLog};
use std::sync::Arc;
use tracing::{debug, warn};

/// Synchronous in-process observer of changed toggles, e.g. a local cache
/// that must drop an entity's counts.
pub trait CounterListener: Send + Sync {
    fn on_counter_event(&self, event: &CounterEvent);
}

impl<F> CounterListener for F
where
    F: Fn(&CounterEvent) + Send + Sync,
{
    fn on_counter_event(&self, event: &CounterEvent) {
        self(event)
    }
}

/// Fire-and-forget publisher. Events are keyed by entity id so every delta
/// for one entity lands in one partition, in publish order.
#[derive(Clone)]
pub struct CounterEventProducer {
    log: Arc<dyn EventLog>,
}

impl CounterEventProducer {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    /// Append one event. Failures are logged and swallowed: the fact write
    /// already happened, so the record drifts from the facts until it is
    /// next invalidated and rebuilt.
    pub fn publish(&self, event: &CounterEvent) -> Option<(u32, u64)> {
        let payload = match event.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "failed to encode counter event");
                return None;
            }
        };
        match self.log.append(&event.entity_id, payload) {
            Ok((partition, offset)) => {
                debug!(
                    entity_type = %event.entity_type,
                    entity_id = %event.entity_id,
                    metric = %event.metric,
                    delta = event.delta,
                    partition,
                    offset,
                    "published counter event"
                );
                Some((partition, offset))
            }
            Err(e) => {
                warn!(
                    entity_type = %event.entity_type,
                    entity_id = %event.entity_id,
                    metric = %event.metric,
                    error = %e,
                    "failed to publish counter event"
                );
                None
            }
        }
    }
}
