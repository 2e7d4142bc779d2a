//! # Counter Service
//!
//! Request-facing API: toggles write facts and publish deltas, reads serve
//! the cached counter record and fall back to a fact rebuild when the record
//! cannot be trusted.

use crate::config::RebuildConfig;
use crate::error::Result;
use crate::event::{CounterEvent, CounterEventProducer, CounterListener};
use crate::fact::FactStore;
use crate::kv::KvStore;
use crate::rebuild::RebuildCoordinator;
use crate::record::{self, CounterRecord};
use crate::schema::{keys, Metric};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Counts keyed by metric.
pub type Counts = BTreeMap<Metric, u64>;

pub struct CounterService {
    store: Arc<dyn KvStore>,
    facts: FactStore,
    rebuild: RebuildCoordinator,
    producer: CounterEventProducer,
    listeners: RwLock<Vec<Arc<dyn CounterListener>>>,
}

impl CounterService {
    pub fn new(
        store: Arc<dyn KvStore>,
        producer: CounterEventProducer,
        config: &RebuildConfig,
    ) -> Self {
        let facts = FactStore::new(store.clone());
        let rebuild = RebuildCoordinator::new(store.clone(), facts.clone(), config.lock_ttl());
        Self {
            store,
            facts,
            rebuild,
            producer,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn facts(&self) -> &FactStore {
        &self.facts
    }

    pub fn rebuilder(&self) -> &RebuildCoordinator {
        &self.rebuild
    }

    /// Register a listener notified synchronously after every changed toggle.
    pub fn add_listener(&self, listener: Arc<dyn CounterListener>) {
        self.listeners.write().push(listener);
    }

    /// Set or clear one user's fact. On a change, publishes one event and
    /// notifies listeners; an unchanged toggle does neither.
    pub fn toggle(
        &self,
        metric: Metric,
        entity_type: &str,
        entity_id: &str,
        user_id: u64,
        add: bool,
    ) -> Result<bool> {
        let changed = self
            .facts
            .toggle(metric, entity_type, entity_id, user_id, add)?;
        if changed {
            let event = CounterEvent::new(entity_type, entity_id, metric, user_id, add);
            self.producer.publish(&event);
            for listener in self.listeners.read().iter() {
                listener.on_counter_event(&event);
            }
        }
        Ok(changed)
    }

    pub fn like(&self, entity_type: &str, entity_id: &str, user_id: u64) -> Result<bool> {
        self.toggle(Metric::Like, entity_type, entity_id, user_id, true)
    }

    pub fn unlike(&self, entity_type: &str, entity_id: &str, user_id: u64) -> Result<bool> {
        self.toggle(Metric::Like, entity_type, entity_id, user_id, false)
    }

    pub fn fav(&self, entity_type: &str, entity_id: &str, user_id: u64) -> Result<bool> {
        self.toggle(Metric::Fav, entity_type, entity_id, user_id, true)
    }

    pub fn unfav(&self, entity_type: &str, entity_id: &str, user_id: u64) -> Result<bool> {
        self.toggle(Metric::Fav, entity_type, entity_id, user_id, false)
    }

    pub fn is_liked(&self, entity_type: &str, entity_id: &str, user_id: u64) -> Result<bool> {
        self.facts
            .is_member(Metric::Like, entity_type, entity_id, user_id)
    }

    pub fn is_faved(&self, entity_type: &str, entity_id: &str, user_id: u64) -> Result<bool> {
        self.facts
            .is_member(Metric::Fav, entity_type, entity_id, user_id)
    }

    /// Counts for one entity. Unknown metric names are ignored. An invalid
    /// or missing record triggers a rebuild from facts.
    pub fn get_counts<S: AsRef<str>>(
        &self,
        entity_type: &str,
        entity_id: &str,
        metrics: &[S],
    ) -> Result<Counts> {
        let metrics = Metric::select(metrics);
        if metrics.is_empty() {
            return Ok(Counts::new());
        }
        let raw = self.store.get(&keys::record(entity_type, entity_id))?;
        match raw.and_then(CounterRecord::from_bytes) {
            Some(record) => Ok(metrics.iter().map(|&m| (m, record.get(m))).collect()),
            None => {
                debug!(entity_type, entity_id, "counter record invalid, rebuilding");
                self.rebuild.rebuild(entity_type, entity_id, &metrics)
            }
        }
    }

    /// Counts for many entities of one type in one store round trip.
    /// Missing or invalid records read as zero; nothing is rebuilt inline.
    pub fn get_counts_batch<S: AsRef<str>, I: AsRef<str>>(
        &self,
        entity_type: &str,
        entity_ids: &[I],
        metrics: &[S],
    ) -> Result<BTreeMap<String, Counts>> {
        let metrics = Metric::select(metrics);
        if entity_ids.is_empty() || metrics.is_empty() {
            return Ok(BTreeMap::new());
        }
        let record_keys: Vec<String> = entity_ids
            .iter()
            .map(|id| keys::record(entity_type, id.as_ref()))
            .collect();
        let raws = self.store.mget(&record_keys)?;

        let mut out = BTreeMap::new();
        for (id, raw) in entity_ids.iter().zip(raws) {
            let counts = match raw.as_deref() {
                Some(buf) if record::is_valid(Some(buf)) => metrics
                    .iter()
                    .map(|&m| (m, record::decode(buf, m.index())))
                    .collect(),
                _ => metrics.iter().map(|&m| (m, 0)).collect(),
            };
            out.insert(id.as_ref().to_string(), counts);
        }
        Ok(out)
    }
}
