//! Recomputing counter records from bitmap facts.
//!
//! Runs whenever a record read finds an invalid blob. The true counts are
//! always returned to the caller; they are written back only by the holder
//! of the per-entity rebuild lock.

use crate::error::Result;
use crate::fact::FactStore;
use crate::kv::{KvStore, Reply, Script};
use crate::record::{CounterRecord, MAX_VALUE};
use crate::schema::{keys, Metric};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Token-owned, TTL-bounded lock. Released by compare-and-delete so an
/// expired holder can never remove a successor's lock.
pub struct RebuildLock {
    store: Arc<dyn KvStore>,
    key: String,
    token: String,
    held: bool,
}

impl RebuildLock {
    /// `Ok(None)` when another holder owns the lock.
    pub fn try_acquire(
        store: Arc<dyn KvStore>,
        entity_type: &str,
        entity_id: &str,
        ttl: Duration,
    ) -> Result<Option<Self>> {
        let key = keys::rebuild_lock(entity_type, entity_id);
        let token = Uuid::new_v4().to_string();
        if !store.set_nx_px(&key, token.as_bytes(), ttl)? {
            return Ok(None);
        }
        Ok(Some(Self {
            store,
            key,
            token,
            held: true,
        }))
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Returns whether this holder's lock was still present.
    pub fn release(mut self) -> Result<bool> {
        self.held = false;
        self.delete_own()
    }

    fn delete_own(&self) -> Result<bool> {
        let reply = self.store.eval(&Script::DeleteIfEquals {
            key: self.key.clone(),
            expected: self.token.as_bytes().to_vec(),
        })?;
        Ok(matches!(reply, Reply::Deleted(true)))
    }
}

impl Drop for RebuildLock {
    fn drop(&mut self) {
        if self.held {
            if let Err(e) = self.delete_own() {
                warn!(key = %self.key, error = %e, "failed to release rebuild lock; it will expire");
            }
        }
    }
}

#[derive(Clone)]
pub struct RebuildCoordinator {
    store: Arc<dyn KvStore>,
    facts: FactStore,
    lock_ttl: Duration,
}

impl RebuildCoordinator {
    pub fn new(store: Arc<dyn KvStore>, facts: FactStore, lock_ttl: Duration) -> Self {
        Self {
            store,
            facts,
            lock_ttl,
        }
    }

    /// Count `metrics` from facts. With the lock held, every metric is
    /// recounted and cached as a fresh record, and the matching bucket fields
    /// are dropped in the same atomic step since the counts already include
    /// them. Only the requested metrics are returned.
    #[instrument(skip(self, metrics), level = "debug")]
    pub fn rebuild(
        &self,
        entity_type: &str,
        entity_id: &str,
        metrics: &[Metric],
    ) -> Result<BTreeMap<Metric, u64>> {
        let lock = match RebuildLock::try_acquire(
            self.store.clone(),
            entity_type,
            entity_id,
            self.lock_ttl,
        ) {
            Ok(lock) => lock,
            Err(e) => {
                warn!(entity_type, entity_id, error = %e, "rebuild lock unavailable");
                None
            }
        };

        let targets: &[Metric] = if lock.is_some() { &Metric::ALL } else { metrics };
        let mut counts = BTreeMap::new();
        for &metric in targets {
            let population = self
                .facts
                .population(metric, entity_type, entity_id)
                .inspect_err(|e| {
                    warn!(entity_type, entity_id, %metric, error = %e, "shard enumeration failed");
                })?;
            counts.insert(metric, population.min(MAX_VALUE));
        }

        let Some(lock) = lock else {
            debug!(entity_type, entity_id, "rebuild lock contended, returning uncached counts");
            return Ok(counts);
        };

        if let Err(e) = self.write_back(entity_type, entity_id, &counts) {
            warn!(entity_type, entity_id, error = %e, "failed to cache rebuilt record");
        }
        if let Err(e) = lock.release() {
            warn!(entity_type, entity_id, error = %e, "failed to release rebuild lock; it will expire");
        }
        counts.retain(|metric, _| metrics.contains(metric));
        Ok(counts)
    }

    fn write_back(
        &self,
        entity_type: &str,
        entity_id: &str,
        counts: &BTreeMap<Metric, u64>,
    ) -> Result<()> {
        let mut record = CounterRecord::zeroed();
        for (&metric, &value) in counts {
            record.set(metric, value);
        }
        let reply = self.store.eval(&Script::RebuildRecord {
            record: keys::record(entity_type, entity_id),
            bytes: record.into_bytes(),
            bucket: keys::bucket(entity_type, entity_id),
            fields: counts.keys().map(|m| m.index().to_string()).collect(),
        })?;
        debug!(entity_type, entity_id, ?reply, "rebuilt counter record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn setup() -> (Arc<dyn KvStore>, FactStore, RebuildCoordinator) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let facts = FactStore::new(store.clone());
        let coordinator =
            RebuildCoordinator::new(store.clone(), facts.clone(), Duration::from_secs(5));
        (store, facts, coordinator)
    }

    #[test]
    fn test_rebuild_writes_record_and_clears_bucket() {
        let (store, facts, coordinator) = setup();
        for user in [1, 2, 40_000] {
            facts.toggle(Metric::Like, "post", "1", user, true).unwrap();
        }
        store.hash_incr(&keys::bucket("post", "1"), "0", 3).unwrap();

        let counts = coordinator.rebuild("post", "1", &[Metric::Like]).unwrap();
        assert_eq!(counts, BTreeMap::from([(Metric::Like, 3)]));

        let record =
            CounterRecord::from_bytes(store.get(&keys::record("post", "1")).unwrap().unwrap())
                .unwrap();
        assert_eq!(record.get(Metric::Like), 3);
        assert_eq!(store.hash_len(&keys::bucket("post", "1")).unwrap(), 0);
        assert_eq!(store.get(&keys::rebuild_lock("post", "1")).unwrap(), None);
    }

    #[test]
    fn test_rebuild_recounts_unrequested_metrics() {
        let (store, facts, coordinator) = setup();
        facts.toggle(Metric::Like, "post", "6", 1, true).unwrap();
        for user in [1, 2, 3] {
            facts.toggle(Metric::Fav, "post", "6", user, true).unwrap();
        }
        let bucket = keys::bucket("post", "6");
        store.hash_incr(&bucket, "1", 2).unwrap();

        let counts = coordinator.rebuild("post", "6", &[Metric::Like]).unwrap();
        assert_eq!(counts, BTreeMap::from([(Metric::Like, 1)]));

        let record =
            CounterRecord::from_bytes(store.get(&keys::record("post", "6")).unwrap().unwrap())
                .unwrap();
        assert_eq!(record.get(Metric::Fav), 3);
        assert_eq!(store.hash_len(&bucket).unwrap(), 0);
    }

    #[test]
    fn test_contended_rebuild_does_not_write() {
        let (store, facts, coordinator) = setup();
        facts.toggle(Metric::Fav, "post", "2", 5, true).unwrap();
        let held = RebuildLock::try_acquire(store.clone(), "post", "2", Duration::from_secs(5))
            .unwrap()
            .unwrap();

        let counts = coordinator.rebuild("post", "2", &[Metric::Fav]).unwrap();
        assert_eq!(counts[&Metric::Fav], 1);
        assert_eq!(store.get(&keys::record("post", "2")).unwrap(), None);

        assert!(held.release().unwrap());
    }

    #[test]
    fn test_stale_holder_cannot_release_successor() {
        let (store, _, _) = setup();
        let stale = RebuildLock::try_acquire(store.clone(), "post", "3", Duration::from_millis(20))
            .unwrap()
            .unwrap();
        std::thread::sleep(Duration::from_millis(40));
        let fresh = RebuildLock::try_acquire(store.clone(), "post", "3", Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert!(!stale.release().unwrap());
        assert_eq!(
            store.get(&keys::rebuild_lock("post", "3")).unwrap(),
            Some(fresh.token().as_bytes().to_vec())
        );
    }

    #[test]
    fn test_dropped_lock_is_released() {
        let (store, _, _) = setup();
        {
            let _lock = RebuildLock::try_acquire(store.clone(), "post", "4", Duration::from_secs(5))
                .unwrap()
                .unwrap();
        }
        assert!(RebuildLock::try_acquire(store, "post", "4", Duration::from_secs(5))
            .unwrap()
            .is_some());
    }
}
