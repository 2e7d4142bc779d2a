//! Periodic folding of aggregation buckets into counter records.
//!
//! The flusher holds no state of its own: every cycle rediscovers buckets by
//! prefix scan and drains each field with one atomic store script, so any
//! number of flushers can run against the same store.
//!
//! The background loop also sweeps expired keys (dedup markers and stale
//! rebuild locks) out of the store on a slower period.

use crate::config::DEFAULT_PURGE_INTERVAL_MS;
use crate::error::Result;
use crate::kv::{KvStore, Reply, Script};
use crate::schema::{keys, Metric, RECORD_LEN};
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

/// Per-cycle flush counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Buckets visited.
    pub buckets: u64,
    /// Fields whose delta landed in a record.
    pub folded: u64,
    /// Zero-delta fields removed without touching the record.
    pub cleared: u64,
    /// Fields drained into a malformed record (left for rebuild).
    pub malformed: u64,
    /// Fields or buckets that could not be interpreted.
    pub skipped: u64,
    /// Store failures; the delta stays in the bucket for the next cycle.
    pub failures: u64,
}

impl AddAssign for FlushStats {
    fn add_assign(&mut self, rhs: Self) {
        self.buckets += rhs.buckets;
        self.folded += rhs.folded;
        self.cleared += rhs.cleared;
        self.malformed += rhs.malformed;
        self.skipped += rhs.skipped;
        self.failures += rhs.failures;
    }
}

#[derive(Clone)]
pub struct AggregationFlusher {
    store: Arc<dyn KvStore>,
    purge_interval: Duration,
}

impl AggregationFlusher {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            purge_interval: Duration::from_millis(DEFAULT_PURGE_INTERVAL_MS),
        }
    }

    pub fn with_purge_interval(mut self, purge_interval: Duration) -> Self {
        self.purge_interval = purge_interval;
        self
    }

    /// Remove expired keys from the store.
    pub fn purge_expired(&self) -> Result<usize> {
        let purged = self.store.purge_expired()?;
        if purged > 0 {
            debug!(purged, "expired keys removed");
        }
        Ok(purged)
    }

    /// Drain every bucket once. Only a failed bucket scan is an error;
    /// per-field failures are counted and retried next cycle.
    #[instrument(skip(self), level = "debug")]
    pub fn flush_once(&self) -> Result<FlushStats> {
        let mut stats = FlushStats::default();
        for bucket in self.store.scan_prefix(&keys::bucket_prefix())? {
            stats += self.flush_bucket(&bucket);
        }
        if stats.buckets > 0 {
            debug!(
                buckets = stats.buckets,
                folded = stats.folded,
                cleared = stats.cleared,
                malformed = stats.malformed,
                skipped = stats.skipped,
                failures = stats.failures,
                "flush cycle complete"
            );
        }
        Ok(stats)
    }

    fn flush_bucket(&self, bucket: &str) -> FlushStats {
        let mut stats = FlushStats {
            buckets: 1,
            ..FlushStats::default()
        };
        let Some((entity_type, entity_id)) = keys::parse_bucket(bucket) else {
            warn!(bucket, "skipping unparsable bucket key");
            stats.skipped += 1;
            return stats;
        };
        let fields = match self.store.hash_get_all(bucket) {
            Ok(fields) => fields,
            Err(e) => {
                warn!(bucket, error = %e, "failed to read aggregation bucket");
                stats.failures += 1;
                return stats;
            }
        };
        let record = keys::record(entity_type, entity_id);

        for (field, delta) in fields {
            let Some(metric) = field.parse::<usize>().ok().and_then(Metric::from_index) else {
                warn!(bucket, field = %field, "skipping unknown bucket field");
                stats.skipped += 1;
                continue;
            };
            let script = Script::DrainField {
                bucket: bucket.to_string(),
                field,
                record: record.clone(),
                record_len: RECORD_LEN,
                index: metric.index(),
            };
            match self.store.eval(&script) {
                Ok(Reply::Drained { value: Some(value), .. }) => {
                    debug!(entity_type, entity_id, %metric, delta, value, "folded delta");
                    stats.folded += 1;
                }
                Ok(Reply::Drained { delta: 0, .. }) => stats.cleared += 1,
                Ok(Reply::Drained { delta, .. }) => {
                    warn!(entity_type, entity_id, %metric, delta, "record malformed, delta left to rebuild");
                    stats.malformed += 1;
                }
                // Another flusher drained it first.
                Ok(_) => {}
                Err(e) => {
                    warn!(entity_type, entity_id, %metric, error = %e, "fold failed, retrying next cycle");
                    stats.failures += 1;
                }
            }
        }
        stats
    }

    /// Flush every `period` and purge every purge interval until `shutdown`
    /// flips to true. Each cycle runs on the blocking pool since store calls
    /// are synchronous.
    pub async fn run(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut purge = tokio::time::interval(self.purge_interval);
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            period_ms = period.as_millis() as u64,
            purge_ms = self.purge_interval.as_millis() as u64,
            "aggregation flusher started"
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let flusher = self.clone();
                    match tokio::task::spawn_blocking(move || flusher.flush_once()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "flush cycle failed"),
                        Err(e) => warn!(error = %e, "flush task panicked"),
                    }
                }
                _ = purge.tick() => {
                    let flusher = self.clone();
                    match tokio::task::spawn_blocking(move || flusher.purge_expired()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "expired key sweep failed"),
                        Err(e) => warn!(error = %e, "sweep task panicked"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("aggregation flusher stopped");
    }

    pub fn spawn(self, period: Duration, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(period, shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use crate::record::CounterRecord;

    fn counts(store: &dyn KvStore, entity_id: &str) -> CounterRecord {
        CounterRecord::from_bytes(store.get(&keys::record("post", entity_id)).unwrap().unwrap())
            .unwrap()
    }

    #[test]
    fn test_flush_folds_and_removes_bucket() {
        let store = Arc::new(MemoryStore::new());
        let bucket = keys::bucket("post", "42");
        store.hash_incr(&bucket, "0", 3).unwrap();
        store.hash_incr(&bucket, "1", -1).unwrap();
        let flusher = AggregationFlusher::new(store.clone());

        let stats = flusher.flush_once().unwrap();
        assert_eq!(stats.buckets, 1);
        assert_eq!(stats.folded, 2);
        assert_eq!(store.hash_len(&bucket).unwrap(), 0);
        let record = counts(store.as_ref(), "42");
        assert_eq!(record.get(Metric::Like), 3);
        assert_eq!(record.get(Metric::Fav), 0);

        assert_eq!(flusher.flush_once().unwrap(), FlushStats::default());
    }

    #[test]
    fn test_flush_clears_zero_and_skips_unknown_fields() {
        let store = Arc::new(MemoryStore::new());
        let bucket = keys::bucket("post", "7");
        store.hash_incr(&bucket, "0", 0).unwrap();
        store.hash_incr(&bucket, "9", 4).unwrap();
        let stats = AggregationFlusher::new(store.clone()).flush_once().unwrap();
        assert_eq!((stats.cleared, stats.skipped, stats.folded), (1, 1, 0));
        assert_eq!(store.hash_get_all(&bucket).unwrap(), vec![("9".to_string(), 4)]);
        assert_eq!(store.get(&keys::record("post", "7")).unwrap(), None);
    }

    #[test]
    fn test_malformed_record_is_left_alone() {
        let store = Arc::new(MemoryStore::new());
        store.set(&keys::record("post", "1"), vec![1, 2, 3]).unwrap();
        store.hash_incr(&keys::bucket("post", "1"), "0", 1).unwrap();
        let stats = AggregationFlusher::new(store.clone()).flush_once().unwrap();
        assert_eq!(stats.malformed, 1);
        assert_eq!(store.get(&keys::record("post", "1")).unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_negative_fold_clamps_at_zero() {
        let store = Arc::new(MemoryStore::new());
        store.hash_incr(&keys::bucket("post", "9"), "0", -5).unwrap();
        AggregationFlusher::new(store.clone()).flush_once().unwrap();
        assert_eq!(counts(store.as_ref(), "9").get(Metric::Like), 0);
    }

    #[tokio::test]
    async fn test_background_flusher_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        store.hash_incr(&keys::bucket("post", "5"), "1", 2).unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = AggregationFlusher::new(store.clone()).spawn(Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(counts(store.as_ref(), "5").get(Metric::Fav), 2);
    }

    #[tokio::test]
    async fn test_background_loop_sweeps_expired_keys() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..50 {
            let key = keys::dedup("counter-agg", &i.to_string());
            store.set_nx_px(&key, b"1", Duration::from_millis(1)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (tx, rx) = watch::channel(false);
        let handle = AggregationFlusher::new(store.clone())
            .with_purge_interval(Duration::from_millis(10))
            .spawn(Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(store.purge_expired().unwrap(), 0);
    }
}
