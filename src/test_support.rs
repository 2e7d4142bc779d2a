#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tally::kv::{Reply, Script};
use tally::{CounterError, Counters, FlushStats, KvStore, MemoryStore, Result, TallyConfig};

/// Fresh in-memory store and log.
pub fn memory_counters() -> anyhow::Result<Counters> {
    Ok(Counters::open(TallyConfig::in_memory())?)
}

/// RocksDB store and log under `dir`.
pub fn persistent_counters(dir: &Path) -> anyhow::Result<Counters> {
    Ok(Counters::open(TallyConfig::persistent(dir))?)
}

/// Consume every pending event into buckets, then flush buckets into records.
pub fn settle(counters: &Counters) -> anyhow::Result<FlushStats> {
    counters.aggregation_consumer().drain()?;
    Ok(counters.flusher().flush_once()?)
}

/// One randomized toggle: `(user_id, add)`.
#[derive(Debug, Clone, Copy)]
pub struct Toggle {
    pub user_id: u64,
    pub add: bool,
}

/// Seeded toggle workload over `users` distinct ids spread across shards.
pub fn random_toggles(seed: u64, users: u64, ops: usize) -> Vec<Toggle> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..ops)
        .map(|_| Toggle {
            // Stride pushes ids past the first shard.
            user_id: rng.random_range(0..users) * 997,
            add: rng.random_bool(0.6),
        })
        .collect()
}

/// Users whose fact is set after applying `toggles` in order.
pub fn expected_members(toggles: &[Toggle]) -> BTreeSet<u64> {
    let mut members = BTreeSet::new();
    for toggle in toggles {
        if toggle.add {
            members.insert(toggle.user_id);
        } else {
            members.remove(&toggle.user_id);
        }
    }
    members
}

/// In-memory store whose script, scan and lock calls can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    pub fail_eval: AtomicBool,
    pub fail_scan: AtomicBool,
    pub fail_set_nx: AtomicBool,
}

impl FlakyStore {
    fn check(flag: &AtomicBool, op: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(CounterError::Unavailable(format!("{op} refused")));
        }
        Ok(())
    }
}

impl KvStore for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.inner.mget(keys)
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key)
    }

    fn get_bit(&self, key: &str, offset: u64) -> Result<bool> {
        self.inner.get_bit(key, offset)
    }

    fn bit_counts(&self, keys: &[String]) -> Result<Vec<u64>> {
        self.inner.bit_counts(keys)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Self::check(&self.fail_scan, "scan")?;
        self.inner.scan_prefix(prefix)
    }

    fn hash_get_all(&self, key: &str) -> Result<Vec<(String, i64)>> {
        self.inner.hash_get_all(key)
    }

    fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.inner.hash_incr(key, field, delta)
    }

    fn hash_delete(&self, key: &str, fields: &[String]) -> Result<usize> {
        self.inner.hash_delete(key, fields)
    }

    fn hash_len(&self, key: &str) -> Result<usize> {
        self.inner.hash_len(key)
    }

    fn set_nx_px(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        Self::check(&self.fail_set_nx, "set_nx_px")?;
        self.inner.set_nx_px(key, value, ttl)
    }

    fn eval(&self, script: &Script) -> Result<Reply> {
        Self::check(&self.fail_eval, "eval")?;
        self.inner.eval(script)
    }

    fn purge_expired(&self) -> Result<usize> {
        self.inner.purge_expired()
    }
}
