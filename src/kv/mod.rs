//! # Key-Value Store
//!
//! The shared store every counter process talks to. Facts, counter records,
//! aggregation buckets and rebuild locks all live here.
//!
//! Anything that must be atomic is expressed as a [`Script`]: a fixed,
//! server-side multi-step operation executed by [`KvStore::eval`] without
//! interleaving. Callers never do read-then-write on the client side.
//! Script semantics are implemented once in [`script`] against the
//! [`ScriptHost`] trait, so every backend runs the same logic.

mod memory;
mod rocks;
pub mod script;

pub use memory::MemoryStore;
pub use rocks::RocksStore;
pub use script::{Dedup, Reply, Script, ScriptHost};

use crate::config::{StoreBackend, StoreConfig, KV_DIR};
use crate::error::{CounterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A stored value: a byte string or a field → integer hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Bytes(Vec<u8>),
    Hash(BTreeMap<String, i64>),
}

/// A value plus its absolute expiry (milliseconds since the Unix epoch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stored {
    pub value: Value,
    pub expires_at_ms: Option<u64>,
}

impl Stored {
    pub fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at_ms: ttl.map(|ttl| now_ms().saturating_add(ttl.as_millis() as u64)),
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn expect_bytes(key: &str, value: Value) -> Result<Vec<u8>> {
    match value {
        Value::Bytes(bytes) => Ok(bytes),
        Value::Hash(_) => Err(CounterError::WrongType {
            key: key.to_string(),
        }),
    }
}

pub(crate) fn expect_hash(key: &str, value: Value) -> Result<BTreeMap<String, i64>> {
    match value {
        Value::Hash(hash) => Ok(hash),
        Value::Bytes(_) => Err(CounterError::WrongType {
            key: key.to_string(),
        }),
    }
}

/// Capability set the counter subsystem needs from its shared store.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Read many keys in one round trip. Missing keys yield `None`; keys of
    /// the wrong type also yield `None` rather than failing the batch.
    fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    fn delete(&self, key: &str) -> Result<bool>;

    fn get_bit(&self, key: &str, offset: u64) -> Result<bool>;

    /// Population count of each key, in order. Missing keys count 0.
    fn bit_counts(&self, keys: &[String]) -> Result<Vec<u64>>;

    /// Every live key starting with `prefix`, in byte order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    fn hash_get_all(&self, key: &str) -> Result<Vec<(String, i64)>>;

    fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    /// Remove fields; the key itself disappears once the hash is empty.
    fn hash_delete(&self, key: &str, fields: &[String]) -> Result<usize>;

    fn hash_len(&self, key: &str) -> Result<usize>;

    /// Set `key` only if absent, with an expiry. Returns whether it was set.
    fn set_nx_px(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Execute one atomic script.
    fn eval(&self, script: &Script) -> Result<Reply>;

    /// Physically remove every expired key. Returns how many were removed.
    fn purge_expired(&self) -> Result<usize>;
}

/// Open the store backend selected by configuration.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn KvStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Rocksdb => {
            let dir = config.data_dir.as_ref().ok_or_else(|| {
                CounterError::Config("store.data_dir is required for the rocksdb backend".into())
            })?;
            Ok(Arc::new(RocksStore::open(dir.join(KV_DIR))?))
        }
    }
}
