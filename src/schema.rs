//! # Schema Module
//!
//! Fixed counter schema shared by every process that touches the store:
//! the metric table, the counter record layout and the key naming scheme.
//! Changing any constant here requires bumping [`SCHEMA_ID`].

use crate::error::CounterError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Version tag embedded in record and bucket keys.
pub const SCHEMA_ID: &str = "v1";

/// Width of one counter segment in bytes (unsigned 32-bit, big-endian).
pub const FIELD_SIZE: usize = 4;

/// Number of metrics in the schema.
pub const SCHEMA_LEN: usize = Metric::ALL.len();

/// Expected byte length of a valid counter record.
pub const RECORD_LEN: usize = SCHEMA_LEN * FIELD_SIZE;

/// A named counter with a fixed position in the counter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Like,
    Fav,
}

impl Metric {
    /// All metrics, ordered by schema index.
    pub const ALL: [Metric; 2] = [Metric::Like, Metric::Fav];

    pub const fn index(self) -> usize {
        match self {
            Metric::Like => 0,
            Metric::Fav => 1,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Metric::Like => "like",
            Metric::Fav => "fav",
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }

    /// Byte offset of this metric's segment in the counter record.
    pub const fn offset(self) -> usize {
        self.index() * FIELD_SIZE
    }

    /// Parse a list of metric names, dropping anything not in the schema.
    /// An empty input selects every metric.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Vec<Metric> {
        if names.is_empty() {
            return Self::ALL.to_vec();
        }
        Self::select(names)
    }

    /// Known metrics among `names`, first occurrence order, no duplicates.
    pub fn select<S: AsRef<str>>(names: &[S]) -> Vec<Metric> {
        let mut metrics = Vec::with_capacity(names.len());
        for name in names {
            if let Some(metric) = Self::from_name(name.as_ref().trim()) {
                if !metrics.contains(&metric) {
                    metrics.push(metric);
                }
            }
        }
        metrics
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = CounterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| CounterError::UnknownMetric(s.to_string()))
    }
}

/// Key naming for everything the counter subsystem stores.
pub mod keys {
    use super::{Metric, SCHEMA_ID};

    /// Counter record: `cnt:{schema}:{etype}:{eid}`.
    pub fn record(entity_type: &str, entity_id: &str) -> String {
        format!("cnt:{SCHEMA_ID}:{entity_type}:{entity_id}")
    }

    /// Bitmap shard: `bm:{metric}:{etype}:{eid}:{shard}`.
    pub fn shard(metric: Metric, entity_type: &str, entity_id: &str, shard: u64) -> String {
        format!("bm:{}:{entity_type}:{entity_id}:{shard}", metric.name())
    }

    /// Prefix shared by every shard of one (metric, entity).
    pub fn shard_prefix(metric: Metric, entity_type: &str, entity_id: &str) -> String {
        format!("bm:{}:{entity_type}:{entity_id}:", metric.name())
    }

    /// Aggregation bucket: `agg:{schema}:{etype}:{eid}`.
    pub fn bucket(entity_type: &str, entity_id: &str) -> String {
        format!("agg:{SCHEMA_ID}:{entity_type}:{entity_id}")
    }

    /// Prefix shared by every aggregation bucket of the current schema.
    pub fn bucket_prefix() -> String {
        format!("agg:{SCHEMA_ID}:")
    }

    /// Split a bucket key back into `(entity_type, entity_id)`.
    pub fn parse_bucket(key: &str) -> Option<(&str, &str)> {
        let rest = key.strip_prefix("agg:")?;
        let rest = rest.strip_prefix(SCHEMA_ID)?.strip_prefix(':')?;
        let (entity_type, entity_id) = rest.split_once(':')?;
        if entity_type.is_empty() || entity_id.is_empty() {
            return None;
        }
        Some((entity_type, entity_id))
    }

    /// Rebuild lock: `lock:sds-rebuild:{etype}:{eid}`.
    pub fn rebuild_lock(entity_type: &str, entity_id: &str) -> String {
        format!("lock:sds-rebuild:{entity_type}:{entity_id}")
    }

    /// Idempotency marker for one event within one consumer group.
    pub fn dedup(group: &str, event_id: &str) -> String {
        format!("dedup:cnt:{group}:{event_id}")
    }
}
