//! # Tally
//!
//! Engagement counters (likes, favourites) for content entities.
//!
//! Per-user facts live in sharded bitmaps and are the source of truth. Each
//! successful toggle publishes a signed delta to an ordered event log; a
//! consumer accumulates deltas into per-entity buckets and a periodic flusher
//! folds them into a compact fixed-width counter record. Reads serve the
//! record and rebuild it from facts whenever it cannot be trusted.
//!
//! Every multi-step mutation runs as one atomic script inside the shared
//! [`kv::KvStore`], so any number of service processes can share a store.

pub mod aggregation;
pub mod bitmap;
pub mod config;
pub mod error;
pub mod event;
pub mod fact;
pub mod flusher;
pub mod kv;
pub mod rebuild;
pub mod record;
pub mod replay;
pub mod runtime;
pub mod schema;
pub mod service;
pub mod sharding;

pub use aggregation::AggregationConsumer;
pub use config::{MalformedEventPolicy, StoreBackend, TallyConfig};
pub use error::{CounterError, Result};
pub use event::{CounterEvent, CounterListener, EventLog};
pub use fact::FactStore;
pub use flusher::{AggregationFlusher, FlushStats};
pub use kv::{KvStore, MemoryStore, RocksStore};
pub use rebuild::{RebuildCoordinator, RebuildLock};
pub use record::CounterRecord;
pub use replay::DisasterReplay;
pub use runtime::{Counters, Workers};
pub use schema::Metric;
pub use service::{CounterService, Counts};
pub use sharding::{ShardMapper, ShardSlot, SHARD_BITS};
