//! Default constants for tally configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Store Defaults
// =============================================================================

/// Subdirectory of the data dir holding the key-value store.
pub const KV_DIR: &str = "kv";

/// Subdirectory of the data dir holding the event log.
pub const EVENTS_DIR: &str = "events";

// =============================================================================
// Event Log Defaults
// =============================================================================

/// Default number of event log partitions.
/// Fixed for the lifetime of a persistent log.
pub const DEFAULT_EVENT_PARTITIONS: u32 = 8;

/// Delay between aggregation consumer polls when the log is idle (ms).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Maximum events fetched per partition per poll.
pub const DEFAULT_POLL_BATCH: usize = 500;

/// How long an event id is remembered for duplicate suppression (seconds).
/// Must exceed the longest expected redelivery window.
pub const DEFAULT_DEDUP_TTL_SECS: u64 = 600;

// =============================================================================
// Flusher Defaults
// =============================================================================

/// Period between aggregation flush cycles (ms).
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;

/// Period between sweeps that remove expired dedup keys and locks (ms).
pub const DEFAULT_PURGE_INTERVAL_MS: u64 = 60_000;

// =============================================================================
// Rebuild Defaults
// =============================================================================

/// Lifetime of a rebuild lock (ms).
/// Bounds how long a crashed rebuilder can block others.
pub const DEFAULT_REBUILD_LOCK_TTL_MS: u64 = 5_000;

// =============================================================================
// Replay Defaults
// =============================================================================

/// Events fetched per partition per replay poll.
pub const DEFAULT_REPLAY_BATCH: usize = 1_000;
