//! Unified configuration for tally components.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (tally.toml)
//! ```toml
//! [store]
//! backend = "rocksdb"
//! data_dir = "/var/lib/tally"
//!
//! [events]
//! partitions = 8
//! malformed = "skip-and-commit"
//!
//! [flusher]
//! interval_ms = 1000
//!
//! [replay]
//! enabled = false
//! ```
//!
//! Environment variables use the `TALLY_` prefix with `__` between nested
//! keys, e.g. `TALLY_FLUSHER__INTERVAL_MS=250`.

mod defaults;

pub use defaults::*;

use crate::error::{CounterError, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for tally components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    pub store: StoreConfig,
    pub events: EventsConfig,
    pub flusher: FlusherConfig,
    pub rebuild: RebuildConfig,
    pub replay: ReplayConfig,
}

impl TallyConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    pub fn load(config_path: Option<&str>, overrides: ConfigOverrides) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(TallyConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("TALLY_").split("__"));
        figment = figment.merge(Serialized::defaults(overrides));

        let config: TallyConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self> {
        Self::load(config_path, ConfigOverrides::default())
    }

    /// In-memory store and log, every default otherwise.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// RocksDB store and log rooted at `data_dir`.
    pub fn persistent(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig {
                backend: StoreBackend::Rocksdb,
                data_dir: Some(data_dir.into()),
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Rocksdb && self.store.data_dir.is_none() {
            return Err(CounterError::Config(
                "store.data_dir is required for the rocksdb backend".into(),
            ));
        }
        if self.events.partitions == 0 {
            return Err(CounterError::Config("events.partitions must be > 0".into()));
        }
        if self.flusher.interval_ms == 0 {
            return Err(CounterError::Config("flusher.interval_ms must be > 0".into()));
        }
        if self.flusher.purge_interval_ms == 0 {
            return Err(CounterError::Config(
                "flusher.purge_interval_ms must be > 0".into(),
            ));
        }
        if self.rebuild.lock_ttl_ms == 0 {
            return Err(CounterError::Config("rebuild.lock_ttl_ms must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Rocksdb,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Root directory for the rocksdb backend
    pub data_dir: Option<PathBuf>,
}

/// What a consumer does with a payload it cannot decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MalformedEventPolicy {
    /// Log at warn and commit past it.
    #[default]
    SkipAndCommit,
    /// Leave it uncommitted; the partition stalls until an operator acts.
    Retry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Partition count (fixed once a persistent log exists)
    pub partitions: u32,
    /// Idle delay between aggregation polls
    pub poll_interval_ms: u64,
    /// Max events per partition per poll
    pub poll_batch: usize,
    /// Duplicate suppression window
    pub dedup_ttl_secs: u64,
    pub malformed: MalformedEventPolicy,
}

impl EventsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            partitions: DEFAULT_EVENT_PARTITIONS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            poll_batch: DEFAULT_POLL_BATCH,
            dedup_ttl_secs: DEFAULT_DEDUP_TTL_SECS,
            malformed: MalformedEventPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlusherConfig {
    /// Run the periodic flusher in this process
    pub enabled: bool,
    pub interval_ms: u64,
    /// Expired-key sweep period; the sweep runs alongside the flusher
    pub purge_interval_ms: u64,
}

impl FlusherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            purge_interval_ms: DEFAULT_PURGE_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebuildConfig {
    pub lock_ttl_ms: u64,
}

impl RebuildConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: DEFAULT_REBUILD_LOCK_TTL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Replay the whole log into records at startup
    pub enabled: bool,
    pub batch: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch: DEFAULT_REPLAY_BATCH,
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flusher: Option<FlusherOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay: Option<ReplayOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<StoreBackend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlusherOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TallyConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.flusher.interval(), Duration::from_millis(1_000));
        assert_eq!(config.flusher.purge_interval(), Duration::from_secs(60));
        assert_eq!(config.rebuild.lock_ttl(), Duration::from_millis(5_000));
        assert_eq!(config.events.dedup_ttl(), Duration::from_secs(600));
        assert_eq!(config.events.malformed, MalformedEventPolicy::SkipAndCommit);
        assert!(!config.replay.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_policy_serde() {
        let json = serde_json::to_string(&MalformedEventPolicy::SkipAndCommit).unwrap();
        assert_eq!(json, "\"skip-and-commit\"");
        let policy: MalformedEventPolicy = serde_json::from_str("\"retry\"").unwrap();
        assert_eq!(policy, MalformedEventPolicy::Retry);
    }

    #[test]
    fn test_file_then_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[store]\nbackend = \"rocksdb\"\ndata_dir = \"/tmp/tally\"\n\n[flusher]\ninterval_ms = 250\n\n[events]\nmalformed = \"retry\""
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = TallyConfig::from_env(Some(&path)).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Rocksdb);
        assert_eq!(config.flusher.interval_ms, 250);
        assert_eq!(config.events.malformed, MalformedEventPolicy::Retry);

        let overrides = ConfigOverrides {
            flusher: Some(FlusherOverrides {
                interval_ms: Some(50),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = TallyConfig::load(Some(&path), overrides).unwrap();
        assert_eq!(config.flusher.interval_ms, 50);
        assert!(config.flusher.enabled);
    }

    #[test]
    fn test_rocksdb_requires_data_dir() {
        let mut config = TallyConfig::default();
        config.store.backend = StoreBackend::Rocksdb;
        assert!(config.validate().is_err());
    }
}
