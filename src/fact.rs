//! Sharded bitmap facts: the source of truth for "did user U like entity E".

use crate::error::Result;
use crate::kv::{KvStore, Reply, Script};
use crate::schema::{keys, Metric};
use crate::sharding::ShardMapper;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct FactStore {
    store: Arc<dyn KvStore>,
    mapper: ShardMapper,
}

impl FactStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_mapper(store, ShardMapper::default())
    }

    pub fn with_mapper(store: Arc<dyn KvStore>, mapper: ShardMapper) -> Self {
        Self { store, mapper }
    }

    pub fn mapper(&self) -> ShardMapper {
        self.mapper
    }

    /// Set (`add`) or clear the user's bit. Returns whether the bit changed.
    /// The check and the write are one store-side operation, so two
    /// concurrent adds for the same user never both see `true`.
    pub fn toggle(
        &self,
        metric: Metric,
        entity_type: &str,
        entity_id: &str,
        user_id: u64,
        add: bool,
    ) -> Result<bool> {
        let slot = self.mapper.locate(user_id);
        let key = keys::shard(metric, entity_type, entity_id, slot.shard);
        let reply = self.store.eval(&Script::ToggleBit {
            key,
            offset: slot.bit,
            set: add,
        })?;
        let changed = matches!(reply, Reply::Changed(true));
        debug!(%metric, entity_type, entity_id, user_id, add, changed, "fact toggle");
        Ok(changed)
    }

    pub fn is_member(
        &self,
        metric: Metric,
        entity_type: &str,
        entity_id: &str,
        user_id: u64,
    ) -> Result<bool> {
        let slot = self.mapper.locate(user_id);
        self.store
            .get_bit(&keys::shard(metric, entity_type, entity_id, slot.shard), slot.bit)
    }

    /// Total set bits across every shard of (metric, entity).
    pub fn population(&self, metric: Metric, entity_type: &str, entity_id: &str) -> Result<u64> {
        let prefix = keys::shard_prefix(metric, entity_type, entity_id);
        // An entity id that itself contains ':' shares this prefix with
        // longer ids; only keys ending in a bare shard number are ours.
        let shards: Vec<String> = self
            .store
            .scan_prefix(&prefix)?
            .into_iter()
            .filter(|key| key[prefix.len()..].parse::<u64>().is_ok())
            .collect();
        if shards.is_empty() {
            return Ok(0);
        }
        Ok(self.store.bit_counts(&shards)?.into_iter().sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn facts() -> FactStore {
        FactStore::with_mapper(Arc::new(MemoryStore::new()), ShardMapper::new(64))
    }

    #[test]
    fn test_toggle_is_idempotent() {
        let facts = facts();
        assert!(facts.toggle(Metric::Like, "post", "1", 7, true).unwrap());
        assert!(!facts.toggle(Metric::Like, "post", "1", 7, true).unwrap());
        assert!(facts.is_member(Metric::Like, "post", "1", 7).unwrap());
        assert!(!facts.is_member(Metric::Fav, "post", "1", 7).unwrap());
        assert!(facts.toggle(Metric::Like, "post", "1", 7, false).unwrap());
        assert!(!facts.toggle(Metric::Like, "post", "1", 7, false).unwrap());
        assert!(!facts.is_member(Metric::Like, "post", "1", 7).unwrap());
    }

    #[test]
    fn test_population_spans_shards() {
        let facts = facts();
        for user in [0, 63, 64, 1_000, 50_000] {
            facts.toggle(Metric::Like, "post", "1", user, true).unwrap();
        }
        assert_eq!(facts.population(Metric::Like, "post", "1").unwrap(), 5);
        assert_eq!(facts.population(Metric::Fav, "post", "1").unwrap(), 0);
    }

    #[test]
    fn test_population_ignores_longer_ids() {
        let facts = facts();
        facts.toggle(Metric::Like, "post", "1", 3, true).unwrap();
        facts.toggle(Metric::Like, "post", "1:x", 3, true).unwrap();
        facts.toggle(Metric::Like, "post", "10", 3, true).unwrap();
        assert_eq!(facts.population(Metric::Like, "post", "1").unwrap(), 1);
    }
}
