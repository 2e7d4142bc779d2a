//! User → (shard, bit) mapping for bitmap facts.
//!
//! Each shard is a bounded bitmap so that no single key grows with the user
//! id space and writes for distant users land on different keys.

/// Default shard capacity in bits (4 KiB per fully populated shard).
pub const SHARD_BITS: u64 = 32_768;

/// Position of one user's fact inside the sharded bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardSlot {
    pub shard: u64,
    pub bit: u64,
}

/// Pure mapping from user id to [`ShardSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardMapper {
    bits_per_shard: u64,
}

impl ShardMapper {
    pub const fn new(bits_per_shard: u64) -> Self {
        assert!(bits_per_shard > 0, "shard capacity must be non-zero");
        Self { bits_per_shard }
    }

    pub const fn bits_per_shard(&self) -> u64 {
        self.bits_per_shard
    }

    #[inline]
    pub const fn chunk_of(&self, user_id: u64) -> u64 {
        user_id / self.bits_per_shard
    }

    #[inline]
    pub const fn bit_of(&self, user_id: u64) -> u64 {
        user_id % self.bits_per_shard
    }

    #[inline]
    pub const fn locate(&self, user_id: u64) -> ShardSlot {
        ShardSlot {
            shard: self.chunk_of(user_id),
            bit: self.bit_of(user_id),
        }
    }
}

impl Default for ShardMapper {
    fn default() -> Self {
        Self::new(SHARD_BITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_is_stable() {
        let mapper = ShardMapper::default();
        assert_eq!(mapper.locate(7), ShardSlot { shard: 0, bit: 7 });
        assert_eq!(
            mapper.locate(SHARD_BITS + 3),
            ShardSlot { shard: 1, bit: 3 }
        );
        assert_eq!(mapper.locate(123_456_789), mapper.locate(123_456_789));
    }

    #[test]
    fn test_slots_are_unique_within_range() {
        let mapper = ShardMapper::new(8);
        let mut seen = std::collections::HashSet::new();
        for user in 0..64 {
            let slot = mapper.locate(user);
            assert!(slot.bit < 8);
            assert!(seen.insert(slot));
        }
    }
}
