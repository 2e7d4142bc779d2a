//! Partitioned, ordered event log with per-group offsets.
//!
//! Entries are routed to a partition by key, so every event for one entity
//! lands in the same partition and is fetched in append order. Consumers
//! commit the offset *after* the event's effect is durable; anything past the
//! committed offset is redelivered.

use crate::error::{CounterError, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, DB};
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// One fetched log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub partition: u32,
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// Ordered, partitioned, at-least-once event channel.
pub trait EventLog: Send + Sync {
    fn partitions(&self) -> u32;

    /// Append under `key`'s partition. Returns `(partition, offset)`.
    fn append(&self, key: &str, payload: Vec<u8>) -> Result<(u32, u64)>;

    /// Up to `max` entries starting at the group's committed offset.
    fn fetch(&self, group: &str, partition: u32, max: usize) -> Result<Vec<LogEntry>>;

    /// Record that everything before `next_offset` has been applied.
    fn commit(&self, group: &str, partition: u32, next_offset: u64) -> Result<()>;

    fn committed(&self, group: &str, partition: u32) -> Result<u64>;

    /// Offset the next append to `partition` will receive.
    fn end_offset(&self, partition: u32) -> Result<u64>;

    /// Move the group back to the earliest retained entry of every partition.
    fn seek_to_earliest(&self, group: &str) -> Result<()>;

    /// Entries between the group's committed offsets and the log end.
    fn lag(&self, group: &str) -> Result<u64> {
        let mut lag = 0;
        for partition in 0..self.partitions() {
            lag += self
                .end_offset(partition)?
                .saturating_sub(self.committed(group, partition)?);
        }
        Ok(lag)
    }
}

/// Stable partition assignment for a routing key.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(partitions.max(1))) as u32
}

fn check_partition(partition: u32, partitions: u32) -> Result<()> {
    if partition >= partitions {
        return Err(CounterError::Config(format!(
            "partition {partition} out of range (log has {partitions})"
        )));
    }
    Ok(())
}

/// In-process log, used in tests and single-process deployments.
pub struct MemoryEventLog {
    partitions: Vec<RwLock<Vec<Vec<u8>>>>,
    offsets: DashMap<(String, u32), u64>,
}

impl MemoryEventLog {
    pub fn new(partitions: u32) -> Self {
        let partitions = partitions.max(1);
        Self {
            partitions: (0..partitions).map(|_| RwLock::new(Vec::new())).collect(),
            offsets: DashMap::new(),
        }
    }
}

impl EventLog for MemoryEventLog {
    fn partitions(&self) -> u32 {
        self.partitions.len() as u32
    }

    fn append(&self, key: &str, payload: Vec<u8>) -> Result<(u32, u64)> {
        let partition = partition_for(key, self.partitions());
        let mut entries = self.partitions[partition as usize].write();
        entries.push(payload);
        Ok((partition, entries.len() as u64 - 1))
    }

    fn fetch(&self, group: &str, partition: u32, max: usize) -> Result<Vec<LogEntry>> {
        check_partition(partition, self.partitions())?;
        let start = self.committed(group, partition)?;
        let entries = self.partitions[partition as usize].read();
        Ok(entries
            .iter()
            .enumerate()
            .skip(start as usize)
            .take(max)
            .map(|(offset, payload)| LogEntry {
                partition,
                offset: offset as u64,
                payload: payload.clone(),
            })
            .collect())
    }

    fn commit(&self, group: &str, partition: u32, next_offset: u64) -> Result<()> {
        check_partition(partition, self.partitions())?;
        self.offsets
            .insert((group.to_string(), partition), next_offset);
        Ok(())
    }

    fn committed(&self, group: &str, partition: u32) -> Result<u64> {
        Ok(self
            .offsets
            .get(&(group.to_string(), partition))
            .map(|o| *o)
            .unwrap_or(0))
    }

    fn end_offset(&self, partition: u32) -> Result<u64> {
        check_partition(partition, self.partitions())?;
        Ok(self.partitions[partition as usize].read().len() as u64)
    }

    fn seek_to_earliest(&self, group: &str) -> Result<()> {
        self.offsets.retain(|(g, _), _| g != group);
        Ok(())
    }
}

const CF_EVENTS: &str = "events";
const CF_OFFSETS: &str = "offsets";
const CF_METADATA: &str = "metadata";
const KEY_PARTITIONS: &[u8] = b"partitions";

/// Durable log in RocksDB. Entry keys are `partition (BE u32) ++ offset
/// (BE u64)` so a forward scan from a committed offset yields append order.
pub struct RocksEventLog {
    db: DB,
    heads: Vec<Mutex<u64>>,
}

fn entry_key(partition: u32, offset: u64) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(&partition.to_be_bytes());
    key[4..].copy_from_slice(&offset.to_be_bytes());
    key
}

fn decode_entry_key(key: &[u8]) -> Option<(u32, u64)> {
    if key.len() != 12 {
        return None;
    }
    let partition = u32::from_be_bytes(key[..4].try_into().ok()?);
    let offset = u64::from_be_bytes(key[4..].try_into().ok()?);
    Some((partition, offset))
}

fn offset_key(group: &str, partition: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(group.len() + 5);
    key.extend_from_slice(group.as_bytes());
    key.push(0);
    key.extend_from_slice(&partition.to_be_bytes());
    key
}

impl RocksEventLog {
    pub fn open(path: impl AsRef<Path>, partitions: u32) -> Result<Self> {
        let partitions = partitions.max(1);
        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);
        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_EVENTS, Options::default()),
            ColumnFamilyDescriptor::new(CF_OFFSETS, Options::default()),
            ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&options, path, cfs)?;

        let metadata = db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| CounterError::Unavailable("missing metadata column family".into()))?;
        match db.get_cf(metadata, KEY_PARTITIONS)? {
            Some(raw) => {
                let stored: u32 = bincode::deserialize(&raw)?;
                if stored != partitions {
                    return Err(CounterError::Config(format!(
                        "event log was created with {stored} partitions, not {partitions}"
                    )));
                }
            }
            None => db.put_cf(metadata, KEY_PARTITIONS, bincode::serialize(&partitions)?)?,
        }

        let mut heads = Vec::with_capacity(partitions as usize);
        {
            let events = db
                .cf_handle(CF_EVENTS)
                .ok_or_else(|| CounterError::Unavailable("missing events column family".into()))?;
            for partition in 0..partitions {
                let seek = entry_key(partition, u64::MAX);
                let mut iter =
                    db.iterator_cf(events, IteratorMode::From(&seek, Direction::Reverse));
                let head = match iter.next() {
                    Some(item) => {
                        let (key, _) = item?;
                        match decode_entry_key(&key) {
                            Some((p, offset)) if p == partition => offset + 1,
                            _ => 0,
                        }
                    }
                    None => 0,
                };
                heads.push(Mutex::new(head));
            }
        }

        Ok(Self { db, heads })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| CounterError::Unavailable(format!("missing {name} column family")))
    }
}

impl EventLog for RocksEventLog {
    fn partitions(&self) -> u32 {
        self.heads.len() as u32
    }

    fn append(&self, key: &str, payload: Vec<u8>) -> Result<(u32, u64)> {
        let partition = partition_for(key, self.partitions());
        let mut head = self.heads[partition as usize].lock();
        let offset = *head;
        self.db
            .put_cf(self.cf(CF_EVENTS)?, entry_key(partition, offset), payload)?;
        *head += 1;
        Ok((partition, offset))
    }

    fn fetch(&self, group: &str, partition: u32, max: usize) -> Result<Vec<LogEntry>> {
        check_partition(partition, self.partitions())?;
        let start = self.committed(group, partition)?;
        let seek = entry_key(partition, start);
        let iter = self
            .db
            .iterator_cf(self.cf(CF_EVENTS)?, IteratorMode::From(&seek, Direction::Forward));
        let mut out = Vec::new();
        for item in iter {
            if out.len() >= max {
                break;
            }
            let (key, payload) = item?;
            match decode_entry_key(&key) {
                Some((p, offset)) if p == partition => out.push(LogEntry {
                    partition,
                    offset,
                    payload: payload.into_vec(),
                }),
                _ => break,
            }
        }
        Ok(out)
    }

    fn commit(&self, group: &str, partition: u32, next_offset: u64) -> Result<()> {
        check_partition(partition, self.partitions())?;
        self.db.put_cf(
            self.cf(CF_OFFSETS)?,
            offset_key(group, partition),
            next_offset.to_be_bytes(),
        )?;
        Ok(())
    }

    fn committed(&self, group: &str, partition: u32) -> Result<u64> {
        match self
            .db
            .get_cf(self.cf(CF_OFFSETS)?, offset_key(group, partition))?
        {
            Some(raw) if raw.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&raw);
                Ok(u64::from_be_bytes(buf))
            }
            _ => Ok(0),
        }
    }

    fn end_offset(&self, partition: u32) -> Result<u64> {
        check_partition(partition, self.partitions())?;
        Ok(*self.heads[partition as usize].lock())
    }

    fn seek_to_earliest(&self, group: &str) -> Result<()> {
        let cf = self.cf(CF_OFFSETS)?;
        for partition in 0..self.partitions() {
            self.db.delete_cf(cf, offset_key(group, partition))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(log: &dyn EventLog) {
        let (p, first) = log.append("42", b"a".to_vec()).unwrap();
        let (p2, second) = log.append("42", b"b".to_vec()).unwrap();
        assert_eq!(p, p2);
        assert_eq!(second, first + 1);

        let fetched = log.fetch("g", p, 10).unwrap();
        assert_eq!(
            fetched.iter().map(|e| e.payload.clone()).collect::<Vec<_>>(),
            vec![b"a".to_vec(), b"b".to_vec()]
        );

        log.commit("g", p, first + 1).unwrap();
        let fetched = log.fetch("g", p, 10).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].offset, second);
        assert_eq!(log.lag("g").unwrap(), 1);
        assert_eq!(log.lag("other").unwrap(), 2);

        log.seek_to_earliest("g").unwrap();
        assert_eq!(log.fetch("g", p, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_memory_log_semantics() {
        exercise(&MemoryEventLog::new(4));
    }

    #[test]
    fn test_rocks_log_semantics() {
        let dir = tempdir().unwrap();
        exercise(&RocksEventLog::open(dir.path(), 4).unwrap());
    }

    #[test]
    fn test_rocks_log_resumes_after_reopen() {
        let dir = tempdir().unwrap();
        let partition = {
            let log = RocksEventLog::open(dir.path(), 2).unwrap();
            let (p, _) = log.append("7", b"x".to_vec()).unwrap();
            log.append("7", b"y".to_vec()).unwrap();
            log.commit("g", p, 1).unwrap();
            p
        };
        let log = RocksEventLog::open(dir.path(), 2).unwrap();
        assert_eq!(log.end_offset(partition).unwrap(), 2);
        assert_eq!(log.committed("g", partition).unwrap(), 1);
        assert_eq!(log.append("7", b"z".to_vec()).unwrap(), (partition, 2));
    }

    #[test]
    fn test_partition_count_is_fixed() {
        let dir = tempdir().unwrap();
        drop(RocksEventLog::open(dir.path(), 2).unwrap());
        assert!(RocksEventLog::open(dir.path(), 3).is_err());
    }

    #[test]
    fn test_partition_for_is_stable() {
        assert_eq!(partition_for("42", 8), partition_for("42", 8));
        assert!(partition_for("anything", 3) < 3);
        assert_eq!(partition_for("x", 0), 0);
    }
}
