//! RocksDB-backed store so facts, records and buckets survive restarts.
//!
//! Values are bincode-encoded [`Stored`] envelopes in the `keys` column
//! family. Mutations are serialized by a process-wide write lock and land as
//! a single `WriteBatch`, so a script is all-or-nothing even across a crash.

use super::script::{self, Reply, Script, ScriptHost, Staged};
use super::{expect_bytes, expect_hash, now_ms, KvStore, Stored, Value};
use crate::bitmap;
use crate::error::{CounterError, Result};
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::time::Duration;

const CF_KEYS: &str = "keys";
const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";

const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    schema_id: String,
    app_version: String,
}

pub struct RocksStore {
    db: DB,
    write_lock: Mutex<()>,
}

impl RocksStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = open_db(path)?;
        validate_or_init_manifest(&db)?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn keys_cf(&self) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(CF_KEYS)
            .ok_or_else(|| CounterError::Unavailable("missing keys column family".into()))
    }

    fn read(&self, key: &str) -> Result<Option<Stored>> {
        let cf = self.keys_cf()?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    fn read_live(&self, key: &str) -> Result<Option<Value>> {
        let now = now_ms();
        Ok(self
            .read(key)?
            .filter(|s| !s.is_expired(now))
            .map(|s| s.value))
    }

    fn atomic<R>(&self, f: impl FnOnce(&mut dyn ScriptHost) -> Result<R>) -> Result<R> {
        let _guard = self.write_lock.lock();
        let mut staged = Staged::new(|key: &str| self.read(key));
        let out = f(&mut staged)?;
        let writes = staged.into_writes();
        if writes.is_empty() {
            return Ok(out);
        }
        let cf = self.keys_cf()?;
        let mut batch = WriteBatch::default();
        for (key, write) in writes {
            match write {
                Some(stored) => batch.put_cf(cf, key.as_bytes(), bincode::serialize(&stored)?),
                None => batch.delete_cf(cf, key.as_bytes()),
            }
        }
        self.db.write(batch)?;
        Ok(out)
    }
}

impl KvStore for RocksStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.read_live(key)?
            .map(|v| expect_bytes(key, v))
            .transpose()
    }

    fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let cf = self.keys_cf()?;
        let now = now_ms();
        let raws = self
            .db
            .multi_get_cf(keys.iter().map(|key| (cf, key.as_bytes())));
        let mut out = Vec::with_capacity(keys.len());
        for raw in raws {
            let value = match raw? {
                Some(raw) => match bincode::deserialize::<Stored>(&raw) {
                    Ok(stored) if !stored.is_expired(now) => match stored.value {
                        Value::Bytes(bytes) => Some(bytes),
                        Value::Hash(_) => None,
                    },
                    _ => None,
                },
                None => None,
            };
            out.push(value);
        }
        Ok(out)
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.atomic(|host| host.store(key, Value::Bytes(value), None))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.atomic(|host| host.remove(key))
    }

    fn get_bit(&self, key: &str, offset: u64) -> Result<bool> {
        match self.read_live(key)? {
            Some(value) => Ok(bitmap::get_bit(&expect_bytes(key, value)?, offset)),
            None => Ok(false),
        }
    }

    fn bit_counts(&self, keys: &[String]) -> Result<Vec<u64>> {
        let cf = self.keys_cf()?;
        let now = now_ms();
        let raws = self
            .db
            .multi_get_cf(keys.iter().map(|key| (cf, key.as_bytes())));
        let mut counts = Vec::with_capacity(keys.len());
        for (key, raw) in keys.iter().zip(raws) {
            let count = match raw? {
                Some(raw) => {
                    let stored: Stored = bincode::deserialize(&raw)?;
                    if stored.is_expired(now) {
                        0
                    } else {
                        bitmap::count_ones(&expect_bytes(key, stored.value)?)
                    }
                }
                None => 0,
            };
            counts.push(count);
        }
        Ok(counts)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let cf = self.keys_cf()?;
        let now = now_ms();
        let mut keys = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );
        for item in iter {
            let (key, raw) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let stored: Stored = bincode::deserialize(&raw)?;
            if stored.is_expired(now) {
                continue;
            }
            if let Ok(key) = String::from_utf8(key.into_vec()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn hash_get_all(&self, key: &str) -> Result<Vec<(String, i64)>> {
        match self.read_live(key)? {
            Some(value) => Ok(expect_hash(key, value)?.into_iter().collect()),
            None => Ok(Vec::new()),
        }
    }

    fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.atomic(|host| script::hash_incr(host, key, field, delta))
    }

    fn hash_delete(&self, key: &str, fields: &[String]) -> Result<usize> {
        self.atomic(|host| script::hash_delete(host, key, fields))
    }

    fn hash_len(&self, key: &str) -> Result<usize> {
        match self.read_live(key)? {
            Some(value) => Ok(expect_hash(key, value)?.len()),
            None => Ok(0),
        }
    }

    fn set_nx_px(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.atomic(|host| script::set_nx(host, key, value, ttl))
    }

    fn purge_expired(&self) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let cf = self.keys_cf()?;
        let now = now_ms();
        let mut batch = WriteBatch::default();
        let mut purged = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, raw) = item?;
            let stored: Stored = bincode::deserialize(&raw)?;
            if stored.is_expired(now) {
                batch.delete_cf(cf, key);
                purged += 1;
            }
        }
        if purged > 0 {
            self.db.write(batch)?;
        }
        Ok(purged)
    }

    fn eval(&self, script: &Script) -> Result<Reply> {
        self.atomic(|host| script::run(host, script))
    }
}

fn open_db(path: impl AsRef<Path>) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);

    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_KEYS, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ];

    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| CounterError::Unavailable("missing metadata column family".into()))?;
    match db.get_cf(metadata_cf, KEY_MANIFEST)? {
        Some(raw) => {
            let manifest: StorageManifest = bincode::deserialize(&raw)?;
            if manifest.format_version != STORAGE_FORMAT_VERSION {
                return Err(CounterError::Config(format!(
                    "unsupported storage format version {} (expected {})",
                    manifest.format_version, STORAGE_FORMAT_VERSION
                )));
            }
            if manifest.schema_id != crate::schema::SCHEMA_ID {
                return Err(CounterError::Config(format!(
                    "store was written with schema {} but this build uses {}",
                    manifest.schema_id,
                    crate::schema::SCHEMA_ID
                )));
            }
            Ok(())
        }
        None => {
            let manifest = StorageManifest {
                format_version: STORAGE_FORMAT_VERSION,
                schema_id: crate::schema::SCHEMA_ID.to_string(),
                app_version: env!("CARGO_PKG_VERSION").to_string(),
            };
            db.put_cf(metadata_cf, KEY_MANIFEST, bincode::serialize(&manifest)?)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store
                .eval(&Script::ToggleBit {
                    key: "bm:like:post:1:0".into(),
                    offset: 7,
                    set: true,
                })
                .unwrap();
            store.hash_incr("agg:v1:post:1", "0", 3).unwrap();
            store.set("cnt:v1:post:1", vec![0, 0, 0, 1, 0, 0, 0, 0]).unwrap();
        }
        let store = RocksStore::open(dir.path()).unwrap();
        assert!(store.get_bit("bm:like:post:1:0", 7).unwrap());
        assert_eq!(
            store.hash_get_all("agg:v1:post:1").unwrap(),
            vec![("0".to_string(), 3)]
        );
        assert_eq!(
            store.mget(&["cnt:v1:post:1".into(), "cnt:v1:post:2".into()]).unwrap(),
            vec![Some(vec![0, 0, 0, 1, 0, 0, 0, 0]), None]
        );
    }

    #[test]
    fn test_scan_prefix_stops_at_boundary() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store.set("agg:v1:a", vec![]).unwrap();
        store.hash_incr("agg:v1:post:1", "0", 1).unwrap();
        store.hash_incr("agh", "0", 1).unwrap();
        assert_eq!(
            store.scan_prefix("agg:v1:").unwrap(),
            vec!["agg:v1:a".to_string(), "agg:v1:post:1".to_string()]
        );
    }

    #[test]
    fn test_purge_removes_expired_entries() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        for i in 0..100 {
            let key = format!("dedup:cnt:counter-agg:{i}");
            store.set_nx_px(&key, b"1", Duration::from_millis(1)).unwrap();
        }
        store.hash_incr("agg:v1:post:1", "0", 1).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let resident = |store: &RocksStore| {
            let cf = store.keys_cf().unwrap();
            store.db.iterator_cf(cf, IteratorMode::Start).count()
        };
        assert_eq!(resident(&store), 101);
        assert_eq!(store.purge_expired().unwrap(), 100);
        assert_eq!(resident(&store), 1);
        assert_eq!(store.purge_expired().unwrap(), 0);
    }

    #[test]
    fn test_lock_expiry_and_release() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        assert!(store.set_nx_px("lock", b"t1", Duration::from_millis(30)).unwrap());
        assert!(!store.set_nx_px("lock", b"t2", Duration::from_millis(30)).unwrap());
        std::thread::sleep(Duration::from_millis(60));
        assert!(store.set_nx_px("lock", b"t2", Duration::from_millis(1_000)).unwrap());
        let reply = store
            .eval(&Script::DeleteIfEquals {
                key: "lock".into(),
                expected: b"t1".to_vec(),
            })
            .unwrap();
        assert_eq!(reply, Reply::Deleted(false));
    }
}
