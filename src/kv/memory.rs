//! In-process store.
//!
//! One `RwLock` over the whole keyspace: reads share it, every mutation and
//! every script takes it exclusively, which gives the same one-at-a-time
//! execution a single-threaded store server gives its scripts.

use super::script::{self, Reply, Script, ScriptHost, Staged};
use super::{expect_bytes, expect_hash, now_ms, KvStore, Stored, Value};
use crate::bitmap;
use crate::error::Result;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<HashMap<String, Stored>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = now_ms();
        self.map
            .read()
            .values()
            .filter(|s| !s.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_value(&self, key: &str) -> Option<Value> {
        let now = now_ms();
        self.map
            .read()
            .get(key)
            .filter(|s| !s.is_expired(now))
            .map(|s| s.value.clone())
    }

    /// Run `f` against a staged view and apply its writes under one lock.
    fn atomic<R>(&self, f: impl FnOnce(&mut dyn ScriptHost) -> Result<R>) -> Result<R> {
        let mut map = self.map.write();
        let (out, writes) = {
            let snapshot = &*map;
            let mut staged = Staged::new(|key: &str| -> Result<Option<Stored>> {
                Ok(snapshot.get(key).cloned())
            });
            let out = f(&mut staged)?;
            (out, staged.into_writes())
        };
        apply(&mut map, writes);
        Ok(out)
    }
}

fn apply(map: &mut HashMap<String, Stored>, writes: BTreeMap<String, Option<Stored>>) {
    for (key, write) in writes {
        match write {
            Some(stored) => {
                map.insert(key, stored);
            }
            None => {
                map.remove(&key);
            }
        }
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.read_value(key)
            .map(|v| expect_bytes(key, v))
            .transpose()
    }

    fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let now = now_ms();
        let map = self.map.read();
        Ok(keys
            .iter()
            .map(|key| match map.get(key) {
                Some(stored) if !stored.is_expired(now) => match &stored.value {
                    Value::Bytes(bytes) => Some(bytes.clone()),
                    Value::Hash(_) => None,
                },
                _ => None,
            })
            .collect())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.map
            .write()
            .insert(key.to_string(), Stored::new(Value::Bytes(value), None));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let now = now_ms();
        Ok(self
            .map
            .write()
            .remove(key)
            .is_some_and(|s| !s.is_expired(now)))
    }

    fn get_bit(&self, key: &str, offset: u64) -> Result<bool> {
        match self.read_value(key) {
            Some(value) => Ok(bitmap::get_bit(&expect_bytes(key, value)?, offset)),
            None => Ok(false),
        }
    }

    fn bit_counts(&self, keys: &[String]) -> Result<Vec<u64>> {
        keys.iter()
            .map(|key| match self.read_value(key) {
                Some(value) => Ok(bitmap::count_ones(&expect_bytes(key, value)?)),
                None => Ok(0),
            })
            .collect()
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = now_ms();
        let mut keys: Vec<String> = self
            .map
            .read()
            .iter()
            .filter(|(k, s)| k.starts_with(prefix) && !s.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn hash_get_all(&self, key: &str) -> Result<Vec<(String, i64)>> {
        match self.read_value(key) {
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
        match self.read_value(key) {
            Some(value) => Ok(expect_hash(key, value)?.len()),
            None => Ok(0),
        }
    }

    fn set_nx_px(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.atomic(|host| script::set_nx(host, key, value, ttl))
    }

    fn eval(&self, script: &Script) -> Result<Reply> {
        self.atomic(|host| script::run(host, script))
    }

    fn purge_expired(&self) -> Result<usize> {
        let now = now_ms();
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|_, stored| !stored.is_expired(now));
        Ok(before - map.len())
    }
}
