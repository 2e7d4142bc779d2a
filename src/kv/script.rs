//! Atomic store scripts.
//!
//! Each backend provides a [`ScriptHost`] that sees a consistent view of the
//! keyspace for the duration of one call and applies every write together.
//! The functions here hold all the multi-step logic.

use super::{expect_bytes, expect_hash, now_ms, Stored, Value};
use crate::bitmap;
use crate::error::Result;
use crate::record::{self, Fold};
use std::collections::BTreeMap;
use std::time::Duration;

/// Keyspace access inside one atomic section. Expired keys read as absent
/// and are removed when the section commits.
pub trait ScriptHost {
    fn load(&mut self, key: &str) -> Result<Option<Value>>;
    fn store(&mut self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<bool>;
}

/// Buffers writes on top of a backend reader so a script either commits all
/// of its writes or none of them. `None` in the write set means delete.
pub struct Staged<F> {
    read: F,
    pending: BTreeMap<String, Option<Stored>>,
    now_ms: u64,
}

impl<F> Staged<F>
where
    F: FnMut(&str) -> Result<Option<Stored>>,
{
    pub fn new(read: F) -> Self {
        Self {
            read,
            pending: BTreeMap::new(),
            now_ms: now_ms(),
        }
    }

    pub fn into_writes(self) -> BTreeMap<String, Option<Stored>> {
        self.pending
    }
}

impl<F> ScriptHost for Staged<F>
where
    F: FnMut(&str) -> Result<Option<Stored>>,
{
    fn load(&mut self, key: &str) -> Result<Option<Value>> {
        if let Some(staged) = self.pending.get(key) {
            return Ok(staged.as_ref().map(|s| s.value.clone()));
        }
        match (self.read)(key)? {
            Some(stored) if stored.is_expired(self.now_ms) => {
                self.pending.insert(key.to_string(), None);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.value)),
            None => Ok(None),
        }
    }

    fn store(&mut self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.pending
            .insert(key.to_string(), Some(Stored::new(value, ttl)));
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        let existed = self.load(key)?.is_some();
        self.pending.insert(key.to_string(), None);
        Ok(existed)
    }
}

/// Idempotency guard: the script runs only if `key` is not yet present, and
/// `key` is written with `ttl` in the same atomic section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dedup {
    pub key: String,
    pub ttl: Duration,
}

/// Server-side atomic operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Set or clear one bit. Writes only when the bit actually changes.
    ToggleBit { key: String, offset: u64, set: bool },
    /// Add `delta` into one segment of a counter record.
    FoldRecord {
        key: String,
        record_len: usize,
        index: usize,
        delta: i64,
        dedup: Option<Dedup>,
    },
    /// Increment one hash field.
    IncrField {
        key: String,
        field: String,
        delta: i64,
        dedup: Option<Dedup>,
    },
    /// Remove a bucket field and fold whatever it held into the record.
    DrainField {
        bucket: String,
        field: String,
        record: String,
        record_len: usize,
        index: usize,
    },
    /// Delete `key` only if it currently holds `expected`.
    DeleteIfEquals { key: String, expected: Vec<u8> },
    /// Overwrite a record with recounted bytes and drop the bucket fields
    /// those counts already include.
    RebuildRecord {
        record: String,
        bytes: Vec<u8>,
        bucket: String,
        fields: Vec<String>,
    },
}

/// Result of a [`Script`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Changed(bool),
    Folded(u64),
    Incremented(i64),
    /// The field held `delta`; `value` is the segment after folding, or
    /// `None` when nothing was folded (zero delta or malformed record).
    Drained { delta: i64, value: Option<u64> },
    /// The field or key the script targets does not exist.
    Missing,
    /// The target record has the wrong length and was left untouched.
    Malformed,
    /// The dedup key was already present; nothing was applied.
    Duplicate,
    Deleted(bool),
    /// Record written; `cleared` bucket fields were dropped.
    Rebuilt { cleared: usize },
}

pub fn run(host: &mut dyn ScriptHost, script: &Script) -> Result<Reply> {
    match script {
        Script::ToggleBit { key, offset, set } => toggle_bit(host, key, *offset, *set),
        Script::FoldRecord {
            key,
            record_len,
            index,
            delta,
            dedup,
        } => {
            if !claim(host, dedup.as_ref())? {
                return Ok(Reply::Duplicate);
            }
            fold_record(host, key, *record_len, *index, *delta)
        }
        Script::IncrField {
            key,
            field,
            delta,
            dedup,
        } => {
            if !claim(host, dedup.as_ref())? {
                return Ok(Reply::Duplicate);
            }
            hash_incr(host, key, field, *delta).map(Reply::Incremented)
        }
        Script::DrainField {
            bucket,
            field,
            record,
            record_len,
            index,
        } => drain_field(host, bucket, field, record, *record_len, *index),
        Script::DeleteIfEquals { key, expected } => {
            let current = match host.load(key)? {
                Some(Value::Bytes(bytes)) => bytes,
                _ => return Ok(Reply::Deleted(false)),
            };
            if current != *expected {
                return Ok(Reply::Deleted(false));
            }
            host.remove(key).map(Reply::Deleted)
        }
        Script::RebuildRecord {
            record,
            bytes,
            bucket,
            fields,
        } => {
            host.store(record, Value::Bytes(bytes.clone()), None)?;
            let cleared = hash_delete(host, bucket, fields)?;
            Ok(Reply::Rebuilt { cleared })
        }
    }
}

fn claim(host: &mut dyn ScriptHost, dedup: Option<&Dedup>) -> Result<bool> {
    match dedup {
        None => Ok(true),
        Some(dedup) => set_nx(host, &dedup.key, b"1", dedup.ttl),
    }
}

fn toggle_bit(host: &mut dyn ScriptHost, key: &str, offset: u64, set: bool) -> Result<Reply> {
    let mut blob = match host.load(key)? {
        Some(value) => expect_bytes(key, value)?,
        None => Vec::new(),
    };
    if bitmap::get_bit(&blob, offset) == set {
        return Ok(Reply::Changed(false));
    }
    bitmap::set_bit(&mut blob, offset, set);
    host.store(key, Value::Bytes(blob), None)?;
    Ok(Reply::Changed(true))
}

fn fold_record(
    host: &mut dyn ScriptHost,
    key: &str,
    record_len: usize,
    index: usize,
    delta: i64,
) -> Result<Reply> {
    let current = match host.load(key)? {
        Some(value) => Some(expect_bytes(key, value)?),
        None => None,
    };
    match record::fold(current.as_deref(), record_len, index, delta) {
        Fold::Applied { blob, value } => {
            host.store(key, Value::Bytes(blob), None)?;
            Ok(Reply::Folded(value))
        }
        Fold::Malformed => Ok(Reply::Malformed),
    }
}

fn drain_field(
    host: &mut dyn ScriptHost,
    bucket: &str,
    field: &str,
    record: &str,
    record_len: usize,
    index: usize,
) -> Result<Reply> {
    let mut hash = match host.load(bucket)? {
        Some(value) => expect_hash(bucket, value)?,
        None => return Ok(Reply::Missing),
    };
    let Some(delta) = hash.remove(field) else {
        return Ok(Reply::Missing);
    };
    let value = if delta == 0 {
        None
    } else {
        match fold_record(host, record, record_len, index, delta)? {
            Reply::Folded(value) => Some(value),
            _ => None,
        }
    };
    if hash.is_empty() {
        host.remove(bucket)?;
    } else {
        host.store(bucket, Value::Hash(hash), None)?;
    }
    Ok(Reply::Drained { delta, value })
}

pub fn hash_incr(host: &mut dyn ScriptHost, key: &str, field: &str, delta: i64) -> Result<i64> {
    let mut hash = match host.load(key)? {
        Some(value) => expect_hash(key, value)?,
        None => Default::default(),
    };
    let slot = hash.entry(field.to_string()).or_insert(0);
    *slot = slot.saturating_add(delta);
    let next = *slot;
    host.store(key, Value::Hash(hash), None)?;
    Ok(next)
}

pub fn hash_delete(host: &mut dyn ScriptHost, key: &str, fields: &[String]) -> Result<usize> {
    let mut hash = match host.load(key)? {
        Some(value) => expect_hash(key, value)?,
        None => return Ok(0),
    };
    let removed = fields.iter().filter(|f| hash.remove(*f).is_some()).count();
    if removed == 0 {
        return Ok(0);
    }
    if hash.is_empty() {
        host.remove(key)?;
    } else {
        host.store(key, Value::Hash(hash), None)?;
    }
    Ok(removed)
}

pub fn set_nx(host: &mut dyn ScriptHost, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
    if host.load(key)?.is_some() {
        return Ok(false);
    }
    host.store(key, Value::Bytes(value.to_vec()), Some(ttl))?;
    Ok(true)
}
