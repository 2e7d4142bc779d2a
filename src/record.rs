//! # Counter Record
//!
//! Fixed-width binary blob holding one unsigned 32-bit big-endian counter
//! per schema metric. The segment for a metric lives at
//! `metric.index() * FIELD_SIZE`.
//!
//! A blob is trusted only when its length is exactly [`RECORD_LEN`]; anything
//! else (missing, truncated, padded) is treated as invalid and sent through
//! rebuild instead of being decoded.

use crate::schema::{Metric, FIELD_SIZE, RECORD_LEN};

/// Largest value a segment can hold.
pub const MAX_VALUE: u64 = u32::MAX as u64;

/// Whether a raw blob has the layout of the current schema.
#[inline]
pub fn is_valid(raw: Option<&[u8]>) -> bool {
    raw.is_some_and(|buf| buf.len() == RECORD_LEN)
}

/// Write `value` at segment `index`, clamped to `[0, MAX_VALUE]`.
pub fn encode(buf: &mut [u8], index: usize, value: i64) {
    let clamped = value.clamp(0, MAX_VALUE as i64) as u32;
    let off = index * FIELD_SIZE;
    buf[off..off + FIELD_SIZE].copy_from_slice(&clamped.to_be_bytes());
}

/// Read segment `index` as an unsigned value.
pub fn decode(buf: &[u8], index: usize) -> u64 {
    let off = index * FIELD_SIZE;
    let mut seg = [0u8; FIELD_SIZE];
    seg.copy_from_slice(&buf[off..off + FIELD_SIZE]);
    u64::from(u32::from_be_bytes(seg))
}

/// Outcome of folding a delta into a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fold {
    /// New blob to store, and the segment value after the fold.
    Applied { blob: Vec<u8>, value: u64 },
    /// The stored blob has the wrong length; it is left for rebuild.
    Malformed,
}

/// Add `delta` into segment `index` of `current`, saturating at both ends.
/// A missing blob starts zero-filled with `record_len` bytes.
pub fn fold(current: Option<&[u8]>, record_len: usize, index: usize, delta: i64) -> Fold {
    let mut blob = match current {
        None => vec![0u8; record_len],
        Some(buf) if buf.len() == record_len => buf.to_vec(),
        Some(_) => return Fold::Malformed,
    };
    if (index + 1) * FIELD_SIZE > record_len {
        return Fold::Malformed;
    }
    let next = (decode(&blob, index) as i64).saturating_add(delta);
    encode(&mut blob, index, next);
    let value = decode(&blob, index);
    Fold::Applied { blob, value }
}

/// Typed view over a valid counter record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterRecord {
    bytes: Vec<u8>,
}

impl CounterRecord {
    /// All counters at zero.
    pub fn zeroed() -> Self {
        Self {
            bytes: vec![0u8; RECORD_LEN],
        }
    }

    /// Wrap a raw blob, rejecting anything that is not a valid record.
    pub fn from_bytes(raw: Vec<u8>) -> Option<Self> {
        is_valid(Some(&raw)).then_some(Self { bytes: raw })
    }

    pub fn get(&self, metric: Metric) -> u64 {
        decode(&self.bytes, metric.index())
    }

    pub fn set(&mut self, metric: Metric, value: u64) {
        encode(
            &mut self.bytes,
            metric.index(),
            value.min(MAX_VALUE) as i64,
        );
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl Default for CounterRecord {
    fn default() -> Self {
        Self::zeroed()
    }
}
