//! Byte-blob bit operations with Redis `SETBIT` addressing: bit 0 is the
//! most significant bit of byte 0, and blobs grow zero-filled on write.

#[inline]
fn locate(offset: u64) -> (usize, u8) {
    ((offset / 8) as usize, 0x80u8 >> (offset % 8))
}

/// Read one bit. Offsets past the end of the blob read as 0.
pub fn get_bit(blob: &[u8], offset: u64) -> bool {
    let (byte, mask) = locate(offset);
    blob.get(byte).is_some_and(|b| b & mask != 0)
}

/// Write one bit, growing the blob as needed. Returns the previous value.
pub fn set_bit(blob: &mut Vec<u8>, offset: u64, value: bool) -> bool {
    let (byte, mask) = locate(offset);
    if byte >= blob.len() {
        if !value {
            return false;
        }
        blob.resize(byte + 1, 0);
    }
    let prev = blob[byte] & mask != 0;
    if value {
        blob[byte] |= mask;
    } else {
        blob[byte] &= !mask;
    }
    prev
}

/// Population count over the whole blob.
pub fn count_ones(blob: &[u8]) -> u64 {
    blob.iter().map(|b| u64::from(b.count_ones())).sum()
}
