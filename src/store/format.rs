//! On-disk layout of the index and data files.
//!
//! ```text
//! index: [count: u32][record] * count
//! record: [key_len: u32][key: 512 bytes, zero padded][data_offset: u64]
//! data:  ([value_len: u32][value bytes]) *
//! ```
//!
//! All integers are big-endian.

use crate::error::{CacheError, Result};

/// Largest encoded key the index can hold
pub const MAX_KEY_BYTES: usize = 512;

/// Largest encoded value the data file accepts
pub const MAX_VALUE_BYTES: usize = 512;

/// Size of the record-count header at the start of the index file
pub const HEADER_SIZE: u64 = 4;

/// Width of the `u32` length prefixes used by both files
pub const LENGTH_PREFIX: usize = 4;

/// Fixed width of one index record
pub const RECORD_SIZE: usize = LENGTH_PREFIX + MAX_KEY_BYTES + 8;

/// Byte position of the record at `index` inside the index file.
pub fn record_position(index: u32) -> u64 {
    HEADER_SIZE + u64::from(index) * RECORD_SIZE as u64
}

/// Whether a key/value pair fits the fixed format limits.
pub fn fits(key: &str, value: &str) -> bool {
    key.len() <= MAX_KEY_BYTES && value.len() <= MAX_VALUE_BYTES
}

pub fn encode_count(count: u32) -> [u8; HEADER_SIZE as usize] {
    count.to_be_bytes()
}

pub fn decode_count(buf: [u8; HEADER_SIZE as usize]) -> u32 {
    u32::from_be_bytes(buf)
}

// == Index Record ==
/// A decoded view over one fixed-width index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRef<'a> {
    pub key: &'a [u8],
    pub data_offset: u64,
}

impl<'a> RecordRef<'a> {
    /// Decodes one record, rejecting key lengths the format cannot hold.
    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < RECORD_SIZE {
            return Err(CacheError::Corrupted(format!(
                "index record is {} bytes, expected {}",
                buf.len(),
                RECORD_SIZE
            )));
        }

        let key_len = u32::from_be_bytes(prefix(buf)) as usize;
        if key_len > MAX_KEY_BYTES {
            return Err(CacheError::Corrupted(format!(
                "index record key length {} exceeds {}",
                key_len, MAX_KEY_BYTES
            )));
        }

        let key_start = LENGTH_PREFIX;
        let offset_start = key_start + MAX_KEY_BYTES;
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&buf[offset_start..offset_start + 8]);

        Ok(Self {
            key: &buf[key_start..key_start + key_len],
            data_offset: u64::from_be_bytes(offset),
        })
    }

    /// Encodes `key`/`data_offset` into exactly `RECORD_SIZE` bytes of `out`.
    ///
    /// Callers validate the key length beforehand.
    pub fn encode(key: &[u8], data_offset: u64, out: &mut [u8]) {
        debug_assert!(key.len() <= MAX_KEY_BYTES);
        let out = &mut out[..RECORD_SIZE];
        out.fill(0);
        out[..LENGTH_PREFIX].copy_from_slice(&(key.len() as u32).to_be_bytes());
        out[LENGTH_PREFIX..LENGTH_PREFIX + key.len()].copy_from_slice(key);
        out[LENGTH_PREFIX + MAX_KEY_BYTES..].copy_from_slice(&data_offset.to_be_bytes());
    }

    /// Decodes the key as UTF-8.
    pub fn key_str(&self) -> Result<&'a str> {
        std::str::from_utf8(self.key)
            .map_err(|e| CacheError::Corrupted(format!("index key is not UTF-8: {}", e)))
    }
}

// == Data Record ==
/// Encodes a length-prefixed value for appending to the data file.
pub fn encode_value(value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LENGTH_PREFIX + value.len());
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Decodes the `u32` value length at the start of a data record.
pub fn decode_value_len(buf: [u8; LENGTH_PREFIX]) -> Result<usize> {
    let len = u32::from_be_bytes(buf) as usize;
    if len > MAX_VALUE_BYTES {
        return Err(CacheError::Corrupted(format!(
            "data record length {} exceeds {}",
            len, MAX_VALUE_BYTES
        )));
    }
    Ok(len)
}

fn prefix(buf: &[u8]) -> [u8; LENGTH_PREFIX] {
    let mut out = [0u8; LENGTH_PREFIX];
    out.copy_from_slice(&buf[..LENGTH_PREFIX]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_size() {
        assert_eq!(RECORD_SIZE, 524);
        assert_eq!(record_position(0), 4);
        assert_eq!(record_position(2), 4 + 2 * 524);
    }

    #[test]
    fn test_record_layout_is_big_endian_and_padded() {
        let mut buf = [0xAAu8; RECORD_SIZE];
        RecordRef::encode(b"hi", 0x0102, &mut buf);

        assert_eq!(&buf[..4], &[0, 0, 0, 2]);
        assert_eq!(&buf[4..6], b"hi");
        assert!(buf[6..4 + MAX_KEY_BYTES].iter().all(|b| *b == 0));
        assert_eq!(&buf[RECORD_SIZE - 8..], &[0, 0, 0, 0, 0, 0, 1, 2]);

        let record = RecordRef::decode(&buf).unwrap();
        assert_eq!(record.key, b"hi");
        assert_eq!(record.data_offset, 0x0102);
    }

    #[test]
    fn test_decode_rejects_oversized_key_length() {
        let mut buf = [0u8; RECORD_SIZE];
        buf[..4].copy_from_slice(&(MAX_KEY_BYTES as u32 + 1).to_be_bytes());
        assert!(matches!(RecordRef::decode(&buf), Err(CacheError::Corrupted(_))));
    }

    #[test]
    fn test_value_encoding() {
        let encoded = encode_value("héllo".as_bytes());
        assert_eq!(&encoded[..4], &[0, 0, 0, 6]);
        assert_eq!(decode_value_len([0, 0, 0, 6]).unwrap(), 6);
        assert!(decode_value_len([0, 0, 2, 1]).is_err());
    }

    #[test]
    fn test_fits_counts_encoded_bytes() {
        let wide = "é".repeat(MAX_KEY_BYTES / 2);
        assert!(fits(&wide, "v"));
        let too_wide = "é".repeat(MAX_KEY_BYTES / 2 + 1);
        assert!(!fits(&too_wide, "v"));
        assert!(!fits("k", &"x".repeat(MAX_VALUE_BYTES + 1)));
    }
}
