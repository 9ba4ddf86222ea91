//! Client-side decoding of distributed-storage record keys.
//!
//! Servers older than the `tidb_decode_key` function expose region start keys
//! only as raw hex. A record key is `t{table_id}_r{handle}` where both
//! integers are 8-byte memcomparable (big-endian, sign bit flipped), and the
//! whole key may additionally be wrapped in the 9-byte-group "bytes"
//! encoding.

use anyhow::{anyhow, bail, Result};

fn decode_hex(text: &str) -> Result<Vec<u8>> {
    let text = text.trim();
    if text.len() % 2 != 0 {
        bail!("odd-length hex key");
    }
    let mut out = Vec::with_capacity(text.len() / 2);
    let bytes = text.as_bytes();
    for pair in bytes.chunks_exact(2) {
        let hi = (pair[0] as char)
            .to_digit(16)
            .ok_or_else(|| anyhow!("invalid hex digit {:?}", pair[0] as char))?;
        let lo = (pair[1] as char)
            .to_digit(16)
            .ok_or_else(|| anyhow!("invalid hex digit {:?}", pair[1] as char))?;
        out.push(((hi << 4) | lo) as u8);
    }
    Ok(out)
}

/// Reverses the memcomparable "bytes" encoding: 8 data bytes per group,
/// zero-padded, followed by a marker of `0xFF - pad_count`.
fn decode_bytes(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % 9 != 0 {
        bail!("not group-encoded");
    }
    let mut out = Vec::with_capacity(data.len() / 9 * 8);
    for group in data.chunks_exact(9) {
        let marker = group[8];
        let pad = 0xff - marker;
        if pad > 8 {
            bail!("invalid group marker {marker:#x}");
        }
        let real = 8 - pad as usize;
        out.extend_from_slice(&group[..real]);
        if pad > 0 {
            return Ok(out);
        }
    }
    Ok(out)
}

fn decode_comparable_i64(bytes: &[u8]) -> Result<i64> {
    let fixed: [u8; 8] = bytes
        .try_into()
        .map_err(|_| anyhow!("truncated integer in record key"))?;
    Ok((u64::from_be_bytes(fixed) ^ 0x8000_0000_0000_0000) as i64)
}

/// Decodes a hex region start key into `(table_id, row_handle)`.
///
/// Returns an error for index keys, partial keys, and non-integer handles;
/// callers treat those regions as unusable split points.
pub fn decode_record_key(hex_key: &str) -> Result<(i64, i64)> {
    let raw = decode_hex(hex_key)?;
    // Keys may or may not carry the group encoding depending on the source.
    let key = decode_bytes(&raw).unwrap_or(raw);
    if key.len() < 19 || key[0] != b't' {
        bail!("not a record key");
    }
    let table_id = decode_comparable_i64(&key[1..9])?;
    if &key[9..11] != b"_r" {
        bail!("not a row key");
    }
    let handle = decode_comparable_i64(&key[11..19])?;
    Ok((table_id, handle))
}
