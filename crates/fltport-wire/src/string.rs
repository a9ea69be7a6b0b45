//! UTF-16LE null-terminated strings, as carried in payloads.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};

/// Encode `s` as UTF-16LE followed by a NUL code unit.
pub fn encode_utf16z(s: &str) -> Bytes {
    let mut dst = BytesMut::with_capacity((s.len() + 1) * 2);
    for unit in s.encode_utf16() {
        dst.put_u16_le(unit);
    }
    dst.put_u16_le(0);
    dst.freeze()
}

/// Decode a UTF-16LE string ending at the first NUL code unit.
///
/// A missing terminator is accepted when the bytes end on a unit boundary.
pub fn decode_utf16z(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(WireError::InvalidString("odd byte length"));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    String::from_utf16(&units).map_err(|_| WireError::InvalidString("unpaired surrogate"))
}
