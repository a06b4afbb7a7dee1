//! Unsigned LEB128 varints for the wire format

use bytes::BufMut;

use crate::error::{Error, Result};

/// Maximum encoded size of a u64 varint
pub const MAX_LEN: usize = 10;

/// Append the varint encoding of `value` to `dst`.
pub fn encode(mut value: u64, dst: &mut impl BufMut) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if value == 0 {
            return;
        }
    }
}

/// Number of bytes `value` occupies when encoded.
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    core::cmp::max(1, bits.div_ceil(7))
}

/// Decode a varint from the start of `src`.
///
/// Returns `Ok(None)` when `src` ends before the varint is complete, so
/// streaming decoders can wait for more bytes.
pub fn decode(src: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (i, byte) in src.iter().enumerate() {
        if i >= MAX_LEN {
            return Err(Error::MalformedData("varint exceeds 10 bytes".to_string()));
        }
        let payload = u64::from(byte & 0x7f);
        value = payload
            .checked_shl((i * 7) as u32)
            .and_then(|shifted| value.checked_add(shifted))
            .ok_or_else(|| Error::MalformedData("varint overflows u64".to_string()))?;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}
