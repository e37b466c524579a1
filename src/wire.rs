//! Low-level wire primitives shared by the packet codec and by
//! `DeviceInfo`/`ObjectInfo` parsing: little-endian integers and the PTP
//! string encoding (a one-byte character count, including the terminating
//! NUL, followed by that many UTF-16LE code units).

use bytes::{Buf, BufMut};

use crate::codec::FramingError;

/// Reads a PTP string: `count: u8` followed by `count` UTF-16LE code units,
/// the last of which is a NUL terminator. `count == 0` means an empty
/// string with no terminator written.
pub fn read_ptp_string(buf: &mut impl Buf) -> Result<String, FramingError> {
    if buf.remaining() < 1 {
        return Err(FramingError::ShortFrame);
    }
    let count = buf.get_u8() as usize;
    if count == 0 {
        return Ok(String::new());
    }
    if buf.remaining() < count * 2 {
        return Err(FramingError::ShortFrame);
    }
    let mut units = Vec::with_capacity(count);
    for _ in 0..count {
        units.push(buf.get_u16_le());
    }
    // drop the trailing NUL code unit, if present
    if units.last() == Some(&0) {
        units.pop();
    }
    String::from_utf16(&units).map_err(|_| FramingError::BadString)
}

/// Writes a PTP string in the encoding [`read_ptp_string`] understands.
pub fn write_ptp_string(buf: &mut impl BufMut, s: &str) {
    if s.is_empty() {
        buf.put_u8(0);
        return;
    }
    let units: Vec<u16> = s.encode_utf16().collect();
    let count = (units.len() + 1).min(255);
    buf.put_u8(count as u8);
    for &u in units.iter().take(count.saturating_sub(1)) {
        buf.put_u16_le(u);
    }
    buf.put_u16_le(0);
}

/// Reads a plain NUL-terminated UTF-16LE string with no leading length
/// byte, as used in the `InitCommandRequest`/`InitCommandAck` payloads.
/// Extraction is best-effort: a missing terminator is not an error, the
/// remaining buffer is simply consumed up to the first NUL or its end.
pub fn read_nul_terminated_utf16(buf: &mut impl Buf) -> String {
    let mut units = Vec::new();
    while buf.remaining() >= 2 {
        let u = buf.get_u16_le();
        if u == 0 {
            break;
        }
        units.push(u);
    }
    String::from_utf16_lossy(&units)
}

/// Writes a plain NUL-terminated UTF-16LE string with no leading length
/// byte.
pub fn write_nul_terminated_utf16(buf: &mut impl BufMut, s: &str) {
    for u in s.encode_utf16() {
        buf.put_u16_le(u);
    }
    buf.put_u16_le(0);
}

/// Reads a PTP array: `count: u32` followed by `count` little-endian
/// elements, each read with `read_elem`.
pub fn read_ptp_array_u32(buf: &mut impl Buf) -> Result<Vec<u32>, FramingError> {
    if buf.remaining() < 4 {
        return Err(FramingError::ShortFrame);
    }
    let count = buf.get_u32_le() as usize;
    if buf.remaining() < count * 4 {
        return Err(FramingError::ShortFrame);
    }
    Ok((0..count).map(|_| buf.get_u32_le()).collect())
}

pub fn read_ptp_array_u16(buf: &mut impl Buf) -> Result<Vec<u16>, FramingError> {
    if buf.remaining() < 4 {
        return Err(FramingError::ShortFrame);
    }
    let count = buf.get_u32_le() as usize;
    if buf.remaining() < count * 2 {
        return Err(FramingError::ShortFrame);
    }
    Ok((0..count).map(|_| buf.get_u16_le()).collect())
}

pub fn write_ptp_array_u16(buf: &mut impl BufMut, items: &[u16]) {
    buf.put_u32_le(items.len() as u32);
    for &item in items {
        buf.put_u16_le(item);
    }
}
