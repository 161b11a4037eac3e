//! Field encoding for frame bodies.
//!
//! Writers append to a `BytesMut`; readers consume from the front of a
//! `Bytes` and fail with [`WireError::Incomplete`] instead of panicking when
//! the body is shorter than the field being read.

use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Longest accepted string length prefix, in bytes (enough for a `u32`)
const MAX_VAR_LEN_BYTES: usize = 5;

/// Fail unless `buf` holds at least `needed` more bytes
pub fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::Incomplete {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

/// Write a boolean as a single byte
pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Write a length-prefixed UTF-8 string
pub fn put_string(buf: &mut BytesMut, value: &str) {
    put_var_len(buf, value.len());
    buf.put_slice(value.as_bytes());
}

/// Write a 7-bit encoded length
pub fn put_var_len(buf: &mut BytesMut, mut len: usize) {
    while len >= 0x80 {
        buf.put_u8((len as u8 & 0x7F) | 0x80);
        len >>= 7;
    }
    buf.put_u8(len as u8);
}

/// Read one byte
pub fn get_u8(buf: &mut Bytes) -> Result<u8, WireError> {
    ensure_remaining(buf, 1)?;
    Ok(buf.get_u8())
}

/// Read a boolean; any nonzero byte is `true`
pub fn get_bool(buf: &mut Bytes) -> Result<bool, WireError> {
    Ok(get_u8(buf)? != 0)
}

/// Read a 7-bit encoded length
pub fn get_var_len(buf: &mut Bytes) -> Result<usize, WireError> {
    let mut len = 0usize;
    for i in 0..MAX_VAR_LEN_BYTES {
        let byte = get_u8(buf)?;
        len |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(len);
        }
    }
    Err(WireError::VarLen)
}

/// Read a length-prefixed UTF-8 string
pub fn get_string(buf: &mut Bytes) -> Result<String, WireError> {
    let len = get_var_len(buf)?;
    ensure_remaining(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::Utf8)
}

/// Read a string if any bytes remain, `None` at the end of the body
pub fn get_optional_string(buf: &mut Bytes) -> Result<Option<String>, WireError> {
    if buf.has_remaining() {
        get_string(buf).map(Some)
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_roundtrip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "héllo");
        put_string(&mut buf, "");

        let mut bytes = buf.freeze();
        assert_eq!(get_string(&mut bytes).unwrap(), "héllo");
        assert_eq!(get_string(&mut bytes).unwrap(), "");
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_var_len_multi_byte() {
        let mut buf = BytesMut::new();
        put_var_len(&mut buf, 300);
        // 300 = 0b1_0010_1100 -> 0xAC 0x02
        assert_eq!(&buf[..], &[0xAC, 0x02]);

        let mut bytes = buf.freeze();
        assert_eq!(get_var_len(&mut bytes).unwrap(), 300);
    }

    #[test]
    fn test_long_string_prefix() {
        let value = "x".repeat(200);
        let mut buf = BytesMut::new();
        put_string(&mut buf, &value);
        assert_eq!(buf.len(), 202);

        let mut bytes = buf.freeze();
        assert_eq!(get_string(&mut bytes).unwrap(), value);
    }

    #[test]
    fn test_truncated_string() {
        let mut bytes = Bytes::from_static(&[5, b'a', b'b']);
        assert_eq!(
            get_string(&mut bytes),
            Err(WireError::Incomplete {
                needed: 5,
                available: 2
            })
        );
    }

    #[test]
    fn test_invalid_utf8() {
        let mut bytes = Bytes::from_static(&[2, 0xC3, 0x28]);
        assert_eq!(get_string(&mut bytes), Err(WireError::Utf8));
    }

    #[test]
    fn test_runaway_var_len() {
        let mut bytes = Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert_eq!(get_var_len(&mut bytes), Err(WireError::VarLen));
    }

    #[test]
    fn test_bool_and_u8() {
        let mut buf = BytesMut::new();
        put_bool(&mut buf, true);
        put_bool(&mut buf, false);
        buf.put_u8(7);

        let mut bytes = buf.freeze();
        assert!(get_bool(&mut bytes).unwrap());
        assert!(!get_bool(&mut bytes).unwrap());
        assert_eq!(get_u8(&mut bytes).unwrap(), 7);
        assert!(get_u8(&mut bytes).is_err());
    }
}
