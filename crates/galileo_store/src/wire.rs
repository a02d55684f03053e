//! Self-describing binary encoding for protocol payloads.
//!
//! Every multi-byte integer is big-endian. Strings are a `u32` byte length
//! followed by UTF-8 bytes; byte blobs are a `u32` length followed by raw
//! bytes; sequences are a `u32` element count followed by the elements.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors that can arise when decoding wire-format data.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("unexpected end of input: {needed} bytes needed, {remaining} available")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("unknown event tag {0}")]
    UnknownTag(u32),

    #[error("trailing garbage after payload: {0} bytes")]
    TrailingBytes(usize),
}

/// A value that can be written to a wire buffer.
pub trait Encode {
    fn encode(&self, buf: &mut BytesMut);

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// A value that can be read back from a wire buffer.
pub trait Decode: Sized {
    fn decode(buf: &mut Bytes) -> Result<Self, WireError>;

    /// Decode a value that must consume the buffer exactly.
    fn from_bytes(mut bytes: Bytes) -> Result<Self, WireError> {
        let value = Self::decode(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(WireError::TrailingBytes(bytes.len()));
        }
        Ok(value)
    }
}

fn ensure(buf: &Bytes, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::UnexpectedEof {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub fn get_u16(buf: &mut Bytes) -> Result<u16, WireError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn get_u32(buf: &mut Bytes) -> Result<u32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn get_u64(buf: &mut Bytes) -> Result<u64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

pub fn get_f64(buf: &mut Bytes) -> Result<f64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_f64())
}

pub fn put_blob(buf: &mut BytesMut, blob: &[u8]) {
    buf.put_u32(blob.len() as u32);
    buf.put_slice(blob);
}

pub fn get_blob(buf: &mut Bytes) -> Result<Bytes, WireError> {
    let len = get_u32(buf)? as usize;
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

pub fn put_str(buf: &mut BytesMut, value: &str) {
    put_blob(buf, value.as_bytes());
}

pub fn get_str(buf: &mut Bytes) -> Result<String, WireError> {
    let blob = get_blob(buf)?;
    Ok(String::from_utf8(blob.to_vec())?)
}

pub fn put_seq<T: Encode>(buf: &mut BytesMut, items: &[T]) {
    buf.put_u32(items.len() as u32);
    for item in items {
        item.encode(buf);
    }
}

pub fn get_seq<T: Decode>(buf: &mut Bytes) -> Result<Vec<T>, WireError> {
    let count = get_u32(buf)? as usize;
    let mut items = Vec::with_capacity(count.min(buf.remaining()));
    for _ in 0..count {
        items.push(T::decode(buf)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pair {
        left: String,
        right: u64,
    }

    impl Encode for Pair {
        fn encode(&self, buf: &mut BytesMut) {
            put_str(buf, &self.left);
            buf.put_u64(self.right);
        }
    }

    impl Decode for Pair {
        fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
            Ok(Pair {
                left: get_str(buf)?,
                right: get_u64(buf)?,
            })
        }
    }

    #[test]
    fn string_round_trip() {
        let mut buf = BytesMut::new();
        put_str(&mut buf, "temperature<300");
        put_str(&mut buf, "");
        let mut bytes = buf.freeze();
        assert_eq!(get_str(&mut bytes).unwrap(), "temperature<300");
        assert_eq!(get_str(&mut bytes).unwrap(), "");
        assert!(bytes.is_empty());
    }

    #[test]
    fn blob_round_trip() {
        let mut buf = BytesMut::new();
        put_blob(&mut buf, &[0xde, 0xad, 0xbe, 0xef]);
        let mut bytes = buf.freeze();
        assert_eq!(get_blob(&mut bytes).unwrap().as_ref(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn seq_round_trip() {
        let pairs = vec![
            Pair { left: "a".into(), right: 1 },
            Pair { left: "b".into(), right: 2 },
        ];
        let mut buf = BytesMut::new();
        put_seq(&mut buf, &pairs);
        let mut bytes = buf.freeze();
        assert_eq!(get_seq::<Pair>(&mut bytes).unwrap(), pairs);
    }

    #[test]
    fn integers_are_big_endian() {
        let mut buf = BytesMut::new();
        buf.put_u32(0x0102_0304);
        assert_eq!(buf.as_ref(), &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn short_input_is_an_error() {
        let mut bytes = Bytes::from_static(&[0x00, 0x00, 0x00, 0x08, 0x41]);
        let err = get_str(&mut bytes).unwrap_err();
        assert!(matches!(err, WireError::UnexpectedEof { needed: 8, .. }));
    }

    #[test]
    fn from_bytes_rejects_trailing_garbage() {
        let mut buf = BytesMut::new();
        Pair { left: "x".into(), right: 9 }.encode(&mut buf);
        buf.put_u8(0xff);
        let err = Pair::from_bytes(buf.freeze()).unwrap_err();
        assert!(matches!(err, WireError::TrailingBytes(1)));
    }
}
