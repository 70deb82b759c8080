//! Parameter and result serialization.

use std::panic::{self, AssertUnwindSafe};

use bytes::{BufMut, Bytes, BytesMut};

use tern_core::{panic_message, CodecError};

/// Encodes and decodes the values carried by calls and replies.
///
/// The transport never looks inside a value: the client encodes the
/// parameter with one codec and the server decodes it with the matching one,
/// and the same for results in the other direction. Implementations must be
/// deterministic and must consume exactly the bytes they produced.
pub trait Codec: Send + Sync + 'static {
    /// Value type handled by this codec.
    type Item: Send + 'static;

    /// Append the wire form of `item` to `dst`.
    fn encode(&self, item: &Self::Item, dst: &mut BytesMut) -> Result<(), CodecError>;

    /// Decode one value from the whole of `src`.
    fn decode(&self, src: &[u8]) -> Result<Self::Item, CodecError>;
}

/// Codec calls that report a panicking implementation as a [`CodecError`].
///
/// The transport runs user codecs on its own pipeline threads; these keep a
/// faulty codec from taking one of them down.
pub trait CodecExt: Codec {
    /// Like [`Codec::encode`]. On failure `dst` is left as it was.
    fn encode_guarded(&self, item: &Self::Item, dst: &mut BytesMut) -> Result<(), CodecError> {
        let start = dst.len();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.encode(item, dst)))
            .unwrap_or_else(|payload| Err(CodecError::Encode(panic_message(payload.as_ref()))));
        if result.is_err() {
            dst.truncate(start);
        }
        result
    }

    /// Like [`Codec::decode`].
    fn decode_guarded(&self, src: &[u8]) -> Result<Self::Item, CodecError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.decode(src)))
            .unwrap_or_else(|payload| Err(CodecError::Decode(panic_message(payload.as_ref()))))
    }
}

impl<C: Codec + ?Sized> CodecExt for C {}

/// Signed 64-bit integers as eight big-endian bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct I64Codec;

impl Codec for I64Codec {
    type Item = i64;

    #[inline]
    fn encode(&self, item: &i64, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.put_i64(*item);
        Ok(())
    }

    #[inline]
    fn decode(&self, src: &[u8]) -> Result<i64, CodecError> {
        match src.len() {
            8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(src);
                Ok(i64::from_be_bytes(raw))
            }
            n if n < 8 => Err(CodecError::Truncated {
                needed: 8,
                available: n,
            }),
            n => Err(CodecError::TrailingBytes(n - 8)),
        }
    }
}

/// Raw bytes, passed through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Item = Bytes;

    #[inline]
    fn encode(&self, item: &Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.extend_from_slice(item);
        Ok(())
    }

    #[inline]
    fn decode(&self, src: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(src))
    }
}

/// UTF-8 strings without a length prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec for StringCodec {
    type Item = String;

    fn encode(&self, item: &String, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }

    fn decode(&self, src: &[u8]) -> Result<String, CodecError> {
        std::str::from_utf8(src)
            .map(str::to_owned)
            .map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i64_is_big_endian() {
        let mut buf = BytesMut::new();
        I64Codec.encode(&0x0102_0304_0506_0708, &mut buf).unwrap();
        assert_eq!(&buf[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(I64Codec.decode(&buf).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_i64_negative() {
        let mut buf = BytesMut::new();
        I64Codec.encode(&-2, &mut buf).unwrap();
        assert_eq!(I64Codec.decode(&buf).unwrap(), -2);
    }

    #[test]
    fn test_i64_rejects_short_input() {
        let result = I64Codec.decode(&[0, 0, 1]);
        assert!(matches!(
            result,
            Err(CodecError::Truncated {
                needed: 8,
                available: 3
            })
        ));
    }

    #[test]
    fn test_i64_rejects_trailing_bytes() {
        let result = I64Codec.decode(&[0; 10]);
        assert!(matches!(result, Err(CodecError::TrailingBytes(2))));
    }

    #[test]
    fn test_bytes_passthrough() {
        let mut buf = BytesMut::new();
        BytesCodec
            .encode(&Bytes::from_static(b"\x00\xffraw"), &mut buf)
            .unwrap();
        assert_eq!(BytesCodec.decode(&buf).unwrap(), &b"\x00\xffraw"[..]);
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        assert!(matches!(
            StringCodec.decode(&[0xc3, 0x28]),
            Err(CodecError::Decode(_))
        ));
        assert_eq!(StringCodec.decode(b"echo").unwrap(), "echo");
    }

    /// Writes a byte, then panics.
    struct Exploding;

    impl Codec for Exploding {
        type Item = u8;

        fn encode(&self, item: &u8, dst: &mut BytesMut) -> Result<(), CodecError> {
            dst.put_u8(*item);
            panic!("encoder blew up");
        }

        fn decode(&self, _src: &[u8]) -> Result<u8, CodecError> {
            panic!("decoder blew up");
        }
    }

    #[test]
    fn test_guarded_encode_reports_panic_and_restores_buffer() {
        let mut buf = BytesMut::from(&b"kept"[..]);
        match Exploding.encode_guarded(&1, &mut buf) {
            Err(CodecError::Encode(message)) => assert_eq!(message, "encoder blew up"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(&buf[..], b"kept");
    }

    #[test]
    fn test_guarded_decode_reports_panic() {
        match Exploding.decode_guarded(b"x") {
            Err(CodecError::Decode(message)) => assert_eq!(message, "decoder blew up"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(I64Codec.decode_guarded(&[0, 0, 0, 0, 0, 0, 0, 9]).unwrap(), 9);
    }
}
