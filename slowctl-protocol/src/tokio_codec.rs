//! [`tokio_util::codec`] adapter for the frame format.
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::error::FrameError;

/// Splits a byte stream into length-prefixed payloads.
///
/// ```
/// use bytes::{Bytes, BytesMut};
/// use slowctl_protocol::tokio_codec::FrameCodec;
/// use tokio_util::codec::{Decoder, Encoder};
///
/// let mut buf = BytesMut::new();
/// FrameCodec.encode(Bytes::from_static(b"ping"), &mut buf).unwrap();
/// assert_eq!(&buf[..], b"\x00\x04ping");
/// assert_eq!(FrameCodec.decode(&mut buf).unwrap().unwrap(), &b"ping"[..]);
/// ```
#[derive(Copy, Clone, Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = u16::try_from(item.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                FrameError::TooLarge {
                    max: MAX_PAYLOAD_LEN,
                    got: item.len(),
                },
            )
        })?;
        dst.reserve(HEADER_LEN + item.len());
        dst.put_u16(len);
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::encode_frame;

    #[test]
    fn waits_for_complete_frame() {
        let frame = encode_frame(b"telemetry").unwrap();
        let mut buf = BytesMut::new();
        for byte in &frame[..frame.len() - 1] {
            buf.put_u8(*byte);
            assert!(FrameCodec.decode(&mut buf).unwrap().is_none());
        }
        buf.put_u8(frame[frame.len() - 1]);
        assert_eq!(FrameCodec.decode(&mut buf).unwrap().unwrap(), &b"telemetry"[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn matches_blocking_encoder() {
        let mut buf = BytesMut::new();
        FrameCodec
            .encode(Bytes::from_static(&[7u8; 300]), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &encode_frame(&[7u8; 300]).unwrap()[..]);
    }

    #[test]
    fn rejects_oversized_item() {
        let mut buf = BytesMut::new();
        let item = Bytes::from(vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(FrameCodec.encode(item, &mut buf).is_err());
        assert!(buf.is_empty());
    }
}
