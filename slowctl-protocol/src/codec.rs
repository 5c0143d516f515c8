/// Length-prefixed framing of payloads on a byte stream.
///
/// Every frame is a big-endian `u16` length followed by that many payload bytes.
/// [`FrameReader`] and [`FrameWriter`] keep their position between calls, so they can
/// be driven by non-blocking sockets that deliver or accept a frame in pieces.
use std::io::{self, ErrorKind, Read, Write};

use crate::error::FrameError;

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 2;

/// Largest payload that fits into a single frame.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Outcome of driving a partial read or write.
#[derive(Debug, Eq, PartialEq)]
pub enum Progress<T> {
    /// The stream would block. Call again once it is ready.
    Pending,
    /// The frame is complete.
    Complete(T),
    /// The peer shut the stream down in an orderly way.
    Closed,
}

/// Prepends the length header to `payload`.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        max: MAX_PAYLOAD_LEN,
        got: payload.len(),
    })?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Writes one frame to a blocking writer.
pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let frame = encode_frame(payload).map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    writer.write_all(&frame)
}

/// Reads one frame from a blocking reader.
pub fn read_frame(reader: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    let mut payload = vec![0u8; u16::from_be_bytes(header) as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Reassembles frames from a stream that may deliver them in arbitrary pieces.
///
/// The reader never consumes bytes past the end of the current frame.
#[derive(Debug, Default)]
pub struct FrameReader {
    header: [u8; HEADER_LEN],
    header_filled: usize,
    payload: Vec<u8>,
    payload_filled: usize,
}

impl FrameReader {
    pub fn new() -> FrameReader {
        FrameReader::default()
    }

    /// True if no part of a frame has been received yet.
    pub fn is_idle(&self) -> bool {
        self.header_filled == 0
    }

    /// Continues reading the current frame.
    ///
    /// Returns [`Progress::Pending`] when the reader would block, keeping everything read
    /// so far. An end of stream is reported as [`Progress::Closed`], also in the middle
    /// of a frame.
    pub fn read_from(&mut self, reader: &mut impl Read) -> io::Result<Progress<Vec<u8>>> {
        loop {
            let buf = if self.header_filled < HEADER_LEN {
                &mut self.header[self.header_filled..]
            } else if self.payload_filled < self.payload.len() {
                &mut self.payload[self.payload_filled..]
            } else {
                self.header_filled = 0;
                self.payload_filled = 0;
                return Ok(Progress::Complete(std::mem::take(&mut self.payload)));
            };

            let n = match reader.read(buf) {
                Ok(0) => return Ok(Progress::Closed),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Progress::Pending),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            if self.header_filled < HEADER_LEN {
                self.header_filled += n;
                if self.header_filled == HEADER_LEN {
                    self.payload = vec![0u8; u16::from_be_bytes(self.header) as usize];
                }
            } else {
                self.payload_filled += n;
            }
        }
    }
}

/// Writes one frame to a stream that may accept it in arbitrary pieces.
#[derive(Debug)]
pub struct FrameWriter {
    frame: Vec<u8>,
    written: usize,
}

impl FrameWriter {
    pub fn new(payload: &[u8]) -> Result<FrameWriter, FrameError> {
        Ok(FrameWriter {
            frame: encode_frame(payload)?,
            written: 0,
        })
    }

    /// Bytes of the frame (header included) not yet accepted by the stream.
    pub fn remaining(&self) -> usize {
        self.frame.len() - self.written
    }

    /// Continues writing from the offset reached by previous calls.
    pub fn write_to(&mut self, writer: &mut impl Write) -> io::Result<Progress<()>> {
        while self.written < self.frame.len() {
            match writer.write(&self.frame[self.written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::WriteZero,
                        "stream accepted no bytes",
                    ));
                }
                Ok(n) => self.written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Progress::Pending),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(Progress::Complete(()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    /// Hands out at most `chunk` bytes per call and blocks every other call.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        block_next: bool,
    }

    impl Trickle {
        fn new(data: Vec<u8>, chunk: usize) -> Trickle {
            Trickle {
                data,
                pos: 0,
                chunk,
                block_next: true,
            }
        }
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.block_next = !self.block_next;
            if !self.block_next || self.pos == self.data.len() {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    /// Accepts at most `chunk` bytes per call, then blocks once.
    struct Narrow {
        out: Vec<u8>,
        chunk: usize,
        block_next: bool,
    }

    impl Write for Narrow {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.block_next {
                self.block_next = false;
                return Err(ErrorKind::WouldBlock.into());
            }
            self.block_next = true;
            let n = self.chunk.min(buf.len());
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn drain(reader: &mut FrameReader, source: &mut impl Read) -> Vec<u8> {
        for _ in 0..1_000_000 {
            match reader.read_from(source).unwrap() {
                Progress::Complete(payload) => return payload,
                Progress::Pending => {}
                Progress::Closed => panic!("unexpected end of stream"),
            }
        }
        panic!("frame never completed")
    }

    #[test]
    fn header_is_big_endian_length() {
        let frame = encode_frame(b"abc").unwrap();
        assert_eq!(frame, b"\x00\x03abc".to_vec());
        assert_eq!(encode_frame(&[]).unwrap(), vec![0, 0]);
        assert_eq!(&encode_frame(&payload(256)).unwrap()[..2], &[0x01, 0x00]);
    }

    #[test]
    fn boundary_lengths_survive_framing() {
        for len in [0, 1, 255, 256, MAX_PAYLOAD_LEN] {
            let data = payload(len);
            let mut cursor = Cursor::new(encode_frame(&data).unwrap());
            let mut reader = FrameReader::new();
            assert_eq!(
                reader.read_from(&mut cursor).unwrap(),
                Progress::Complete(data)
            );
        }
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let data = payload(MAX_PAYLOAD_LEN + 1);
        assert_eq!(
            encode_frame(&data),
            Err(FrameError::TooLarge {
                max: MAX_PAYLOAD_LEN,
                got: MAX_PAYLOAD_LEN + 1
            })
        );
        assert!(FrameWriter::new(&data).is_err());
        let mut sink = Vec::new();
        assert_eq!(
            write_frame(&mut sink, &data).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert!(sink.is_empty());
    }

    #[test]
    fn single_byte_chunks_resume() {
        let data = payload(300);
        let mut source = Trickle::new(encode_frame(&data).unwrap(), 1);
        let mut reader = FrameReader::new();
        assert_eq!(reader.read_from(&mut source).unwrap(), Progress::Pending);
        assert!(reader.is_idle());
        assert_eq!(drain(&mut reader, &mut source), data);
        assert!(reader.is_idle());
    }

    #[test]
    fn header_split_across_calls() {
        let data = payload(513);
        let mut source = Trickle::new(encode_frame(&data).unwrap(), 7);
        let mut reader = FrameReader::new();
        assert_eq!(drain(&mut reader, &mut source), data);
    }

    #[test]
    fn back_to_back_frames_are_not_merged() {
        let mut stream = encode_frame(b"first").unwrap();
        stream.extend(encode_frame(b"").unwrap());
        stream.extend(encode_frame(b"third").unwrap());
        let mut source = Trickle::new(stream, 3);
        let mut reader = FrameReader::new();
        assert_eq!(drain(&mut reader, &mut source), b"first");
        assert_eq!(drain(&mut reader, &mut source), b"");
        assert_eq!(drain(&mut reader, &mut source), b"third");
    }

    #[test]
    fn end_of_stream_mid_frame_is_closed() {
        let mut frame = encode_frame(b"truncated").unwrap();
        frame.truncate(5);
        let mut cursor = Cursor::new(frame);
        let mut reader = FrameReader::new();
        assert_eq!(reader.read_from(&mut cursor).unwrap(), Progress::Closed);
    }

    #[test]
    fn partial_writes_resume_from_offset() {
        let data = payload(1000);
        let mut writer = FrameWriter::new(&data).unwrap();
        let mut sink = Narrow {
            out: Vec::new(),
            chunk: 3,
            block_next: false,
        };
        let mut calls = 0;
        while writer.write_to(&mut sink).unwrap() == Progress::Pending {
            calls += 1;
        }
        assert!(calls > 1);
        assert_eq!(writer.remaining(), 0);
        assert_eq!(sink.out, encode_frame(&data).unwrap());
    }

    #[test]
    fn blocking_helpers() {
        let mut out = Vec::new();
        write_frame(&mut out, b"hello").unwrap();
        write_frame(&mut out, b"world").unwrap();
        let mut cursor = Cursor::new(out);
        assert_eq!(read_frame(&mut cursor).unwrap(), b"hello");
        assert_eq!(read_frame(&mut cursor).unwrap(), b"world");
        assert_eq!(
            read_frame(&mut cursor).unwrap_err().kind(),
            ErrorKind::UnexpectedEof
        );
    }
}
