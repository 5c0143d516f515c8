//! # Slow Control Protocol Library
//!
//! Wire-level building blocks shared by every process of the slow control network:
//! the coordinator, the backplane and target-module controllers, and the operator interface.
//!
//! ## Overview
//!
//! - [`Role`]: the part a process plays in the network. Determines which peers it talks to.
//! - [`codec`]: length-prefixed framing with resumable readers and writers for non-blocking sockets.
//! - Payload records exchanged between roles:
//!   - [`MacroInvocation`]: interface → coordinator, names a macro from the command configuration
//!   - [`CommandRecord`]: coordinator → device, one atomic command
//!   - [`Telemetry`]: device → coordinator → interface, readings plus an echo of the command
//!
//! ## Frame Format
//!
//! `[length: u16 big endian][length bytes of payload]`
//!
//! There is no magic number, version or checksum. Payloads are limited to
//! [`codec::MAX_PAYLOAD_LEN`] bytes.
//!
//! ```
//! use slowctl_protocol::codec::{encode_frame, FrameReader, Progress};
//! use std::io::Cursor;
//!
//! let frame = encode_frame(b"hello").expect("Payload fits into a frame");
//! assert_eq!(frame, b"\x00\x05hello");
//!
//! let mut reader = FrameReader::new();
//! let mut cursor = Cursor::new(frame);
//! assert_eq!(reader.read_from(&mut cursor).unwrap(), Progress::Complete(b"hello".to_vec()));
//! ```
//!
//! ## Payload Encoding
//!
//! Records are encoded as JSON. The transport treats them as opaque byte strings.
//!
//! ```
//! use slowctl_protocol::MacroInvocation;
//!
//! let invocation = MacroInvocation::new("poll_voltage", "");
//! let bytes = invocation.to_bytes().unwrap();
//! assert_eq!(MacroInvocation::from_bytes(&bytes).unwrap(), invocation);
//! ```
//!
//! ## Features
//!
//! - `tokio`: provides [`tokio_codec::FrameCodec`] for use with `tokio_util::codec::Framed`.

pub mod protocol;
pub use protocol::*;
pub mod codec;
pub mod error;
#[cfg(feature = "tokio")]
pub mod tokio_codec;
