use std::{
    io::{self, ErrorKind},
    net::{Shutdown, TcpStream},
    os::fd::{AsFd, BorrowedFd},
};

use slowctl_protocol::{
    Role,
    codec::{FrameReader, FrameWriter, Progress},
    error::FrameError,
};

/// State of one direction of a [`Connection`].
///
/// Receive and send state are tracked separately since a stream can be ready to
/// read while not ready to write.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkState {
    /// Waiting for the next readiness poll.
    Idle,
    /// The last poll reported the stream readable (receive) or writable (send).
    Ready,
    /// A whole frame was received or sent. Must be reset to [`LinkState::Idle`] by the consumer.
    Completed,
    /// An I/O error occurred. The connection will be dropped.
    Failed,
    /// The peer shut the stream down. The connection will be dropped.
    PeerClosed,
}

impl LinkState {
    pub fn is_dead(&self) -> bool {
        matches!(self, LinkState::Failed | LinkState::PeerClosed)
    }
}

/// Result of a non-blocking receive or send attempt.
#[derive(Debug, Eq, PartialEq)]
pub enum Attempt<T> {
    WouldBlock,
    Completed(T),
    Failed,
    PeerClosed,
}

/// Readiness of a connection as reported by the poll.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

/// A duplex stream to a peer of a known role.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: Role,
    reader: FrameReader,
    writer: Option<FrameWriter>,
    inbound: Option<Vec<u8>>,
    recv_state: LinkState,
    send_state: LinkState,
}

impl Connection {
    /// Wraps an established stream and switches it to non-blocking mode.
    pub fn new(stream: TcpStream, peer: Role) -> io::Result<Connection> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Connection {
            stream,
            peer,
            reader: FrameReader::new(),
            writer: None,
            inbound: None,
            recv_state: LinkState::Idle,
            send_state: LinkState::Idle,
        })
    }

    pub fn peer(&self) -> Role {
        self.peer
    }

    pub fn recv_state(&self) -> LinkState {
        self.recv_state
    }

    pub fn send_state(&self) -> LinkState {
        self.send_state
    }

    pub fn is_dead(&self) -> bool {
        self.recv_state.is_dead() || self.send_state.is_dead()
    }

    /// True while a frame is partially written.
    pub fn is_sending(&self) -> bool {
        self.writer.is_some()
    }

    /// Records the result of a readiness poll.
    ///
    /// Only idle directions become ready: completed states wait for their consumer and
    /// dead states are final.
    pub fn update_readiness(&mut self, readiness: Readiness) {
        if self.is_dead() {
            return;
        }
        if readiness.error {
            log::warn!("Poll reported an error on the {} link", self.peer);
            self.recv_state = LinkState::Failed;
            self.send_state = LinkState::Failed;
            return;
        }
        if readiness.hangup && !readiness.readable {
            self.recv_state = LinkState::PeerClosed;
            self.send_state = LinkState::PeerClosed;
            return;
        }
        if readiness.readable && self.recv_state == LinkState::Idle {
            self.recv_state = LinkState::Ready;
        }
        if readiness.writable && self.send_state == LinkState::Idle {
            self.send_state = LinkState::Ready;
        }
    }

    /// Continues reading the current frame without blocking.
    ///
    /// A completed payload is kept in the inbound buffer until [`Connection::take_inbound`]
    /// is called; no further reads happen before that.
    pub fn attempt_receive(&mut self) -> Attempt<&[u8]> {
        match self.recv_state {
            LinkState::Failed => return Attempt::Failed,
            LinkState::PeerClosed => return Attempt::PeerClosed,
            LinkState::Completed => return Attempt::WouldBlock,
            LinkState::Idle | LinkState::Ready => {}
        }
        match self.reader.read_from(&mut self.stream) {
            Ok(Progress::Complete(payload)) => {
                log::trace!("Received from {}: {:02x?}", self.peer, &payload[..]);
                self.recv_state = LinkState::Completed;
                Attempt::Completed(self.inbound.insert(payload).as_slice())
            }
            Ok(Progress::Pending) => {
                self.recv_state = LinkState::Idle;
                Attempt::WouldBlock
            }
            Ok(Progress::Closed) => {
                if !self.reader.is_idle() {
                    log::warn!("The {} peer closed the link in the middle of a frame", self.peer);
                }
                self.recv_state = LinkState::PeerClosed;
                Attempt::PeerClosed
            }
            Err(e) => {
                log::error!("Receive from the {} peer failed: {}", self.peer, e);
                self.recv_state = LinkState::Failed;
                Attempt::Failed
            }
        }
    }

    /// Hands out the completed inbound payload and resets the receive state to idle.
    pub fn take_inbound(&mut self) -> Option<Vec<u8>> {
        let payload = self.inbound.take()?;
        if self.recv_state == LinkState::Completed {
            self.recv_state = LinkState::Idle;
        }
        Some(payload)
    }

    /// Starts a new outgoing frame. Fails if the payload does not fit a frame.
    ///
    /// Any frame still in flight must be finished first, see [`Connection::is_sending`].
    pub fn begin_send(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        debug_assert!(self.writer.is_none(), "frame already in flight");
        log::trace!("Sending to {}: {:02x?}", self.peer, payload);
        self.writer = Some(FrameWriter::new(payload)?);
        Ok(())
    }

    /// Continues writing the frame in flight from where the last attempt stopped.
    ///
    /// Returns `Completed` right away if there is nothing to send.
    pub fn attempt_send(&mut self) -> Attempt<()> {
        match self.send_state {
            LinkState::Failed => return Attempt::Failed,
            LinkState::PeerClosed => return Attempt::PeerClosed,
            _ => {}
        }
        let Some(writer) = self.writer.as_mut() else {
            return Attempt::Completed(());
        };
        match writer.write_to(&mut self.stream) {
            Ok(Progress::Complete(())) => {
                self.writer = None;
                self.send_state = LinkState::Completed;
                Attempt::Completed(())
            }
            Ok(Progress::Pending) => {
                log::trace!(
                    "Send to {} would block with {} bytes left",
                    self.peer,
                    writer.remaining()
                );
                self.send_state = LinkState::Idle;
                Attempt::WouldBlock
            }
            Ok(Progress::Closed) => {
                self.send_state = LinkState::PeerClosed;
                Attempt::PeerClosed
            }
            Err(e) if is_disconnect(&e) => {
                log::info!("The {} peer went away while sending: {}", self.peer, e);
                self.send_state = LinkState::PeerClosed;
                Attempt::PeerClosed
            }
            Err(e) => {
                log::error!("Send to the {} peer failed: {}", self.peer, e);
                self.send_state = LinkState::Failed;
                Attempt::Failed
            }
        }
    }

    /// Resets a completed send to idle.
    pub fn reset_send(&mut self) {
        if self.send_state == LinkState::Completed {
            self.send_state = LinkState::Idle;
        }
    }

    /// Shuts both directions of the stream down.
    pub fn close(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}
