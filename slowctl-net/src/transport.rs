use std::{
    collections::{BTreeMap, VecDeque},
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    os::fd::{AsFd, AsRawFd},
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::socket::{AddressFamily, SockFlag, SockType, SockaddrStorage, connect, socket},
};
use slowctl_protocol::{Role, codec::MAX_PAYLOAD_LEN};

use crate::{
    connection::{Attempt, Connection, LinkState, Readiness},
    error::TransportError,
};

#[derive(Debug, Clone)]
pub struct Config {
    /// The role of this process.
    pub role: Role,
    /// Host name of the coordinator. Unused by the coordinator itself.
    pub host: String,
    /// Address the coordinator binds its listeners to.
    pub bind_addr: IpAddr,
    pub control_port: u16,
    pub module_port: u16,
    pub interface_port: u16,
    pub connect_timeout: Duration,
    /// Peer roles the coordinator must be linked to for a tick to succeed.
    pub required_peers: Vec<Role>,
    /// Payloads kept per role while no connection can take them. The oldest is dropped first.
    pub outbox_limit: usize,
}

impl Config {
    pub fn new(role: Role) -> Config {
        Config {
            role,
            ..Config::default()
        }
    }

    /// The port used by links between the coordinator and peers of `role`.
    pub fn port_for(&self, role: Role) -> Option<u16> {
        match role {
            Role::ControlNode => Some(self.control_port),
            Role::ModuleNode => Some(self.module_port),
            Role::InterfaceNode => Some(self.interface_port),
            Role::Coordinator => None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Coordinator,
            host: "localhost".to_string(),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_port: Role::CONTROL_PORT,
            module_port: Role::MODULE_PORT,
            interface_port: Role::INTERFACE_PORT,
            connect_timeout: Duration::from_millis(500),
            required_peers: vec![Role::ControlNode, Role::InterfaceNode],
            outbox_limit: 256,
        }
    }
}

/// Builder to create a [TransportContext] and modify configuration options
///
/// # Example
///
/// ```
/// use slowctl_net::transport::Builder;
/// use slowctl_protocol::Role;
/// use std::time::Duration;
///
/// let transport = Builder::new(Role::ControlNode)
///     .host("daq-server")
///     .control_port(4000)
///     .connect_timeout(Duration::from_millis(200))
///     .build();
/// assert_eq!(transport.role(), Role::ControlNode);
/// ```
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new(role: Role) -> Builder {
        Builder {
            config: Config::new(role),
        }
    }

    /// Set the host name of the coordinator
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the address the coordinator listens on
    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    pub fn control_port(mut self, port: u16) -> Self {
        self.config.control_port = port;
        self
    }

    pub fn module_port(mut self, port: u16) -> Self {
        self.config.module_port = port;
        self
    }

    pub fn interface_port(mut self, port: u16) -> Self {
        self.config.interface_port = port;
        self
    }

    /// Set the upper bound on establishing a link to the coordinator
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Replace the peer roles the coordinator requires
    pub fn required_peers(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.config.required_peers = roles.into_iter().collect();
        self
    }

    /// Set how many undelivered payloads are kept per role
    pub fn outbox_limit(mut self, limit: usize) -> Self {
        self.config.outbox_limit = limit;
        self
    }

    /// Build and return the transport
    pub fn build(self) -> TransportContext {
        TransportContext::new(self.config)
    }
}

/// A payload received during a tick, tagged with the role of its sender.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Inbound {
    pub role: Role,
    pub payload: Vec<u8>,
}

/// Outcome of [`TransportContext::tick`].
#[derive(Debug, Default)]
pub struct Tick {
    /// Payloads completed during this tick, in connection order.
    pub incoming: Vec<Inbound>,
    /// Outgoing payloads discarded during this tick, with the role they were meant for.
    pub dropped: Vec<(Role, Vec<u8>)>,
    /// False if a mandatory link could not be established or the poll failed.
    pub ok: bool,
}

#[derive(Debug)]
struct Listener {
    role: Role,
    socket: TcpListener,
}

/// A connection to the coordinator that was started but has not completed.
#[derive(Debug)]
struct PendingConnect {
    addr: SocketAddr,
    stream: TcpStream,
    started: Instant,
}

/// All links of one process.
///
/// The coordinator accepts peers on one listener per peer role. Every other role keeps
/// exactly one connection to the coordinator and re-establishes it when it drops.
#[derive(Debug)]
pub struct TransportContext {
    config: Config,
    connections: Vec<Connection>,
    listeners: Vec<Listener>,
    outbox: BTreeMap<Role, VecDeque<Vec<u8>>>,
    coordinator_addrs: Vec<SocketAddr>,
    next_addr: usize,
    pending: Option<PendingConnect>,
    links_down: bool,
}

impl TransportContext {
    pub fn new(config: Config) -> TransportContext {
        TransportContext {
            config,
            connections: Vec::new(),
            listeners: Vec::new(),
            outbox: BTreeMap::new(),
            coordinator_addrs: Vec::new(),
            next_addr: 0,
            pending: None,
            links_down: false,
        }
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Number of live connections to peers of `role`.
    pub fn count(&self, role: Role) -> usize {
        self.connections.iter().filter(|c| c.peer() == role).count()
    }

    /// Address of the coordinator's listener for `role`, once bound.
    pub fn local_addr(&self, role: Role) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|l| l.role == role)
            .and_then(|l| l.socket.local_addr().ok())
    }

    /// Payloads queued for `role` that have not been handed to a connection yet.
    pub fn queued(&self, role: Role) -> usize {
        self.outbox.get(&role).map_or(0, VecDeque::len)
    }

    /// Peer roles this process can exchange payloads with.
    fn is_peer(&self, role: Role) -> bool {
        match self.config.role {
            Role::Coordinator => role != Role::Coordinator,
            _ => role == Role::Coordinator,
        }
    }

    /// True while a connection to the coordinator is being set up.
    pub fn is_connecting(&self) -> bool {
        self.pending.is_some()
    }

    /// Sets up the links this role is responsible for.
    ///
    /// The coordinator binds any listener not yet bound. Every other role connects to the
    /// coordinator unless already connected, waiting at most the connect timeout per
    /// address. Meant for startup: [`tick`](TransportContext::tick) reconnects without
    /// blocking.
    pub fn establish(&mut self) -> Result<(), TransportError> {
        match self.config.role {
            Role::Coordinator => self.listen(),
            _ if self.count(Role::Coordinator) > 0 => Ok(()),
            _ => self.connect(),
        }
    }

    fn listen(&mut self) -> Result<(), TransportError> {
        for role in [Role::ControlNode, Role::ModuleNode, Role::InterfaceNode] {
            if self.listeners.iter().any(|l| l.role == role) {
                continue;
            }
            let Some(port) = self.config.port_for(role) else {
                continue;
            };
            let addr = SocketAddr::new(self.config.bind_addr, port);
            let socket = TcpListener::bind(addr)
                .and_then(|socket| socket.set_nonblocking(true).map(|_| socket))
                .map_err(|source| TransportError::Bind { role, addr, source })?;
            log::info!(
                "Listening for {} peers on {}",
                role,
                socket.local_addr().unwrap_or(addr)
            );
            self.listeners.push(Listener { role, socket });
        }
        Ok(())
    }

    /// Addresses of the coordinator. A host name is looked up once and the result reused.
    fn resolve(&mut self) -> Result<&[SocketAddr], TransportError> {
        if self.coordinator_addrs.is_empty() {
            let Some(port) = self.config.port_for(self.config.role) else {
                return Ok(&[]);
            };
            let host = self.config.host.as_str();
            let addrs: Vec<SocketAddr> = match host.parse::<IpAddr>() {
                Ok(ip) => vec![SocketAddr::new(ip, port)],
                Err(_) => (host, port)
                    .to_socket_addrs()
                    .map_err(|source| TransportError::Resolve {
                        host: host.to_string(),
                        source,
                    })?
                    .collect(),
            };
            if addrs.is_empty() {
                return Err(TransportError::Resolve {
                    host: host.to_string(),
                    source: io::Error::new(ErrorKind::NotFound, "no address found"),
                });
            }
            self.coordinator_addrs = addrs;
        }
        Ok(&self.coordinator_addrs)
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        self.pending = None;
        let timeout = self.config.connect_timeout;
        let addrs = self.resolve()?.to_vec();

        let mut last_error = None;
        for addr in addrs {
            log::debug!("Connecting to the coordinator at {}", addr);
            let connection = TcpStream::connect_timeout(&addr, timeout)
                .and_then(|stream| Connection::new(stream, Role::Coordinator));
            match connection {
                Ok(connection) => {
                    log::info!("Connected to the coordinator at {}", addr);
                    self.connections.push(connection);
                    return Ok(());
                }
                Err(e) => last_error = Some((addr, e)),
            }
        }
        match last_error {
            Some((addr, source)) => Err(TransportError::Connect {
                addr: addr.to_string(),
                source,
            }),
            None => Ok(()),
        }
    }

    /// Starts any missing link without blocking.
    ///
    /// A client starts one connection attempt at a time, cycling through the coordinator's
    /// addresses. The attempt is completed by the readiness poll and abandoned once it is
    /// older than the connect timeout.
    fn maintain(&mut self) -> Result<(), TransportError> {
        match self.config.role {
            Role::Coordinator => return self.listen(),
            _ if self.count(Role::Coordinator) > 0 => return Ok(()),
            _ => {}
        }
        if let Some(pending) = &self.pending {
            if pending.started.elapsed() < self.config.connect_timeout {
                return Ok(());
            }
            log::debug!("Connecting to the coordinator at {} timed out", pending.addr);
            self.pending = None;
        }

        let index = self.next_addr;
        let addrs = self.resolve()?;
        let Some(&addr) = addrs.get(index % addrs.len().max(1)) else {
            return Ok(());
        };
        self.next_addr = index.wrapping_add(1);
        let stream = begin_connect(addr).map_err(|source| TransportError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        log::debug!("Connecting to the coordinator at {}", addr);
        self.pending = Some(PendingConnect {
            addr,
            stream,
            started: Instant::now(),
        });
        Ok(())
    }

    /// Completes the pending connection once the poll reported activity on it.
    fn finish_connect(&mut self, events: PollFlags) {
        if events.is_empty() {
            return;
        }
        let Some(PendingConnect { addr, stream, .. }) = self.pending.take() else {
            return;
        };
        let connection = match stream.take_error() {
            Ok(None) => Connection::new(stream, Role::Coordinator),
            Ok(Some(e)) | Err(e) => Err(e),
        };
        match connection {
            Ok(connection) => {
                log::info!("Connected to the coordinator at {}", addr);
                self.connections.push(connection);
            }
            Err(e) => log::debug!("Could not connect to the coordinator at {}: {}", addr, e),
        }
    }

    fn accept(&mut self, index: usize) {
        let listener = &self.listeners[index];
        loop {
            match listener.socket.accept() {
                Ok((stream, addr)) => match Connection::new(stream, listener.role) {
                    Ok(connection) => {
                        log::info!("New {} connection from {}", listener.role, addr);
                        self.connections.push(connection);
                    }
                    Err(e) => log::error!("Could not set up connection from {}: {}", addr, e),
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Connection error on the {} listener: {}", listener.role, e);
                    break;
                }
            }
        }
    }

    fn missing_peers(&self) -> Vec<Role> {
        match self.config.role {
            Role::Coordinator => self
                .config
                .required_peers
                .iter()
                .copied()
                .filter(|role| self.count(*role) == 0)
                .collect(),
            _ if self.count(Role::Coordinator) == 0 => vec![Role::Coordinator],
            _ => Vec::new(),
        }
    }

    /// Queues `payload` for `role`, returning whatever had to be discarded.
    fn enqueue(&mut self, role: Role, payload: Vec<u8>) -> Vec<Vec<u8>> {
        if !self.is_peer(role) {
            log::error!(
                "A {} process has no {} peer, dropping payload",
                self.config.role,
                role
            );
            return vec![payload];
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            log::error!(
                "Payload for {} too large! Maximum is {}, but got {}",
                role,
                MAX_PAYLOAD_LEN,
                payload.len()
            );
            return vec![payload];
        }
        let limit = self.config.outbox_limit.max(1);
        let queue = self.outbox.entry(role).or_default();
        let mut dropped = Vec::new();
        while queue.len() >= limit {
            if let Some(oldest) = queue.pop_front() {
                log::error!("Outbox for {} is full, dropping the oldest payload", role);
                dropped.push(oldest);
            }
        }
        queue.push_back(payload);
        dropped
    }

    /// True for the first connection of its role with payloads waiting for it.
    fn has_outbound(&self, index: usize) -> bool {
        let role = self.connections[index].peer();
        self.queued(role) > 0 && self.connections.iter().position(|c| c.peer() == role) == Some(index)
    }

    /// Waits for readiness of every listener and connection, accepting new peers.
    fn poll(&mut self, timeout_ms: i32) -> Result<(), TransportError> {
        let interests: Vec<PollFlags> = (0..self.connections.len())
            .map(|i| {
                if self.connections[i].is_sending() || self.has_outbound(i) {
                    PollFlags::POLLIN | PollFlags::POLLOUT
                } else {
                    PollFlags::POLLIN
                }
            })
            .collect();

        let revents: Vec<PollFlags> = {
            let mut fds: Vec<PollFd> = self
                .listeners
                .iter()
                .map(|l| PollFd::new(l.socket.as_fd(), PollFlags::POLLIN))
                .chain(
                    self.connections
                        .iter()
                        .zip(&interests)
                        .map(|(c, interest)| PollFd::new(c.as_fd(), *interest)),
                )
                .chain(
                    self.pending
                        .iter()
                        .map(|p| PollFd::new(p.stream.as_fd(), PollFlags::POLLOUT)),
                )
                .collect();
            if fds.is_empty() && timeout_ms < 0 {
                return Ok(());
            }
            match poll(&mut fds, poll_timeout(timeout_ms)) {
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(()),
                Err(e) => return Err(TransportError::Poll(e.into())),
            }
            fds.iter()
                .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
                .collect()
        };

        let (listener_events, rest) = revents.split_at(self.listeners.len());
        let (connection_events, pending_events) = rest.split_at(self.connections.len());
        if let Some(&events) = pending_events.first() {
            self.finish_connect(events);
        }
        for (connection, events) in self.connections.iter_mut().zip(connection_events) {
            connection.update_readiness(Readiness {
                readable: events.contains(PollFlags::POLLIN),
                writable: events.contains(PollFlags::POLLOUT),
                hangup: events.contains(PollFlags::POLLHUP),
                error: events.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL),
            });
        }
        let ready_listeners: Vec<usize> = listener_events
            .iter()
            .enumerate()
            .filter(|(_, events)| events.contains(PollFlags::POLLIN))
            .map(|(i, _)| i)
            .collect();
        for index in ready_listeners {
            self.accept(index);
        }
        Ok(())
    }

    /// Runs one cycle of link maintenance and I/O.
    ///
    /// `outgoing` payloads are queued per role and sent, in order, to the first connection
    /// of that role as it becomes writable. Missing links are started here and completed
    /// by the poll. A negative `timeout_ms` waits for readiness indefinitely; this is the
    /// only place where the transport blocks.
    pub fn tick(
        &mut self,
        outgoing: impl IntoIterator<Item = (Role, Vec<u8>)>,
        timeout_ms: i32,
    ) -> Tick {
        let mut tick = Tick {
            incoming: Vec::new(),
            dropped: Vec::new(),
            ok: true,
        };

        for connection in &mut self.connections {
            connection.reset_send();
        }
        for (role, payload) in outgoing {
            let dropped = self.enqueue(role, payload);
            tick.dropped.extend(dropped.into_iter().map(|payload| (role, payload)));
        }

        if let Err(e) = self.maintain() {
            log::debug!("Link setup failed: {}", e);
            tick.ok = false;
        }

        if let Err(e) = self.poll(timeout_ms) {
            log::error!("{}", e);
            tick.ok = false;
        }

        for connection in &mut self.connections {
            if connection.recv_state() != LinkState::Ready {
                continue;
            }
            if matches!(connection.attempt_receive(), Attempt::Completed(_)) {
                if let Some(payload) = connection.take_inbound() {
                    tick.incoming.push(Inbound {
                        role: connection.peer(),
                        payload,
                    });
                }
            }
        }

        for index in 0..self.connections.len() {
            if self.connections[index].send_state() != LinkState::Ready {
                continue;
            }
            if !self.connections[index].is_sending() && self.has_outbound(index) {
                let role = self.connections[index].peer();
                if let Some(payload) = self.outbox.get_mut(&role).and_then(VecDeque::pop_front) {
                    if let Err(e) = self.connections[index].begin_send(&payload) {
                        log::error!("Dropping payload for {}: {}", role, e);
                        tick.dropped.push((role, payload));
                        continue;
                    }
                }
            }
            if self.connections[index].is_sending() {
                self.connections[index].attempt_send();
            }
        }

        self.prune();

        let missing = self.missing_peers();
        if !missing.is_empty() {
            tick.ok = false;
        }
        if missing.is_empty() == self.links_down {
            self.links_down = !missing.is_empty();
            if self.links_down {
                log::warn!("Waiting for mandatory links: {:?}", missing);
            } else {
                log::info!("All mandatory links established");
            }
        }
        tick
    }

    /// Drops every connection whose receive or send side failed or was closed by the peer.
    fn prune(&mut self) {
        self.connections.retain(|connection| {
            if !connection.is_dead() {
                return true;
            }
            let closed_by_peer = connection.recv_state() == LinkState::PeerClosed
                || connection.send_state() == LinkState::PeerClosed;
            if closed_by_peer {
                log::info!("The {} peer closed its link", connection.peer());
            } else {
                log::warn!("Dropping failed link to the {} peer", connection.peer());
                if let Err(e) = connection.close() {
                    log::debug!("Closing the {} link: {}", connection.peer(), e);
                }
            }
            false
        });
    }

    /// Closes every connection and listener.
    ///
    /// A connection that fails to close is reported but does not keep the others open.
    pub fn shutdown(&mut self) -> Result<(), TransportError> {
        let mut failed = 0;
        for connection in self.connections.drain(..) {
            if let Err(e) = connection.close() {
                log::error!("Could not close the {} link: {}", connection.peer(), e);
                failed += 1;
            }
        }
        for listener in self.listeners.drain(..) {
            log::debug!("Closing the {} listener", listener.role);
        }
        self.pending = None;
        self.outbox.clear();
        if failed > 0 {
            Err(TransportError::Shutdown { failed })
        } else {
            Ok(())
        }
    }
}

/// Opens a non-blocking socket and starts connecting it to `addr`.
fn begin_connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let stream = TcpStream::from(socket(family, SockType::Stream, SockFlag::empty(), None)?);
    stream.set_nonblocking(true)?;
    match connect(stream.as_raw_fd(), &SockaddrStorage::from(addr)) {
        Ok(()) | Err(Errno::EINPROGRESS) => Ok(stream),
        Err(e) => Err(e.into()),
    }
}

fn poll_timeout(timeout_ms: i32) -> PollTimeout {
    if timeout_ms < 0 {
        PollTimeout::NONE
    } else {
        PollTimeout::from(u16::try_from(timeout_ms).unwrap_or(u16::MAX))
    }
}
