//! # Slow Control Transport
//!
//! Poll-driven transport that links the processes of the slow control network and
//! relays framed payloads between them.
//!
//! ## Architecture
//!
//! - **[`connection::Connection`]**: one non-blocking TCP stream to a peer of a known
//!   [`Role`](slowctl_protocol::Role). Receive and send progress are tracked by two
//!   independent state machines, so a frame can be half read while another is half written.
//! - **[`transport::TransportContext`]**: all connections of one process plus, for the
//!   coordinator, one listener per peer role. Each [`tick`](transport::TransportContext::tick)
//!   re-establishes missing links, polls every socket once, completes reads and writes
//!   that are ready and drops dead connections.
//!
//! ## Topology
//!
//! The coordinator listens on three ports, one per peer role. Control, module and
//! interface processes connect to the coordinator and keep exactly one link to it.
//!
//! ```ignore
//! use slowctl_net::transport::Builder;
//! use slowctl_protocol::Role;
//!
//! let mut transport = Builder::new(Role::InterfaceNode).host("daq-server").build();
//! transport.establish()?;
//! loop {
//!     let tick = transport.tick(outgoing.drain(..), 100);
//!     for inbound in tick.incoming {
//!         // decode inbound.payload
//!     }
//! }
//! ```
//!
//! ## Error Handling
//!
//! Transport faults never stop a loop. A connection that fails or is closed by its peer
//! is dropped at the end of the tick and a mandatory link is retried on the next one.
//! [`transport::Tick::ok`] reports whether every mandatory link was up.
//!
//! ## Logging
//!
//! This crate uses the `log` crate. Link changes are logged at `info`, faults at
//! `warn`/`error` and payload bytes at `trace`.
//!
//! ## Thread Model
//!
//! A context is driven by a single thread. The readiness poll inside `tick` is the only
//! operation that may block, bounded by the timeout passed in.
pub mod connection;
pub mod error;
pub mod transport;

pub use error::TransportError;
pub use transport::{Builder, Config, Inbound, Tick, TransportContext};
