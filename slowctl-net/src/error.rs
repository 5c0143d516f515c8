use std::{io, net::SocketAddr};

use slowctl_protocol::Role;
use thiserror::Error;

/// Errors raised while setting up or tearing down links.
///
/// None of these are fatal to a running loop: a failed link is retried on the next tick.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Could not listen for {role} peers on {addr}: {source}")]
    Bind {
        role: Role,
        addr: SocketAddr,
        source: io::Error,
    },
    #[error("Could not resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },
    #[error("Could not connect to the coordinator at {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("Readiness poll failed: {0}")]
    Poll(#[from] io::Error),
    #[error("{failed} connection(s) did not close cleanly")]
    Shutdown { failed: usize },
}
