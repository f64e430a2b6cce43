pub mod peer_registry;

use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::trace;

/// The peer name that is aliased to the local node's own id. See [peer_registry::PeerRegistry].
pub const LOCALHOST_PEER_NAME: &str = "localhost";

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("failed to decode peer from its string representation: expected '{delimiter}' delimiter: {descriptor}")]
    MissingDelimiter {
        delimiter: char,
        descriptor: String,
    },
    #[error("failed to decode peer from its string representation: invalid port: {descriptor}")]
    InvalidPort {
        descriptor: String,
        source: std::num::ParseIntError,
    },
    #[error("duplicate peer name: {0}")]
    DuplicateName(String),
    #[error("failed to generate a random peer id: {0}")]
    RandomId(String),
    #[error("failed to resolve peer ip4 address: {host}: {source}")]
    Resolve {
        host: String,
        source: std::io::Error,
    },
    #[error("failed to resolve peer ip4 address: no ip4 found: {0}")]
    NoIp4Address(String),
}
impl PeerError {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerError::MissingDelimiter { .. } => "peer_descriptor",
            PeerError::InvalidPort { .. } => "peer_descriptor",
            PeerError::DuplicateName(_) => "peer_duplicate_name",
            PeerError::RandomId(_) => "peer_random_id",
            PeerError::Resolve { .. } => "address_resolution",
            PeerError::NoIp4Address(_) => "address_resolution",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum PeerAddr {
    /// literal IP, resolved once when the peer is parsed
    Resolved(SocketAddr),
    /// DNS name, resolved whenever a probe is sent so that changing records are picked up
    Host {
        host: String,
        port: u16,
    },
}

/// A remote node to measure latency against, configured as `name=host:port`.
pub struct Peer {
    name: String,
    addr: PeerAddr,
    sequence: AtomicU64,
}

impl Debug for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.addr {
            PeerAddr::Resolved(addr) => write!(f, "Peer{{{}={}}}", self.name, addr),
            PeerAddr::Host { host, port } => write!(f, "Peer{{{}={}:{}}}", self.name, host, port),
        }
    }
}

impl FromStr for Peer {
    type Err = PeerError;

    fn from_str(descriptor: &str) -> Result<Self, Self::Err> {
        let (name, host_port) = split_once_exactly(descriptor, '=')
            .ok_or_else(|| PeerError::MissingDelimiter { delimiter: '=', descriptor: descriptor.to_string() })?;
        let (host, port) = split_once_exactly(host_port, ':')
            .ok_or_else(|| PeerError::MissingDelimiter { delimiter: ':', descriptor: descriptor.to_string() })?;

        let port = port.parse::<u16>()
            .map_err(|source| PeerError::InvalidPort { descriptor: descriptor.to_string(), source })?;

        let addr = match host.parse::<IpAddr>() {
            Ok(ip) => PeerAddr::Resolved(SocketAddr::new(ip, port)),
            Err(_) => PeerAddr::Host { host: host.to_string(), port },
        };

        Ok(Peer {
            name: name.to_string(),
            addr,
            sequence: AtomicU64::new(0),
        })
    }
}

fn split_once_exactly(s: &str, delimiter: char) -> Option<(&str, &str)> {
    let (a, b) = s.split_once(delimiter)?;
    if b.contains(delimiter) {
        return None;
    }
    Some((a, b))
}

impl Peer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_localhost(&self) -> bool {
        self.name == LOCALHOST_PEER_NAME
    }

    /// Returns the current sequence number and advances it.
    ///
    /// NB: Probes are sent from a single task, so there is no contention - the atomic is just a
    ///      way to advance the counter through a shared reference
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// The peer's address if it was configured as a literal IP
    pub fn resolved_addr(&self) -> Option<SocketAddr> {
        match &self.addr {
            PeerAddr::Resolved(addr) => Some(*addr),
            PeerAddr::Host { .. } => None,
        }
    }

    /// The address to send the next probe to: either the literal IP address, or the host name's
    ///  first IPv4 address
    pub async fn udp_addr(&self) -> Result<SocketAddr, PeerError> {
        let (host, port) = match &self.addr {
            PeerAddr::Resolved(addr) => return Ok(*addr),
            PeerAddr::Host { host, port } => (host, *port),
        };

        let addrs = tokio::net::lookup_host((host.as_str(), port)).await
            .map_err(|source| PeerError::Resolve { host: host.clone(), source })?;

        for addr in addrs {
            if addr.is_ipv4() {
                trace!(peer = %self.name, ?addr, "resolved peer address");
                return Ok(addr);
            }
        }
        Err(PeerError::NoIp4Address(host.clone()))
    }
}
