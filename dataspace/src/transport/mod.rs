//! Transport contract between a session and its peers.
//!
//! A transport moves opaque frames between peers: the session encodes and
//! decodes them through a [`Codec`](crate::messaging::Codec). Two
//! implementations are provided:
//!
//! - [`memory`]: in-process links, addressed by `mem/<name>` locators
//! - [`tcp`]: length-prefixed frames over TCP, addressed by `tcp/<host>:<port>`

pub mod memory;
pub mod tcp;

use crate::config::SessionConfig;
use crate::error::{ConfigError, TransportError};
use crate::id::PeerId;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;

// Re-exports
pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

/// A frame received from a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub from: PeerId,
    pub bytes: Vec<u8>,
}

/// What a transport reports to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(InboundFrame),
    /// The link to a peer went down; nothing more arrives from it.
    Disconnected(PeerId),
}

/// Outbound half of a transport.
///
/// Frames sent to one peer are delivered in order. `send` only enqueues: it
/// never waits for the network.
pub trait Transport: Send + Sync {
    /// Identity announced to peers.
    fn local_id(&self) -> &PeerId;

    /// Currently connected peers.
    fn peers(&self) -> Vec<PeerId>;

    /// Enqueue a frame for `peer`.
    ///
    /// # Errors
    ///
    /// - `TransportError::Closed` after [`close`](Self::close)
    /// - `TransportError::UnknownPeer` if no link to `peer` exists
    fn send(&self, peer: &PeerId, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Release every link. Idempotent.
    fn close(&self);

    /// Locators this transport accepts connections on, as bound.
    fn locators(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A transport plus the stream of frames and link losses it reports.
///
/// A [`LinkEvent::Disconnected`] for a peer follows every frame received
/// from that peer.
pub struct Link {
    pub transport: Arc<dyn Transport>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Parsed locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    /// `tcp/<host>:<port>`
    Tcp(String),
    /// `mem/<name>`
    Memory(String),
}

impl Locator {
    pub fn scheme(&self) -> &'static str {
        match self {
            Locator::Tcp(_) => "tcp",
            Locator::Memory(_) => "mem",
        }
    }

    /// Address part, without the scheme.
    pub fn address(&self) -> &str {
        match self {
            Locator::Tcp(addr) | Locator::Memory(addr) => addr,
        }
    }
}

impl FromStr for Locator {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidLocator(s.to_string());
        let (scheme, address) = s.split_once('/').ok_or_else(invalid)?;
        if address.is_empty() {
            return Err(invalid());
        }

        match scheme {
            "tcp" => {
                let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
                if host.is_empty() || port.parse::<u16>().is_err() {
                    return Err(invalid());
                }
                Ok(Locator::Tcp(address.to_string()))
            }
            "mem" => Ok(Locator::Memory(address.to_string())),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scheme(), self.address())
    }
}

/// Open the transport described by a validated configuration.
///
/// - no locators: an isolated in-memory endpoint with no peers
/// - `mem/` locators: links on the process-wide [`MemoryNetwork`]
/// - `tcp/` locators: a [`TcpTransport`]
pub async fn connect(config: &SessionConfig) -> Result<Link, TransportError> {
    let listeners = parse_all(config.listeners())?;
    let peers = parse_all(config.peers())?;
    let id = config.id().clone();

    let scheme = listeners.iter().chain(peers.iter()).map(Locator::scheme).next();
    match scheme {
        Some("tcp") => TcpTransport::open(id, &addresses(&listeners), &addresses(&peers)).await,
        _ => MemoryNetwork::global().join(id, &addresses(&listeners), &addresses(&peers)),
    }
}

fn addresses(locators: &[Locator]) -> Vec<String> {
    locators.iter().map(|l| l.address().to_string()).collect()
}

fn parse_all(locators: &[String]) -> Result<Vec<Locator>, TransportError> {
    locators
        .iter()
        .map(|raw| {
            raw.parse::<Locator>()
                .map_err(|_| TransportError::Unreachable(raw.clone()))
        })
        .collect()
}
