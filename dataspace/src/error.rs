//! Error types for the dataspace query/reply system.

use crate::id::{PeerId, QueryableId, ResourceId};
use thiserror::Error;

/// Errors returned synchronously by [`Session`](crate::Session) operations.
///
/// Reply-path failures (handler errors, undecodable frames, late replies)
/// never surface here: they are logged and isolated per query.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Session configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Selector could not be parsed or resolved.
    #[error("Invalid selector: {0}")]
    InvalidSelector(#[from] SelectorError),

    /// The session has been closed.
    #[error("Session is closed")]
    SessionClosed,

    /// The correlation id counter wrapped. Indicates a session that is never closed.
    #[error("Correlation id space exhausted")]
    CorrelationIdsExhausted,

    /// No queryable with this id is declared on the session.
    #[error("Unknown queryable: {0}")]
    UnknownQueryable(QueryableId),

    /// No resource is bound to this id.
    #[error("Unknown resource id: {0}")]
    UnknownResource(ResourceId),

    /// Transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Encoding or decoding failure.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors related to session configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Unknown session mode.
    #[error("Invalid mode '{0}' (expected 'peer' or 'client')")]
    InvalidMode(String),

    /// Locator could not be parsed.
    #[error("Invalid locator '{0}' (expected 'tcp/<host>:<port>' or 'mem/<name>')")]
    InvalidLocator(String),

    /// Locators of different schemes in one configuration.
    #[error("Locators mix schemes '{first}' and '{second}'")]
    MixedSchemes { first: String, second: String },

    /// Client mode needs a peer to connect to.
    #[error("Client mode requires at least one peer locator")]
    ClientWithoutPeers,

    /// Client mode cannot accept connections.
    #[error("Client mode cannot listen")]
    ClientWithListeners,

    /// Query timeout must be positive.
    #[error("Query timeout must be greater than zero")]
    ZeroTimeout,

    /// Peer identifier is malformed.
    #[error("Invalid peer id '{0}'")]
    InvalidPeerId(String),

    /// Configuration document could not be parsed.
    #[error("Configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Configuration file could not be read.
    #[error("Configuration I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to selectors and resource keys.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    /// Empty resource key.
    #[error("Selector key is empty")]
    Empty,

    /// A `/`-separated segment is empty (e.g. `a//b` or a trailing `/`).
    #[error("Empty segment in key '{0}'")]
    EmptySegment(String),

    /// A segment mixes `*` with other characters.
    #[error("Invalid wildcard segment '{segment}' in key '{key}'")]
    InvalidWildcard { key: String, segment: String },

    /// A numeric resource id is not bound to any path.
    #[error("Unresolved resource key '{0}'")]
    UnresolvedKey(String),

    #[error("Key has {segments} segments (max: {max})")]
    TooManySegments { segments: usize, max: usize },
}

/// Errors related to message encoding and decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON serialization failed.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary decoding failed.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Message exceeds maximum size.
    #[error("Message too large: {size} bytes (max: {max} bytes)")]
    MessageTooLarge { size: usize, max: usize },

    /// Buffer ended before the message did.
    #[error("Truncated message: {0}")]
    Truncated(std::io::Error),
}

// Manual From implementation for io::Error to avoid conflict with serde_json::Error
impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        CodecError::Truncated(err)
    }
}

/// Errors related to the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport has been closed.
    #[error("Transport closed")]
    Closed,

    /// No link to this peer.
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// Another endpoint already listens on this locator.
    #[error("Locator already in use: {0}")]
    AddressInUse(String),

    /// Could not reach a configured peer.
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    /// Handshake with a remote peer failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A peer with this id is already attached.
    #[error("Duplicate peer id: {0}")]
    DuplicatePeer(PeerId),

    /// Frame exceeds maximum size.
    #[error("Frame too large: {size} bytes (max: {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    /// Network I/O error.
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error returned by a reply handler.
///
/// Handlers report failures with this type; the aggregator logs it and keeps
/// delivering to every other pending query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    /// Create a handler error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}
