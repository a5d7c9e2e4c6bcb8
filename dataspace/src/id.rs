//! Core identifier types for peers, queries, resources and queryables.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a peer identifier.
const MAX_PEER_ID_LEN: usize = 64;

/// Identifies a session (a peer) in the data space.
///
/// # Validation Rules
///
/// - Must be non-empty and at most 64 characters
/// - Must not contain whitespace
/// - Must be unique among connected peers
///
/// Generated from a random UUID when the configuration does not pin one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Create a PeerId from a string.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidPeerId` if the id is empty, too long or
    /// contains whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self, ConfigError> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_PEER_ID_LEN || id.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidPeerId(id));
        }
        Ok(Self(id))
    }

    /// Generate a fresh random PeerId.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Get the raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PeerId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier linking a query to its asynchronous replies.
///
/// # Invariants
///
/// - Issued by a monotonically increasing per-session counter starting at 1
/// - Never reused for the lifetime of the issuing session
/// - A reply carries the CorrelationId of the query it answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    /// Create a new CorrelationId.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric alias for a resource path, bound by `Session::declare_resource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub u64);

impl ResourceId {
    /// Create a new ResourceId.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle of a queryable declared on a session.
///
/// Ordered by declaration: a smaller id was declared earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryableId(pub u64);

impl QueryableId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queryable-{}", self.0)
    }
}
