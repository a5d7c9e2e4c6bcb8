//! Session configuration.
//!
//! # Example
//!
//! ```rust,ignore
//! // Peer listening for others on a TCP port
//! let config = SessionConfig::builder()
//!     .mode(WhatAmI::Peer)
//!     .listener("tcp/0.0.0.0:7447")
//!     .query_timeout(Duration::from_secs(2))
//!     .build()?;
//!
//! // Client attached to a known peer, from JSON
//! let config = SessionConfig::from_json(r#"{
//!     "mode": "client",
//!     "peers": ["tcp/10.0.0.1:7447"]
//! }"#)?;
//! ```

use crate::error::ConfigError;
use crate::id::PeerId;
use crate::transport::Locator;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default deadline of a query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Role of a session in the data space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhatAmI {
    /// Full participant: may listen and connect.
    #[default]
    Peer,
    /// Attaches to one or more peers; does not listen.
    Client,
}

impl FromStr for WhatAmI {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "peer" => Ok(WhatAmI::Peer),
            "client" => Ok(WhatAmI::Client),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for WhatAmI {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WhatAmI::Peer => write!(f, "peer"),
            WhatAmI::Client => write!(f, "client"),
        }
    }
}

/// Configuration of a [`Session`](crate::Session).
///
/// # Validation Rules
///
/// - Every locator parses as `tcp/<host>:<port>` or `mem/<name>`
/// - All locators share one scheme
/// - Client mode has at least one peer and no listener
/// - The query timeout is greater than zero
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(default = "PeerId::random")]
    id: PeerId,
    #[serde(default)]
    mode: WhatAmI,
    #[serde(default)]
    peers: Vec<String>,
    #[serde(default)]
    listeners: Vec<String>,
    #[serde(default = "default_query_timeout", rename = "query_timeout_ms", with = "millis")]
    query_timeout: Duration,
}

fn default_query_timeout() -> Duration {
    DEFAULT_QUERY_TIMEOUT
}

impl SessionConfig {
    /// Start building a configuration.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Parse and validate a JSON document.
    ///
    /// Missing fields take their defaults; a random id is generated when
    /// none is given.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn mode(&self) -> WhatAmI {
        self.mode
    }

    /// Locators of peers to connect to at open.
    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Locators to accept connections on.
    pub fn listeners(&self) -> &[String] {
        &self.listeners
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Check the validation rules.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.query_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        let mut first: Option<Locator> = None;
        for raw in self.listeners.iter().chain(self.peers.iter()) {
            let locator: Locator = raw.parse()?;
            match &first {
                Some(seen) if seen.scheme() != locator.scheme() => {
                    return Err(ConfigError::MixedSchemes {
                        first: seen.scheme().to_string(),
                        second: locator.scheme().to_string(),
                    });
                }
                Some(_) => {}
                None => first = Some(locator),
            }
        }

        if self.mode == WhatAmI::Client {
            if self.peers.is_empty() {
                return Err(ConfigError::ClientWithoutPeers);
            }
            if !self.listeners.is_empty() {
                return Err(ConfigError::ClientWithListeners);
            }
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    /// An isolated peer with a random id.
    fn default() -> Self {
        Self {
            id: PeerId::random(),
            mode: WhatAmI::Peer,
            peers: Vec::new(),
            listeners: Vec::new(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    id: Option<PeerId>,
    mode: WhatAmI,
    peers: Vec<String>,
    listeners: Vec<String>,
    query_timeout: Option<Duration>,
}

impl SessionConfigBuilder {
    /// Pin the session id instead of generating one.
    pub fn id(mut self, id: PeerId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn mode(mut self, mode: WhatAmI) -> Self {
        self.mode = mode;
        self
    }

    /// Add a peer locator to connect to.
    pub fn peer(mut self, locator: impl Into<String>) -> Self {
        self.peers.push(locator.into());
        self
    }

    /// Add a locator to listen on.
    pub fn listener(mut self, locator: impl Into<String>) -> Self {
        self.listeners.push(locator.into());
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let config = SessionConfig {
            id: self.id.unwrap_or_else(PeerId::random),
            mode: self.mode,
            peers: self.peers,
            listeners: self.listeners,
            query_timeout: self.query_timeout.unwrap_or(DEFAULT_QUERY_TIMEOUT),
        };
        config.validate()?;
        Ok(config)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.mode(), WhatAmI::Peer);
        assert!(config.peers().is_empty());
        assert_eq!(config.query_timeout(), DEFAULT_QUERY_TIMEOUT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("peer".parse::<WhatAmI>().unwrap(), WhatAmI::Peer);
        assert_eq!("client".parse::<WhatAmI>().unwrap(), WhatAmI::Client);
        assert!(matches!(
            "router".parse::<WhatAmI>(),
            Err(ConfigError::InvalidMode(mode)) if mode == "router"
        ));
    }

    #[test]
    fn test_builder() {
        let id = PeerId::new("node-1").unwrap();
        let config = SessionConfig::builder()
            .id(id.clone())
            .listener("tcp/127.0.0.1:0")
            .peer("tcp/127.0.0.1:7447")
            .query_timeout(Duration::from_millis(250))
            .build()
            .unwrap();

        assert_eq!(config.id(), &id);
        assert_eq!(config.listeners(), ["tcp/127.0.0.1:0".to_string()]);
        assert_eq!(config.peers(), ["tcp/127.0.0.1:7447".to_string()]);
        assert_eq!(config.query_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(
            SessionConfig::builder().peer("udp/1.2.3.4:5").build(),
            Err(ConfigError::InvalidLocator(_))
        ));
        assert!(matches!(
            SessionConfig::builder().listener("mem/a").peer("tcp/h:1").build(),
            Err(ConfigError::MixedSchemes { .. })
        ));
        assert!(matches!(
            SessionConfig::builder().mode(WhatAmI::Client).build(),
            Err(ConfigError::ClientWithoutPeers)
        ));
        assert!(matches!(
            SessionConfig::builder()
                .mode(WhatAmI::Client)
                .peer("mem/a")
                .listener("mem/b")
                .build(),
            Err(ConfigError::ClientWithListeners)
        ));
        assert!(matches!(
            SessionConfig::builder().query_timeout(Duration::ZERO).build(),
            Err(ConfigError::ZeroTimeout)
        ));
    }

    #[test]
    fn test_from_json() {
        let config = SessionConfig::from_json(
            r#"{"id": "json-peer", "mode": "client", "peers": ["mem/hub"], "query_timeout_ms": 1500}"#,
        )
        .unwrap();
        assert_eq!(config.id().as_str(), "json-peer");
        assert_eq!(config.mode(), WhatAmI::Client);
        assert_eq!(config.query_timeout(), Duration::from_millis(1500));

        let defaults = SessionConfig::from_json("{}").unwrap();
        assert_eq!(defaults.query_timeout(), DEFAULT_QUERY_TIMEOUT);
        assert_eq!(defaults.id().as_str().len(), 32);
    }

    #[test]
    fn test_from_json_errors() {
        assert!(matches!(
            SessionConfig::from_json(r#"{"mode": "router"}"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            SessionConfig::from_json(r#"{"mode": "client"}"#),
            Err(ConfigError::ClientWithoutPeers)
        ));
        assert!(matches!(
            SessionConfig::from_json(r#"{"unknown": 1}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file_missing() {
        assert!(matches!(
            SessionConfig::from_file("/nonexistent/dataspace.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
