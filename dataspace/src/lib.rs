//! # Dataspace
//!
//! Distributed query/reply over a peer-to-peer data space.
//!
//! A [`Session`] issues queries on resource selectors such as
//! `/demo/example/**`. Every queryable whose key intersects the selector,
//! on this session or on a connected peer, answers asynchronously; replies
//! are correlated to their query and handed to the caller's handler until
//! every replier is done or the query times out.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Session                              │
//! │   open / query / declare_queryable / close                   │
//! ├───────────────┬───────────────────┬──────────────────────────┤
//! │  Dispatcher   │  Reply Aggregator │  Queryables              │
//! │  • selector   │  • pending table  │  • registry              │
//! │  • fan-out    │  • handler calls  │  • Query / reply         │
//! │  • corr. ids  │  • timer queue    │                          │
//! ├───────────────┴───────────────────┴──────────────────────────┤
//! │  Key matcher (`*`, `**`)   │   Codec (binary, JSON)          │
//! ├────────────────────────────┴─────────────────────────────────┤
//! │  Transport: mem/<name> links, tcp/<host>:<port> streams      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use dataspace::{query, SessionConfig};
//!
//! dataspace::logging::init_logger();
//! let session = dataspace::open(SessionConfig::default()).await?;
//!
//! session.query("/demo/example/**", "", query::from_fn(|reply| {
//!     println!(">> [Reply handler] received ('{}': '{}')", reply.res_name, reply.payload_str());
//!     Ok(())
//! }))?;
//!
//! tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//! session.close();
//! ```

pub mod config;
pub mod error;
pub mod id;
pub mod key;
pub mod logging;
pub mod messaging;
pub mod query;
pub mod queryable;
pub mod selector;
pub mod session;
pub mod transport;

// Re-exports
pub use config::{SessionConfig, SessionConfigBuilder, WhatAmI};
pub use error::{CodecError, ConfigError, HandlerError, SelectorError, SessionError, TransportError};
pub use id::{CorrelationId, PeerId, QueryableId, ResourceId};
pub use key::ResourceKey;
pub use messaging::{DataInfo, Reply, Sample, Timestamp};
pub use query::{
    QueryConsolidation, QueryEvent, QueryOptions, QueryOutcome, QueryTarget, QueryableKind,
    ReplyHandler, Target,
};
pub use queryable::{Query, QueryHandler};
pub use selector::Selector;
pub use session::Session;

/// Open a session. See [`Session::open`].
pub async fn open(config: SessionConfig) -> Result<Session, SessionError> {
    Session::open(config).await
}
