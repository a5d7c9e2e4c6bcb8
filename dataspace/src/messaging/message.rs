//! Messages exchanged between peers for query/reply.

use crate::id::{CorrelationId, PeerId};
use crate::query::{QueryTarget, QueryableKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Point in time attached to a value by the peer that produced it.
///
/// Ordered by time first, then by peer id, so two timestamps from different
/// peers never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    /// Nanoseconds since the Unix epoch.
    pub time: u64,
    pub id: PeerId,
}

impl Timestamp {
    pub fn new(time: u64, id: PeerId) -> Self {
        Self { time, id }
    }

    /// Timestamp for the current wall-clock time.
    pub fn now(id: PeerId) -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self { time, id }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.time, self.id)
    }
}

/// Metadata carried alongside a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataInfo {
    pub timestamp: Option<Timestamp>,
    /// Free-form encoding label (e.g. `text/plain`).
    pub encoding: Option<String>,
}

impl DataInfo {
    /// Neither a timestamp nor an encoding is set.
    pub fn is_empty(&self) -> bool {
        self.timestamp.is_none() && self.encoding.is_none()
    }
}

/// A value produced by a queryable in answer to a query.
///
/// # Example
///
/// ```rust,ignore
/// query.reply(
///     Sample::new("/demo/example/item", b"42".to_vec())
///         .with_timestamp(Timestamp::now(peer_id))
///         .with_encoding("text/plain"),
/// )?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub res_name: String,
    pub payload: Vec<u8>,
    pub data_info: Option<DataInfo>,
}

impl Sample {
    pub fn new(res_name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            res_name: res_name.into(),
            payload: payload.into(),
            data_info: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.data_info.get_or_insert_with(DataInfo::default).timestamp = Some(timestamp);
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.data_info.get_or_insert_with(DataInfo::default).encoding = Some(encoding.into());
        self
    }
}

/// A reply delivered to the querier's handler.
///
/// # Invariants
///
/// - `correlation_id` is the id of the query being answered
/// - `res_name` matches the query's selector (others are dropped on receipt)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub correlation_id: CorrelationId,
    pub res_name: String,
    pub payload: Vec<u8>,
    pub data_info: Option<DataInfo>,
    /// Kind of the queryable that produced this reply.
    pub source_kind: QueryableKind,
    pub replier: PeerId,
}

impl Reply {
    /// Build the reply carrying `sample` for a query.
    pub fn from_sample(
        correlation_id: CorrelationId,
        sample: Sample,
        source_kind: QueryableKind,
        replier: PeerId,
    ) -> Self {
        Self {
            correlation_id,
            res_name: sample.res_name,
            payload: sample.payload,
            // An empty `DataInfo` is carried as `None` so every codec agrees.
            data_info: sample.data_info.filter(|info| !info.is_empty()),
            source_kind,
            replier,
        }
    }

    /// Timestamp of the value, if the replier attached one.
    pub fn timestamp(&self) -> Option<&Timestamp> {
        self.data_info.as_ref().and_then(|info| info.timestamp.as_ref())
    }

    /// Payload decoded as UTF-8, lossily.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A query forwarded to a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMessage {
    pub correlation_id: CorrelationId,
    /// Session that issued the query.
    pub origin: PeerId,
    /// Resolved selector key.
    pub selector: String,
    pub predicate: String,
    pub target: QueryTarget,
}

/// Unit of communication between peers.
///
/// # State Transitions
///
/// ```text
/// Query → Reply* → ReplyFinal   (same correlation_id, per replying peer)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Query(QueryMessage),
    Reply(Reply),
    /// The sending peer has no more replies for this query.
    ReplyFinal { correlation_id: CorrelationId },
}

impl Message {
    /// Correlation id carried by every variant.
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            Message::Query(query) => query.correlation_id,
            Message::Reply(reply) => reply.correlation_id,
            Message::ReplyFinal { correlation_id } => *correlation_id,
        }
    }
}
