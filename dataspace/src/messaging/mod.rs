//! Peer messages and their wire encoding.

pub mod codec;
pub mod message;

// Re-exports
pub use codec::{BinaryCodec, Codec, JsonCodec, MAX_MESSAGE_SIZE};
pub use message::{DataInfo, Message, QueryMessage, Reply, Sample, Timestamp};
