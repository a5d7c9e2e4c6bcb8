//! Wire codecs for peer messages.
//!
//! The session encodes every outbound [`Message`] and decodes every inbound
//! frame through a [`Codec`]. Two implementations are provided:
//!
//! - [`BinaryCodec`]: compact little-endian layout (default)
//! - [`JsonCodec`]: `serde_json`, handy when inspecting traffic

use crate::error::CodecError;
use crate::id::{CorrelationId, PeerId};
use crate::messaging::message::{DataInfo, Message, QueryMessage, Reply, Timestamp};
use crate::query::{QueryTarget, QueryableKind, Target};
use std::io::{Cursor, Read, Write};

/// Maximum message size: 1MB
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Encodes and decodes peer messages.
///
/// A reply whose `data_info` is `Some` but empty may decode as `None`.
/// Replies built with [`Reply::from_sample`] never carry an empty one.
pub trait Codec: Send + Sync + 'static {
    /// Encode a message into a frame.
    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError>;

    /// Decode a frame into a message.
    fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError>;
}

/// Compact binary wire format.
///
/// # Binary Format
///
/// ```text
/// [message_type: 1 byte]           // Query=1, Reply=2, ReplyFinal=3
/// [correlation_id: 8 bytes (u64)]
///
/// Query:
///   [origin: str] [selector: str] [predicate: str]
///   [kinds: 8 bytes (u64)]
///   [target: 1 byte]               // BestMatching=0, All=1, AllComplete=2, Complete=3
///   [complete_n: 8 bytes (u64)]    // only for Complete
///
/// Reply:
///   [res_name: str]
///   [payload_len: 4 bytes (u32)] [payload: N bytes]
///   [info_flags: 1 byte]           // bit 0: timestamp, bit 1: encoding
///   [ts_time: 8 bytes] [ts_id: str]  // if bit 0
///   [encoding: str]                  // if bit 1
///   [source_kind: 8 bytes (u64)]
///   [replier: str]
///
/// str = [len: 4 bytes (u32)] [UTF-8 bytes]
/// ```
///
/// All integers are little-endian. Trailing bytes after a complete message
/// are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

const TYPE_QUERY: u8 = 1;
const TYPE_REPLY: u8 = 2;
const TYPE_REPLY_FINAL: u8 = 3;

const TARGET_BEST_MATCHING: u8 = 0;
const TARGET_ALL: u8 = 1;
const TARGET_ALL_COMPLETE: u8 = 2;
const TARGET_COMPLETE: u8 = 3;

const INFO_TIMESTAMP: u8 = 1 << 0;
const INFO_ENCODING: u8 = 1 << 1;

impl Codec for BinaryCodec {
    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let mut buffer = Vec::with_capacity(128);

        match message {
            Message::Query(query) => {
                buffer.write_all(&[TYPE_QUERY])?;
                buffer.write_all(&query.correlation_id.as_u64().to_le_bytes())?;
                write_string(&mut buffer, query.origin.as_str())?;
                write_string(&mut buffer, &query.selector)?;
                write_string(&mut buffer, &query.predicate)?;
                buffer.write_all(&query.target.kinds.bits().to_le_bytes())?;
                match query.target.target {
                    Target::BestMatching => buffer.write_all(&[TARGET_BEST_MATCHING])?,
                    Target::All => buffer.write_all(&[TARGET_ALL])?,
                    Target::AllComplete => buffer.write_all(&[TARGET_ALL_COMPLETE])?,
                    Target::Complete(n) => {
                        buffer.write_all(&[TARGET_COMPLETE])?;
                        buffer.write_all(&n.to_le_bytes())?;
                    }
                }
            }
            Message::Reply(reply) => {
                buffer.write_all(&[TYPE_REPLY])?;
                buffer.write_all(&reply.correlation_id.as_u64().to_le_bytes())?;
                write_string(&mut buffer, &reply.res_name)?;
                write_bytes(&mut buffer, &reply.payload)?;

                let info = reply.data_info.clone().unwrap_or_default();
                let mut flags = 0u8;
                if info.timestamp.is_some() {
                    flags |= INFO_TIMESTAMP;
                }
                if info.encoding.is_some() {
                    flags |= INFO_ENCODING;
                }
                buffer.write_all(&[flags])?;
                if let Some(ts) = &info.timestamp {
                    buffer.write_all(&ts.time.to_le_bytes())?;
                    write_string(&mut buffer, ts.id.as_str())?;
                }
                if let Some(encoding) = &info.encoding {
                    write_string(&mut buffer, encoding)?;
                }

                buffer.write_all(&reply.source_kind.bits().to_le_bytes())?;
                write_string(&mut buffer, reply.replier.as_str())?;
            }
            Message::ReplyFinal { correlation_id } => {
                buffer.write_all(&[TYPE_REPLY_FINAL])?;
                buffer.write_all(&correlation_id.as_u64().to_le_bytes())?;
            }
        }

        if buffer.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: buffer.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(buffer)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut cursor = Cursor::new(bytes);
        let msg_type = read_u8(&mut cursor)?;
        let correlation_id = CorrelationId::new(read_u64(&mut cursor)?);

        let message = match msg_type {
            TYPE_QUERY => {
                let origin = read_peer_id(&mut cursor)?;
                let selector = read_string(&mut cursor)?;
                let predicate = read_string(&mut cursor)?;
                let kinds = QueryableKind::from_bits_truncate(read_u64(&mut cursor)?);
                let target = match read_u8(&mut cursor)? {
                    TARGET_BEST_MATCHING => Target::BestMatching,
                    TARGET_ALL => Target::All,
                    TARGET_ALL_COMPLETE => Target::AllComplete,
                    TARGET_COMPLETE => Target::Complete(read_u64(&mut cursor)?),
                    other => {
                        return Err(CodecError::DeserializationFailed(format!(
                            "Invalid target: {}",
                            other
                        )))
                    }
                };
                Message::Query(QueryMessage {
                    correlation_id,
                    origin,
                    selector,
                    predicate,
                    target: QueryTarget::new(kinds, target),
                })
            }
            TYPE_REPLY => {
                let res_name = read_string(&mut cursor)?;
                let payload = read_bytes(&mut cursor)?;

                let flags = read_u8(&mut cursor)?;
                let timestamp = if flags & INFO_TIMESTAMP != 0 {
                    let time = read_u64(&mut cursor)?;
                    Some(Timestamp::new(time, read_peer_id(&mut cursor)?))
                } else {
                    None
                };
                let encoding = if flags & INFO_ENCODING != 0 {
                    Some(read_string(&mut cursor)?)
                } else {
                    None
                };
                let data_info = if flags == 0 {
                    None
                } else {
                    Some(DataInfo { timestamp, encoding })
                };

                let source_kind = QueryableKind::from_bits_truncate(read_u64(&mut cursor)?);
                let replier = read_peer_id(&mut cursor)?;
                Message::Reply(Reply {
                    correlation_id,
                    res_name,
                    payload,
                    data_info,
                    source_kind,
                    replier,
                })
            }
            TYPE_REPLY_FINAL => Message::ReplyFinal { correlation_id },
            other => {
                return Err(CodecError::DeserializationFailed(format!(
                    "Invalid message type: {}",
                    other
                )))
            }
        };

        let consumed = cursor.position() as usize;
        if consumed != bytes.len() {
            return Err(CodecError::DeserializationFailed(format!(
                "{} trailing bytes",
                bytes.len() - consumed
            )));
        }
        Ok(message)
    }
}

/// JSON wire format through `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let bytes = serde_json::to_vec(message)?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn length_prefix(len: usize) -> Result<[u8; 4], CodecError> {
    u32::try_from(len)
        .map(u32::to_le_bytes)
        .map_err(|_| CodecError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        })
}

/// Write a length-prefixed UTF-8 string.
fn write_string(buffer: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    write_bytes(buffer, s.as_bytes())
}

/// Write a length-prefixed byte slice.
fn write_bytes(buffer: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CodecError> {
    buffer.write_all(&length_prefix(bytes.len())?)?;
    buffer.write_all(bytes)?;
    Ok(())
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, CodecError> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64, CodecError> {
    let mut buf = [0u8; 8];
    cursor.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Read a length-prefixed byte vector.
fn read_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, CodecError> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf)?;
    let len = u32::from_le_bytes(buf) as usize;

    // The length is untrusted: check it against what is left before allocating.
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(CodecError::DeserializationFailed(format!(
            "Length {} exceeds remaining {} bytes",
            len, remaining
        )));
    }

    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Read a length-prefixed UTF-8 string.
fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String, CodecError> {
    let bytes = read_bytes(cursor)?;
    String::from_utf8(bytes)
        .map_err(|e| CodecError::DeserializationFailed(format!("Invalid UTF-8: {}", e)))
}

fn read_peer_id(cursor: &mut Cursor<&[u8]>) -> Result<PeerId, CodecError> {
    let raw = read_string(cursor)?;
    PeerId::new(raw).map_err(|e| CodecError::DeserializationFailed(format!("Invalid PeerId: {}", e)))
}
