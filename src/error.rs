use std::net::SocketAddr;

use thiserror::Error;

use crate::network::message::MessageKind;

pub type Result<T> = std::result::Result<T, KadError>;

/// Reasons an inbound datagram could not be turned into a message.
///
/// Every variant means the datagram is dropped; none of them are fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated datagram")]
    Truncated,

    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid node count {0}")]
    InvalidNodeCount(i32),

    #[error("invalid value field: {0}")]
    InvalidValue(String),

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("malformed datagram: {0}")]
    Malformed(String),
}

impl From<bincode::Error> for DecodeError {
    fn from(err: bincode::Error) -> Self {
        if let bincode::ErrorKind::Io(io) = err.as_ref() {
            if io.kind() == std::io::ErrorKind::UnexpectedEof {
                return DecodeError::Truncated;
            }
        }
        DecodeError::Malformed(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum KadError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("too many nodes for a reply: {0} (max {})", crate::routing::ALPHA)]
    TooManyNodes(usize),

    #[error("value too large: {0} bytes (max {})", crate::network::MAX_VALUE_LEN)]
    ValueTooLarge(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported address {0}, only IPv4 peers are routable")]
    UnsupportedAddress(SocketAddr),

    #[error("partial write: {written} of {expected} bytes")]
    PartialWrite { written: usize, expected: usize },

    #[error("channel closed")]
    ChannelClosed,

    #[error("request timed out")]
    Timeout,

    #[error("unexpected reply kind {0:?}")]
    UnexpectedReply(MessageKind),
}
