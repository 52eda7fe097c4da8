use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, KadError};
use crate::routing::{NodeId, Peer, ALPHA};

use super::{MAX_VALUE_LEN, PROTOCOL_VERSION};

/// version(4) | kind(4) | epoch_time(8) | sender_id(20) | correlation_id(20)
pub const HEADER_LEN: usize = 56;

/// id(20) | ipv4(4) | port(2)
pub const REMOTE_NODE_LEN: usize = 26;

/// Fixed-width, big-endian bincode: no length prefixes on arrays, no varints.
fn wire() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    PingRequest = 1,
    PingReply = 2,
    FindNodeRequest = 3,
    FindNodeReply = 4,
    FindValueRequest = 5,
    FindValueReply = 6,
}

impl MessageKind {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_reply(self) -> bool {
        matches!(
            self,
            MessageKind::PingReply | MessageKind::FindNodeReply | MessageKind::FindValueReply
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::PingRequest => "PING_REQ",
            MessageKind::PingReply => "PING_RESP",
            MessageKind::FindNodeRequest => "FIND_NODE_REQ",
            MessageKind::FindNodeReply => "FIND_NODE_RESP",
            MessageKind::FindValueRequest => "FIND_VALUE_REQ",
            MessageKind::FindValueReply => "FIND_VALUE_RESP",
        }
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = DecodeError;

    fn try_from(value: u32) -> Result<Self, DecodeError> {
        match value {
            1 => Ok(MessageKind::PingRequest),
            2 => Ok(MessageKind::PingReply),
            3 => Ok(MessageKind::FindNodeRequest),
            4 => Ok(MessageKind::FindNodeReply),
            5 => Ok(MessageKind::FindValueRequest),
            6 => Ok(MessageKind::FindValueReply),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields shared by every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub kind: MessageKind,
    /// Unix seconds at construction time.
    pub epoch_time: i64,
    pub sender_id: NodeId,
    /// Random token of a request, copied verbatim into its reply.
    pub correlation_id: NodeId,
}

impl Header {
    pub(crate) fn new(kind: MessageKind, sender_id: NodeId, correlation_id: NodeId) -> Self {
        Header {
            version: PROTOCOL_VERSION,
            kind,
            epoch_time: epoch_now(),
            sender_id,
            correlation_id,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireHeader {
    version: u32,
    kind: u32,
    epoch_time: i64,
    sender_id: NodeId,
    correlation_id: NodeId,
}

/// A contact as carried inside find-node and find-value replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteNode {
    pub id: NodeId,
    pub address: SocketAddrV4,
}

impl From<&Peer> for RemoteNode {
    fn from(peer: &Peer) -> Self {
        RemoteNode {
            id: peer.id,
            address: peer.address,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireRemoteNode {
    id: NodeId,
    ip: [u8; 4],
    port: u16,
}

impl From<&RemoteNode> for WireRemoteNode {
    fn from(node: &RemoteNode) -> Self {
        WireRemoteNode {
            id: node.id,
            ip: node.address.ip().octets(),
            port: node.address.port(),
        }
    }
}

impl From<WireRemoteNode> for RemoteNode {
    fn from(node: WireRemoteNode) -> Self {
        RemoteNode {
            id: node.id,
            address: SocketAddrV4::new(Ipv4Addr::from(node.ip), node.port),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FindNodeMessage {
    pub lookup_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNodeResponse {
    pub nodes: Vec<RemoteNode>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FindValueMessage {
    pub lookup_value_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindValueResponse {
    pub nodes: Vec<RemoteNode>,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcPayload {
    Ping,
    PingResponse,
    FindNode(FindNodeMessage),
    FindNodeResponse(FindNodeResponse),
    FindValue(FindValueMessage),
    FindValueResponse(FindValueResponse),
}

impl RpcPayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            RpcPayload::Ping => MessageKind::PingRequest,
            RpcPayload::PingResponse => MessageKind::PingReply,
            RpcPayload::FindNode(_) => MessageKind::FindNodeRequest,
            RpcPayload::FindNodeResponse(_) => MessageKind::FindNodeReply,
            RpcPayload::FindValue(_) => MessageKind::FindValueRequest,
            RpcPayload::FindValueResponse(_) => MessageKind::FindValueReply,
        }
    }
}

/// A complete protocol message. Immutable once built; construct through the
/// builders in [`crate::network::rpc`] or by decoding a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMessage {
    pub(crate) header: Header,
    pub(crate) payload: RpcPayload,
}

impl RpcMessage {
    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn payload(&self) -> &RpcPayload {
        &self.payload
    }

    pub fn into_payload(self) -> RpcPayload {
        self.payload
    }

    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    pub fn sender_id(&self) -> NodeId {
        self.header.sender_id
    }

    pub fn correlation_id(&self) -> NodeId {
        self.header.correlation_id
    }

    /// Serializes header then payload, in field order.
    pub fn encode(&self) -> Result<Vec<u8>, KadError> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload_len());

        wire().serialize_into(
            &mut buf,
            &WireHeader {
                version: self.header.version,
                kind: self.header.kind.as_u32(),
                epoch_time: self.header.epoch_time,
                sender_id: self.header.sender_id,
                correlation_id: self.header.correlation_id,
            },
        )?;

        match &self.payload {
            RpcPayload::Ping | RpcPayload::PingResponse => {}
            RpcPayload::FindNode(msg) => wire().serialize_into(&mut buf, msg)?,
            RpcPayload::FindValue(msg) => wire().serialize_into(&mut buf, msg)?,
            RpcPayload::FindNodeResponse(msg) => encode_nodes(&mut buf, &msg.nodes)?,
            RpcPayload::FindValueResponse(msg) => {
                encode_nodes(&mut buf, &msg.nodes)?;
                let value = msg.value.as_deref().unwrap_or_default();
                wire().serialize_into(&mut buf, &u8::from(msg.value.is_some()))?;
                wire().serialize_into(&mut buf, &(value.len() as u32))?;
                buf.extend_from_slice(value);
            }
        }

        Ok(buf)
    }

    fn payload_len(&self) -> usize {
        match &self.payload {
            RpcPayload::Ping | RpcPayload::PingResponse => 0,
            RpcPayload::FindNode(_) | RpcPayload::FindValue(_) => 20,
            RpcPayload::FindNodeResponse(msg) => 4 + msg.nodes.len() * REMOTE_NODE_LEN,
            RpcPayload::FindValueResponse(msg) => {
                4 + msg.nodes.len() * REMOTE_NODE_LEN
                    + 5
                    + msg.value.as_ref().map_or(0, Vec::len)
            }
        }
    }
}

fn encode_nodes(buf: &mut Vec<u8>, nodes: &[RemoteNode]) -> Result<(), KadError> {
    if nodes.len() > ALPHA {
        return Err(KadError::TooManyNodes(nodes.len()));
    }
    wire().serialize_into(&mut *buf, &(nodes.len() as i32))?;
    for node in nodes {
        wire().serialize_into(&mut *buf, &WireRemoteNode::from(node))?;
    }
    Ok(())
}

/// Reads the fixed 56-byte header at the start of `bytes`.
pub fn decode_header(bytes: &[u8]) -> Result<Header, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated);
    }
    let raw: WireHeader = wire().deserialize_from(&bytes[..HEADER_LEN])?;
    if raw.version != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(raw.version));
    }
    Ok(Header {
        version: raw.version,
        kind: MessageKind::try_from(raw.kind)?,
        epoch_time: raw.epoch_time,
        sender_id: raw.sender_id,
        correlation_id: raw.correlation_id,
    })
}

/// Reads the kind-specific payload that follows `header`. `bytes` must hold
/// exactly the payload; leftovers are rejected.
pub fn decode_payload(header: Header, bytes: &[u8]) -> Result<RpcMessage, DecodeError> {
    let mut cursor = bytes;

    let payload = match header.kind {
        MessageKind::PingRequest => RpcPayload::Ping,
        MessageKind::PingReply => RpcPayload::PingResponse,
        MessageKind::FindNodeRequest => {
            RpcPayload::FindNode(wire().deserialize_from(&mut cursor)?)
        }
        MessageKind::FindValueRequest => {
            RpcPayload::FindValue(wire().deserialize_from(&mut cursor)?)
        }
        MessageKind::FindNodeReply => RpcPayload::FindNodeResponse(FindNodeResponse {
            nodes: decode_nodes(&mut cursor)?,
        }),
        MessageKind::FindValueReply => {
            let nodes = decode_nodes(&mut cursor)?;
            let value = decode_value(&mut cursor)?;
            RpcPayload::FindValueResponse(FindValueResponse { nodes, value })
        }
    };

    if !cursor.is_empty() {
        return Err(DecodeError::TrailingBytes(cursor.len()));
    }

    Ok(RpcMessage { header, payload })
}

/// Decodes one whole datagram.
pub fn decode(bytes: &[u8]) -> Result<RpcMessage, DecodeError> {
    let header = decode_header(bytes)?;
    decode_payload(header, &bytes[HEADER_LEN..])
}

fn decode_nodes(cursor: &mut &[u8]) -> Result<Vec<RemoteNode>, DecodeError> {
    let total: i32 = wire().deserialize_from(&mut *cursor)?;
    if !(0..=ALPHA as i32).contains(&total) {
        return Err(DecodeError::InvalidNodeCount(total));
    }
    (0..total)
        .map(|_| -> Result<RemoteNode, DecodeError> {
            let node: WireRemoteNode = wire().deserialize_from(&mut *cursor)?;
            Ok(RemoteNode::from(node))
        })
        .collect()
}

fn decode_value(cursor: &mut &[u8]) -> Result<Option<Vec<u8>>, DecodeError> {
    let has_value: u8 = wire().deserialize_from(&mut *cursor)?;
    let len: u32 = wire().deserialize_from(&mut *cursor)?;
    let len = len as usize;

    match has_value {
        0 if len == 0 => return Ok(None),
        0 => return Err(DecodeError::InvalidValue(format!("absent value with length {len}"))),
        1 => {}
        flag => return Err(DecodeError::InvalidValue(format!("bad presence flag {flag}"))),
    }
    if len > MAX_VALUE_LEN {
        return Err(DecodeError::InvalidValue(format!("length {len} over limit")));
    }
    if cursor.len() < len {
        return Err(DecodeError::Truncated);
    }
    let (value, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(Some(value.to_vec()))
}

fn epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
