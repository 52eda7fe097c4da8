use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};

use tracing::trace;

use crate::error::{DecodeError, KadError, Result};
use crate::routing::{NodeId, ALPHA};

use super::message::{
    self, FindNodeMessage, FindNodeResponse, FindValueMessage, FindValueResponse, Header,
    MessageKind, RemoteNode, RpcMessage, RpcPayload,
};
use super::MAX_VALUE_LEN;

/// The outbound half of the datagram transport.
pub trait Transport: Send + Sync {
    /// Writes one whole datagram, returning the number of bytes sent.
    fn send_to(&self, datagram: &[u8], addr: SocketAddrV4) -> io::Result<usize>;
}

impl Transport for UdpSocket {
    fn send_to(&self, datagram: &[u8], addr: SocketAddrV4) -> io::Result<usize> {
        UdpSocket::send_to(self, datagram, addr)
    }
}

/// Decodes the header, then the payload its kind selects.
pub fn consume_datagram(bytes: &[u8]) -> std::result::Result<(RpcMessage, MessageKind), DecodeError> {
    let header = message::decode_header(bytes)?;
    let msg = message::decode_payload(header, &bytes[message::HEADER_LEN..])?;
    let kind = msg.kind();
    Ok((msg, kind))
}

pub fn build_ping_request(sender_id: &NodeId) -> RpcMessage {
    RpcMessage {
        header: Header::new(MessageKind::PingRequest, *sender_id, NodeId::random_id()),
        payload: RpcPayload::Ping,
    }
}

pub fn build_ping_reply(sender_id: &NodeId, request: &RpcMessage) -> RpcMessage {
    RpcMessage {
        header: Header::new(MessageKind::PingReply, *sender_id, request.correlation_id()),
        payload: RpcPayload::PingResponse,
    }
}

pub fn build_find_node_request(sender_id: &NodeId, lookup_id: &NodeId) -> RpcMessage {
    RpcMessage {
        header: Header::new(MessageKind::FindNodeRequest, *sender_id, NodeId::random_id()),
        payload: RpcPayload::FindNode(FindNodeMessage {
            lookup_id: *lookup_id,
        }),
    }
}

/// Fails with [`KadError::TooManyNodes`] for more than 7 nodes.
pub fn build_find_node_reply(
    sender_id: &NodeId,
    nodes: Vec<RemoteNode>,
    request: &RpcMessage,
) -> Result<RpcMessage> {
    if nodes.len() > ALPHA {
        return Err(KadError::TooManyNodes(nodes.len()));
    }
    Ok(RpcMessage {
        header: Header::new(MessageKind::FindNodeReply, *sender_id, request.correlation_id()),
        payload: RpcPayload::FindNodeResponse(FindNodeResponse { nodes }),
    })
}

pub fn build_find_value_request(sender_id: &NodeId, lookup_value_id: &NodeId) -> RpcMessage {
    RpcMessage {
        header: Header::new(MessageKind::FindValueRequest, *sender_id, NodeId::random_id()),
        payload: RpcPayload::FindValue(FindValueMessage {
            lookup_value_id: *lookup_value_id,
        }),
    }
}

pub fn build_find_value_reply(
    sender_id: &NodeId,
    nodes: Vec<RemoteNode>,
    value: Option<Vec<u8>>,
    request: &RpcMessage,
) -> Result<RpcMessage> {
    if nodes.len() > ALPHA {
        return Err(KadError::TooManyNodes(nodes.len()));
    }
    if let Some(len) = value.as_ref().map(Vec::len).filter(|len| *len > MAX_VALUE_LEN) {
        return Err(KadError::ValueTooLarge(len));
    }
    Ok(RpcMessage {
        header: Header::new(MessageKind::FindValueReply, *sender_id, request.correlation_id()),
        payload: RpcPayload::FindValueResponse(FindValueResponse { nodes, value }),
    })
}

pub fn build_outbound_datagram(msg: &RpcMessage) -> Result<Vec<u8>> {
    msg.encode()
}

/// Encodes `msg` and hands it to the transport in a single write.
pub fn send<T: Transport + ?Sized>(transport: &T, msg: &RpcMessage, addr: SocketAddrV4) -> Result<()> {
    let datagram = build_outbound_datagram(msg)?;
    let written = transport.send_to(&datagram, addr)?;
    if written != datagram.len() {
        return Err(KadError::PartialWrite {
            written,
            expected: datagram.len(),
        });
    }
    trace!(kind = %msg.kind(), to = %addr, bytes = written, "sent datagram");
    Ok(())
}

/// Peers are only routable over IPv4.
pub fn peer_address(addr: SocketAddr) -> Result<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(_) => Err(KadError::UnsupportedAddress(addr)),
    }
}
