use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::error::{KadError, Result};
use crate::network::message::{FindValueResponse, MessageKind, RemoteNode, RpcMessage, RpcPayload};
use crate::network::{rpc, MAX_DATAGRAM_SIZE};
use crate::routing::{AddOutcome, NodeId, Peer, RoutingTable, ALPHA};
use crate::storage::Storage;

// How often the receiver wakes up to check for shutdown
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(200);

type Inbound = (RpcMessage, SocketAddrV4);
type Outbound = (RpcMessage, SocketAddrV4);

/// A DHT node bound to a UDP socket.
///
/// Threads, following the datagram's path:
/// - one receiver: decodes each datagram, completes the pending request it
///   answers (if any) and queues it for the workers. The queue is bounded; when
///   it is full new datagrams are dropped.
/// - `workers` handlers: record the sender in the routing table and answer
///   requests.
/// - one sender: the only writer on the socket, fed by an unbounded queue.
///
/// Requests issued through [`KademliaNode::ping`], [`KademliaNode::find_node`]
/// and [`KademliaNode::find_value`] are single-hop; iterative lookups are built
/// on top of them by the caller.
pub struct KademliaNode {
    inner: Arc<Inner>,
    inbound: Sender<Inbound>,
    local_addr: SocketAddrV4,
    shutdown: Arc<AtomicBool>,
}

struct Inner {
    id: NodeId,
    routing_table: RoutingTable,
    storage: Storage,
    outbound: Sender<Outbound>,
    pending_requests: DashMap<NodeId, oneshot::Sender<RpcMessage>>,
    // Stale entry being probed -> latest candidate for its slot
    probing: DashMap<NodeId, Peer>,
    runtime: Handle,
    request_timeout: Duration,
}

impl KademliaNode {
    /// Binds the socket and starts the receiver, worker and sender threads.
    ///
    /// Must be awaited inside a tokio runtime; liveness probes and request
    /// timeouts run on it.
    pub async fn bind(config: NodeConfig, self_id: NodeId) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr)?;
        let local_addr = rpc::peer_address(socket.local_addr()?)?;

        let (outbound_tx, outbound_rx) = unbounded::<Outbound>();
        let (inbound_tx, inbound_rx) = bounded::<Inbound>(config.inbound_queue.max(1));

        let inner = Arc::new(Inner {
            id: self_id,
            routing_table: RoutingTable::with_bucket_size(&self_id, config.bucket_size),
            storage: Storage::new(),
            outbound: outbound_tx,
            pending_requests: DashMap::new(),
            probing: DashMap::new(),
            runtime: Handle::current(),
            request_timeout: config.request_timeout,
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        // Clone sockets for threads
        let receiver_socket = socket.try_clone()?;
        receiver_socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        let sender_socket = socket;

        // Receiver thread
        {
            let inner = Arc::clone(&inner);
            let inbound = inbound_tx.clone();
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                let mut buf = [0u8; MAX_DATAGRAM_SIZE];
                while !shutdown.load(Ordering::Relaxed) {
                    match receiver_socket.recv_from(&mut buf) {
                        Ok((size, addr)) => {
                            inner.on_datagram(&buf[..size], addr, &inbound);
                        }
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                            ) => {}
                        Err(e) => warn!(error = %e, "receive error"),
                    }
                }
                debug!("receiver stopped");
            });
        }

        // Sender thread
        std::thread::spawn(move || {
            while let Ok((msg, addr)) = outbound_rx.recv() {
                if let Err(e) = rpc::send(&sender_socket, &msg, addr) {
                    warn!(kind = %msg.kind(), to = %addr, error = %e, "send failed");
                }
            }
            debug!("sender stopped");
        });

        for _ in 0..config.workers.max(1) {
            spawn_worker(Arc::clone(&inner), inbound_rx.clone());
        }

        info!(id = %self_id, address = %local_addr, workers = config.workers, "node listening");

        Ok(KademliaNode {
            inner,
            inbound: inbound_tx,
            local_addr,
            shutdown,
        })
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.inner.routing_table
    }

    /// Makes `value` available to find-value requests for `key`.
    pub fn store_local(&self, key: NodeId, value: Vec<u8>) -> Result<()> {
        self.inner.storage.set(key, value)
    }

    /// Entry point for a datagram received from `from`. Returns true if it was
    /// decoded and queued for a worker.
    pub fn handle_inbound_datagram(&self, bytes: &[u8], from: SocketAddr) -> bool {
        self.inner.on_datagram(bytes, from, &self.inbound)
    }

    /// Queues `msg` for the sender thread.
    pub fn send(&self, msg: RpcMessage, addr: SocketAddrV4) -> Result<()> {
        self.inner.enqueue(msg, addr)
    }

    /// Pings `addr` and returns the id it answered with.
    pub async fn ping(&self, addr: SocketAddrV4) -> Result<NodeId> {
        self.inner.ping(addr).await.map(|reply| reply.sender_id())
    }

    pub async fn find_node(&self, addr: SocketAddrV4, target: &NodeId) -> Result<Vec<RemoteNode>> {
        let request = rpc::build_find_node_request(&self.inner.id, target);
        let reply = self.inner.request(request, addr).await?;
        match reply.into_payload() {
            RpcPayload::FindNodeResponse(response) => Ok(response.nodes),
            other => Err(KadError::UnexpectedReply(other.kind())),
        }
    }

    pub async fn find_value(&self, addr: SocketAddrV4, key: &NodeId) -> Result<FindValueResponse> {
        let request = rpc::build_find_value_request(&self.inner.id, key);
        let reply = self.inner.request(request, addr).await?;
        match reply.into_payload() {
            RpcPayload::FindValueResponse(response) => Ok(response),
            other => Err(KadError::UnexpectedReply(other.kind())),
        }
    }

    /// Pings every known host concurrently; returns how many answered.
    pub async fn bootstrap(&self, known_hosts: &[SocketAddrV4]) -> usize {
        let responses = future::join_all(known_hosts.iter().map(|addr| self.ping(*addr))).await;

        responses
            .into_iter()
            .zip(known_hosts)
            .filter(|(response, addr)| match response {
                Ok(id) => {
                    info!(peer = %id, address = %addr, "bootstrap host answered");
                    true
                }
                Err(e) => {
                    warn!(address = %addr, error = %e, "bootstrap host unreachable");
                    false
                }
            })
            .count()
    }

    /// Stops the receiver. Workers and the sender exit once the node is dropped.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Drop for KademliaNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(inner: Arc<Inner>, inbound: Receiver<Inbound>) {
    std::thread::spawn(move || {
        while let Ok((msg, from)) = inbound.recv() {
            inner.handle_message(msg, from);
        }
    });
}

impl Inner {
    fn on_datagram(&self, bytes: &[u8], from: SocketAddr, inbound: &Sender<Inbound>) -> bool {
        let from = match rpc::peer_address(from) {
            Ok(addr) => addr,
            Err(e) => {
                debug!(error = %e, "dropping datagram");
                return false;
            }
        };

        let (msg, kind) = match rpc::consume_datagram(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(from = %from, error = %e, "dropping undecodable datagram");
                return false;
            }
        };
        trace!(from = %from, kind = %kind, "received datagram");

        // Fast path: wake up whoever waits for this reply
        if kind.is_reply() {
            if let Some((_, waiter)) = self.pending_requests.remove(&msg.correlation_id()) {
                let _ = waiter.send(msg.clone());
            }
        }

        match inbound.try_send((msg, from)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(from = %from, kind = %kind, "inbound queue full, dropping datagram");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn handle_message(self: &Arc<Self>, msg: RpcMessage, from: SocketAddrV4) {
        self.observe(Peer::new(msg.sender_id(), from));

        let reply = match msg.payload() {
            RpcPayload::Ping => Ok(Some(rpc::build_ping_reply(&self.id, &msg))),
            RpcPayload::FindNode(request) => {
                let nodes = self.closest_nodes(&request.lookup_id);
                rpc::build_find_node_reply(&self.id, nodes, &msg).map(Some)
            }
            RpcPayload::FindValue(request) => {
                let reply = match self.storage.get(&request.lookup_value_id) {
                    Some(value) => rpc::build_find_value_reply(&self.id, Vec::new(), Some(value), &msg),
                    None => {
                        let nodes = self.closest_nodes(&request.lookup_value_id);
                        rpc::build_find_value_reply(&self.id, nodes, None, &msg)
                    }
                };
                reply.map(Some)
            }
            RpcPayload::FindNodeResponse(response) => {
                self.absorb(&response.nodes);
                Ok(None)
            }
            RpcPayload::FindValueResponse(response) => {
                self.absorb(&response.nodes);
                Ok(None)
            }
            RpcPayload::PingResponse => Ok(None),
        };

        match reply {
            Ok(Some(reply)) => {
                if let Err(e) = self.enqueue(reply, from) {
                    warn!(to = %from, error = %e, "could not queue reply");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(to = %from, kind = %msg.kind(), error = %e, "could not build reply"),
        }
    }

    /// Records a peer we heard from directly. A full bucket triggers a
    /// liveness probe of its least recently seen entry.
    fn observe(self: &Arc<Self>, peer: Peer) {
        if let AddOutcome::Full { oldest } = self.routing_table.add_or_refresh(peer.clone()) {
            self.spawn_probe(oldest, peer);
        }
    }

    /// Pings `oldest` and hands its slot to a candidate if it does not answer.
    ///
    /// One probe per stale entry at a time; a candidate arriving while it runs
    /// takes over from the previous one.
    fn spawn_probe(self: &Arc<Self>, oldest: Peer, candidate: Peer) {
        match self.probing.entry(oldest.id) {
            Entry::Occupied(mut entry) => {
                let previous = entry.insert(candidate);
                trace!(stale = %oldest.id, dropped = %previous.id, "probe already running, candidate replaced");
                return;
            }
            Entry::Vacant(entry) => {
                entry.insert(candidate);
            }
        }

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let alive = match inner.ping(oldest.address).await {
                Ok(reply) => reply.sender_id() == oldest.id,
                Err(_) => false,
            };

            let candidate = match inner.probing.remove(&oldest.id) {
                Some((_, candidate)) => candidate,
                None => return,
            };
            if alive {
                inner.routing_table.mark_seen(&oldest.id);
                debug!(peer = %oldest.id, rejected = %candidate.id, "oldest peer alive, keeping it");
            } else {
                let outcome = inner.routing_table.replace_stale(&oldest.id, candidate);
                debug!(stale = %oldest.id, ?outcome, "oldest peer unresponsive");
            }
        });
    }

    /// Contacts learned second-hand; added when there is room, never probed.
    fn absorb(&self, nodes: &[RemoteNode]) {
        for node in nodes {
            if !self.routing_table.contains(&node.id) {
                self.routing_table.add_or_refresh(Peer::new(node.id, node.address));
            }
        }
    }

    fn closest_nodes(&self, target: &NodeId) -> Vec<RemoteNode> {
        self.routing_table
            .find_closest_peers(target, ALPHA)
            .iter()
            .map(RemoteNode::from)
            .collect()
    }

    fn enqueue(&self, msg: RpcMessage, addr: SocketAddrV4) -> Result<()> {
        self.outbound
            .send((msg, addr))
            .map_err(|_| KadError::ChannelClosed)
    }

    async fn ping(&self, addr: SocketAddrV4) -> Result<RpcMessage> {
        let reply = self.request(rpc::build_ping_request(&self.id), addr).await?;
        match reply.kind() {
            MessageKind::PingReply => Ok(reply),
            other => Err(KadError::UnexpectedReply(other)),
        }
    }

    /// Sends `request` and waits for the reply carrying its correlation id.
    async fn request(&self, request: RpcMessage, addr: SocketAddrV4) -> Result<RpcMessage> {
        let correlation_id = request.correlation_id();
        let (tx, rx) = oneshot::channel();
        self.pending_requests.insert(correlation_id, tx);
        // Covers timeouts, send failures and callers dropping this future
        let _pending = PendingGuard {
            pending: &self.pending_requests,
            correlation_id,
        };

        self.enqueue(request, addr)?;

        let reply = tokio::select! {
            res = rx => res.map_err(|_| KadError::ChannelClosed)?,
            _ = tokio::time::sleep(self.request_timeout) => return Err(KadError::Timeout),
        };

        self.routing_table
            .add_or_refresh(Peer::new(reply.sender_id(), addr));
        Ok(reply)
    }
}

/// Drops the pending entry of a request however the request ends. A reply
/// that arrived already took it out.
struct PendingGuard<'a> {
    pending: &'a DashMap<NodeId, oneshot::Sender<RpcMessage>>,
    correlation_id: NodeId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}
