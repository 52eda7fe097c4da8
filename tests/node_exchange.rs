//! Two or more live nodes talking over loopback UDP.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use kadnode::network::rpc;
use kadnode::{KademliaNode, NodeConfig, NodeId};

fn config() -> NodeConfig {
    NodeConfig {
        workers: 2,
        request_timeout: Duration::from_millis(300),
        ..NodeConfig::with_bind_addr(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
    }
}

fn small_buckets() -> NodeConfig {
    NodeConfig {
        bucket_size: 1,
        ..config()
    }
}

/// An id sharing exactly `prefix` leading bits with `base`, varied by `salt`.
fn id_at(base: &NodeId, prefix: usize, salt: u8) -> NodeId {
    let mut bytes = *base.as_bytes();
    bytes[prefix / 8] ^= 0x80 >> (prefix % 8);
    bytes[19] ^= salt;
    NodeId::new(bytes)
}

async fn eventually<F: Fn() -> bool>(condition: F, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

fn silent_socket() -> (UdpSocket, SocketAddrV4) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = rpc::peer_address(socket.local_addr().unwrap()).unwrap();
    (socket, addr)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_between_seeded_nodes() {
    let a = KademliaNode::bind(config(), NodeId::from_seed(b"A")).await.unwrap();
    let b = KademliaNode::bind(config(), NodeId::from_seed(b"B")).await.unwrap();

    let answered = a.ping(b.local_addr()).await.unwrap();
    assert_eq!(answered, NodeId::from_seed(b"B"));

    // Both sides learned about each other
    assert!(a.routing_table().contains(&b.id()));
    assert!(b.routing_table().contains(&a.id()));
    assert_eq!(b.routing_table().get(&a.id()).unwrap().address, a.local_addr());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn find_node_returns_known_peers() {
    let a = KademliaNode::bind(config(), NodeId::random_id()).await.unwrap();
    let b = KademliaNode::bind(config(), NodeId::random_id()).await.unwrap();
    let mut others = Vec::new();
    for _ in 0..3 {
        let other = KademliaNode::bind(config(), NodeId::random_id()).await.unwrap();
        other.ping(b.local_addr()).await.unwrap();
        others.push(other);
    }

    let nodes = a.find_node(b.local_addr(), &NodeId::random_id()).await.unwrap();
    // b knows the three others and, by now, a itself
    assert_eq!(nodes.len(), 4);
    for other in &others {
        assert!(nodes.iter().any(|n| n.id == other.id() && n.address == other.local_addr()));
    }

    // a absorbs what it was told
    let a_table = a.routing_table();
    assert!(eventually(|| others.iter().all(|o| a_table.contains(&o.id())), Duration::from_secs(2)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn find_value_prefers_stored_value() {
    let a = KademliaNode::bind(config(), NodeId::random_id()).await.unwrap();
    let b = KademliaNode::bind(config(), NodeId::random_id()).await.unwrap();
    let key = NodeId::from_seed(b"greeting");
    b.store_local(key, b"hello".to_vec()).unwrap();

    let found = a.find_value(b.local_addr(), &key).await.unwrap();
    assert_eq!(found.value, Some(b"hello".to_vec()));
    assert!(found.nodes.is_empty());

    let missing = a.find_value(b.local_addr(), &NodeId::from_seed(b"other")).await.unwrap();
    assert_eq!(missing.value, None);
    assert!(missing.nodes.iter().any(|n| n.id == a.id()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bootstrap_counts_live_hosts() {
    let a = KademliaNode::bind(config(), NodeId::random_id()).await.unwrap();
    let b = KademliaNode::bind(config(), NodeId::random_id()).await.unwrap();
    let c = KademliaNode::bind(config(), NodeId::random_id()).await.unwrap();
    let (_silent, dead) = silent_socket();

    let answered = a.bootstrap(&[b.local_addr(), c.local_addr(), dead]).await;
    assert_eq!(answered, 2);
    assert_eq!(a.routing_table().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_bucket_evicts_unresponsive_peer() {
    let own = NodeId::zero();
    let node = KademliaNode::bind(small_buckets(), own).await.unwrap();
    let (_stale_socket, stale_addr) = silent_socket();
    let (_fresh_socket, fresh_addr) = silent_socket();

    let stale = id_at(&own, 0, 1);
    let fresh = id_at(&own, 0, 2);

    let ping = rpc::build_ping_request(&stale).encode().unwrap();
    assert!(node.handle_inbound_datagram(&ping, SocketAddr::V4(stale_addr)));
    let table = node.routing_table();
    assert!(eventually(|| table.contains(&stale), Duration::from_secs(2)).await);

    let ping = rpc::build_ping_request(&fresh).encode().unwrap();
    assert!(node.handle_inbound_datagram(&ping, SocketAddr::V4(fresh_addr)));

    // The stale peer never answers the probe and gets replaced
    assert!(eventually(|| table.contains(&fresh), Duration::from_secs(3)).await);
    assert!(!table.contains(&stale));
    assert_eq!(table.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_bucket_keeps_responsive_peer() {
    let own = NodeId::zero();
    let node = KademliaNode::bind(small_buckets(), own).await.unwrap();

    let live_id = id_at(&own, 0, 1);
    let live = KademliaNode::bind(config(), live_id).await.unwrap();
    live.ping(node.local_addr()).await.unwrap();
    let table = node.routing_table();
    assert!(eventually(|| table.contains(&live_id), Duration::from_secs(2)).await);

    let (_socket, newcomer_addr) = silent_socket();
    let newcomer = id_at(&own, 0, 2);
    let ping = rpc::build_ping_request(&newcomer).encode().unwrap();
    assert!(node.handle_inbound_datagram(&ping, SocketAddr::V4(newcomer_addr)));

    // Give the probe time to finish either way
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(table.contains(&live_id));
    assert!(!table.contains(&newcomer));
    assert_eq!(table.len(), 1);
}
