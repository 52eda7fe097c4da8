use std::cmp::Ordering;
use std::net::SocketAddrV4;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::routing::{NodeId, BUCKET_COUNT, ID_LENGTH_BITS};

/// A peer known to the local node: its identity, routable address and the
/// last time we heard from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: NodeId,
    pub address: SocketAddrV4,
    pub last_seen: Instant,
}

impl Peer {
    pub fn new(id: NodeId, address: SocketAddrV4) -> Self {
        Peer {
            id,
            address,
            last_seen: Instant::now(),
        }
    }
}

/// Result of offering a peer to the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// New entry appended to its bucket.
    Accepted,
    /// Already known; `last_seen` updated and moved to the bucket tail.
    Refreshed,
    /// Bucket at capacity. `oldest` is the least recently seen entry, the
    /// candidate for a liveness probe.
    Full { oldest: Peer },
    /// `evicted` failed its liveness probe and made room for the new peer.
    Replaced { evicted: Peer },
    /// The table never stores its own identity.
    IsSelf,
}

/// A k-bucket: peers sharing one prefix length with the table owner, ordered
/// from least to most recently seen.
#[derive(Debug)]
struct Bucket {
    peers: Vec<Peer>,
}

impl Bucket {
    fn new() -> Self {
        Bucket { peers: Vec::new() }
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.peers.iter().position(|p| p.id == *id)
    }

    fn refresh(&mut self, index: usize, seen: Instant) {
        let mut existing = self.peers.remove(index);
        existing.last_seen = existing.last_seen.max(seen);
        self.peers.push(existing);
    }

    fn least_recently_seen(&self) -> Option<&Peer> {
        self.peers.iter().min_by_key(|p| p.last_seen)
    }
}

/// Represents the routing table in the Kademlia network.
///
/// Peers are kept in a fixed array of 161 buckets indexed by the prefix length
/// they share with the local id. A peer with id `n` only ever lives in bucket
/// `prefix_length(self, n)`.
///
/// Every bucket carries its own reader/writer lock, so concurrent datagram
/// handlers only contend when they touch the same bucket. All methods take
/// `&self`; share the table behind an `Arc`.
#[derive(Debug)]
pub struct RoutingTable {
    pub id: NodeId,
    bucket_size: usize,
    buckets: [RwLock<Bucket>; BUCKET_COUNT],
}

impl RoutingTable {
    pub fn new(id: &NodeId) -> Self {
        Self::with_bucket_size(id, super::K)
    }

    pub fn with_bucket_size(id: &NodeId, bucket_size: usize) -> Self {
        assert!(bucket_size > 0, "bucket size must be positive");
        RoutingTable {
            id: *id,
            bucket_size,
            buckets: std::array::from_fn(|_| RwLock::new(Bucket::new())),
        }
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    pub fn bucket_index(&self, id: &NodeId) -> usize {
        self.id.prefix_length(id)
    }

    fn bucket(&self, index: usize) -> &RwLock<Bucket> {
        assert!(index < BUCKET_COUNT, "bucket index {index} out of range");
        &self.buckets[index]
    }

    /// Inserts `peer`, or refreshes it if its id is already known.
    ///
    /// A full bucket is left untouched; the caller decides whether to probe the
    /// returned oldest entry and follow up with [`RoutingTable::replace_stale`].
    pub fn add_or_refresh(&self, peer: Peer) -> AddOutcome {
        if peer.id == self.id {
            return AddOutcome::IsSelf;
        }

        let index = self.bucket_index(&peer.id);
        let mut bucket = self.bucket(index).write();

        if let Some(existing) = bucket.position(&peer.id) {
            bucket.refresh(existing, peer.last_seen);
            trace!(bucket = index, peer = %peer.id, "refreshed peer");
            return AddOutcome::Refreshed;
        }

        if bucket.peers.len() < self.bucket_size {
            debug!(bucket = index, peer = %peer.id, address = %peer.address, "added peer");
            bucket.peers.push(peer);
            return AddOutcome::Accepted;
        }

        match bucket.least_recently_seen() {
            Some(oldest) => AddOutcome::Full {
                oldest: oldest.clone(),
            },
            None => unreachable!("bucket {index} is full and empty at once"),
        }
    }

    /// Least-recently-seen replacement with a synchronous liveness probe.
    ///
    /// The probe runs without holding any bucket lock. If the oldest entry
    /// answers it is refreshed and `peer` is rejected; otherwise it is evicted
    /// in favour of `peer`.
    pub fn add_or_replace<F>(&self, peer: Peer, is_alive: F) -> AddOutcome
    where
        F: FnOnce(&Peer) -> bool,
    {
        match self.add_or_refresh(peer.clone()) {
            AddOutcome::Full { oldest } => {
                if is_alive(&oldest) {
                    self.mark_seen(&oldest.id);
                    AddOutcome::Full { oldest }
                } else {
                    self.replace_stale(&oldest.id, peer)
                }
            }
            outcome => outcome,
        }
    }

    /// Evicts `stale` to make room for `fresh`.
    ///
    /// Bucket state is re-checked under the lock, since it may have changed
    /// while a probe was in flight: if `fresh` is already known or room has
    /// opened up, nothing is evicted.
    pub fn replace_stale(&self, stale: &NodeId, fresh: Peer) -> AddOutcome {
        if fresh.id == self.id {
            return AddOutcome::IsSelf;
        }

        let index = self.bucket_index(&fresh.id);
        let mut bucket = self.bucket(index).write();

        if let Some(existing) = bucket.position(&fresh.id) {
            bucket.refresh(existing, fresh.last_seen);
            return AddOutcome::Refreshed;
        }

        if bucket.peers.len() < self.bucket_size {
            bucket.peers.push(fresh);
            return AddOutcome::Accepted;
        }

        match bucket.position(stale) {
            Some(position) => {
                let evicted = bucket.peers.remove(position);
                debug!(bucket = index, evicted = %evicted.id, added = %fresh.id, "replaced stale peer");
                bucket.peers.push(fresh);
                AddOutcome::Replaced { evicted }
            }
            None => match bucket.least_recently_seen() {
                Some(oldest) => AddOutcome::Full {
                    oldest: oldest.clone(),
                },
                None => unreachable!("bucket {index} is full and empty at once"),
            },
        }
    }

    /// Bumps `last_seen` of a known peer. Returns false if it is not stored.
    pub fn mark_seen(&self, id: &NodeId) -> bool {
        let index = self.bucket_index(id);
        let mut bucket = self.bucket(index).write();
        match bucket.position(id) {
            Some(existing) => {
                bucket.refresh(existing, Instant::now());
                true
            }
            None => false,
        }
    }

    /// Removes the peer with `id`. Idempotent: always returns true.
    pub fn remove(&self, id: &NodeId) -> bool {
        let index = self.bucket_index(id);
        let mut bucket = self.bucket(index).write();
        if let Some(position) = bucket.position(id) {
            bucket.peers.remove(position);
            debug!(bucket = index, peer = %id, "removed peer");
        }
        true
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &NodeId) -> Option<Peer> {
        let bucket = self.bucket(self.bucket_index(id)).read();
        bucket.position(id).map(|i| bucket.peers[i].clone())
    }

    pub fn bucket_len(&self, index: usize) -> usize {
        self.bucket(index).read().peers.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.buckets
            .iter()
            .flat_map(|b| b.read().peers.clone())
            .collect()
    }

    /// Addresses of up to `count` peers closest to `target`, closest first.
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<SocketAddrV4> {
        self.find_closest_peers(target, count)
            .into_iter()
            .map(|p| p.address)
            .collect()
    }

    /// Up to `count` peers closest to `target`, never including ourselves.
    ///
    /// Buckets are visited in three passes: the bucket `target` itself would
    /// fall into, then the buckets matching the set bits of
    /// `self XOR target` after that position, then every remaining bucket.
    /// The collected peers are sorted by prefix length with `target` (longest
    /// first, ties broken on XOR distance) and cut to `count`.
    pub fn find_closest_peers(&self, target: &NodeId, count: usize) -> Vec<Peer> {
        if *target == self.id || count == 0 {
            return Vec::new();
        }

        let home = self.bucket_index(target);
        let mut visited = [false; BUCKET_COUNT];
        let mut found: Vec<Peer> = Vec::with_capacity(count);

        self.collect_bucket(home, target, count, &mut found);
        visited[home] = true;

        if found.len() < count {
            let distance = self.id.distance(target);
            for position in (home + 1)..ID_LENGTH_BITS {
                if found.len() >= count {
                    break;
                }
                if distance.bit(position) {
                    self.collect_bucket(position, target, count, &mut found);
                    visited[position] = true;
                }
            }
        }

        // The leftovers are not ordered by closeness, so take all of them and
        // let the sort below pick.
        if found.len() < count {
            for index in (0..BUCKET_COUNT).filter(|i| !visited[*i]) {
                self.collect_bucket(index, target, usize::MAX, &mut found);
            }
        }

        found.sort_by(|a, b| closeness(a, b, target));
        found.truncate(count);
        found
    }

    fn collect_bucket(&self, index: usize, target: &NodeId, quota: usize, found: &mut Vec<Peer>) {
        let remaining = quota.saturating_sub(found.len());
        if remaining == 0 {
            return;
        }
        let mut peers = self.bucket(index).read().peers.clone();
        peers.sort_by(|a, b| closeness(a, b, target));
        found.extend(peers.into_iter().take(remaining));
    }
}

fn closeness(a: &Peer, b: &Peer, target: &NodeId) -> Ordering {
    b.id.prefix_length(target)
        .cmp(&a.id.prefix_length(target))
        .then_with(|| {
            a.id.distance(target)
                .as_bytes()
                .cmp(b.id.distance(target).as_bytes())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    /// An id sharing exactly `prefix` leading bits with `base`, varied by `salt`
    /// in the last byte (so `prefix` must stay below 152).
    fn id_at(base: &NodeId, prefix: usize, salt: u8) -> NodeId {
        let mut bytes = *base.as_bytes();
        bytes[prefix / 8] ^= 0x80 >> (prefix % 8);
        bytes[19] ^= salt;
        NodeId::new(bytes)
    }

    #[test]
    fn test_new_routing_table() {
        let id = NodeId::zero();
        let routing_table = RoutingTable::new(&id);
        assert_eq!(routing_table.id, id);
        assert_eq!(routing_table.bucket_size(), super::super::K);
        assert!(routing_table.is_empty());
    }

    #[test]
    fn test_add() {
        let id = NodeId::zero();
        let routing_table = RoutingTable::new(&id);
        let new_id = id_at(&id, 12, 1);
        let outcome = routing_table.add_or_refresh(Peer::new(new_id, addr(1)));
        assert_eq!(outcome, AddOutcome::Accepted);
        assert_eq!(routing_table.bucket_len(12), 1);
        assert_eq!(routing_table.len(), 1);
        assert!(routing_table.contains(&new_id));
    }

    #[test]
    fn test_add_self_is_ignored() {
        let id = NodeId::random_id();
        let routing_table = RoutingTable::new(&id);
        assert_eq!(
            routing_table.add_or_refresh(Peer::new(id, addr(1))),
            AddOutcome::IsSelf
        );
        assert_eq!(routing_table.bucket_len(160), 0);
    }

    #[test]
    fn test_refresh_updates_last_seen() {
        let id = NodeId::zero();
        let routing_table = RoutingTable::new(&id);
        let peer = Peer::new(id_at(&id, 3, 1), addr(1));
        assert_eq!(routing_table.add_or_refresh(peer.clone()), AddOutcome::Accepted);

        let later = Peer {
            last_seen: peer.last_seen + Duration::from_secs(5),
            ..peer.clone()
        };
        assert_eq!(routing_table.add_or_refresh(later.clone()), AddOutcome::Refreshed);
        assert_eq!(routing_table.bucket_len(3), 1);
        assert_eq!(routing_table.get(&peer.id).unwrap().last_seen, later.last_seen);
    }

    #[test]
    fn test_refresh_moves_peer_to_tail() {
        let id = NodeId::zero();
        let routing_table = RoutingTable::with_bucket_size(&id, 3);
        let first = Peer::new(id_at(&id, 5, 1), addr(1));
        routing_table.add_or_refresh(first.clone());
        routing_table.add_or_refresh(Peer::new(id_at(&id, 5, 2), addr(2)));
        routing_table.add_or_refresh(Peer::new(id_at(&id, 5, 3), addr(3)));

        std::thread::sleep(Duration::from_millis(2));
        assert!(routing_table.mark_seen(&first.id));

        match routing_table.add_or_refresh(Peer::new(id_at(&id, 5, 4), addr(4))) {
            AddOutcome::Full { oldest } => assert_eq!(oldest.id, id_at(&id, 5, 2)),
            other => panic!("expected full bucket, got {other:?}"),
        }
    }

    #[test]
    fn test_full_bucket_rejects() {
        let id = NodeId::zero();
        let routing_table = RoutingTable::new(&id);
        for salt in 0..20 {
            let outcome = routing_table.add_or_refresh(Peer::new(id_at(&id, 7, salt), addr(salt as u16)));
            assert_eq!(outcome, AddOutcome::Accepted);
        }
        let extra = id_at(&id, 7, 20);
        match routing_table.add_or_refresh(Peer::new(extra, addr(100))) {
            AddOutcome::Full { oldest } => assert_eq!(oldest.id, id_at(&id, 7, 0)),
            other => panic!("expected full bucket, got {other:?}"),
        }
        assert_eq!(routing_table.bucket_len(7), 20);
        assert_eq!(routing_table.len(), 20);
        assert!(!routing_table.contains(&extra));
    }

    #[test]
    fn test_add_or_replace_keeps_live_peer() {
        let id = NodeId::zero();
        let routing_table = RoutingTable::with_bucket_size(&id, 2);
        routing_table.add_or_refresh(Peer::new(id_at(&id, 9, 1), addr(1)));
        routing_table.add_or_refresh(Peer::new(id_at(&id, 9, 2), addr(2)));

        let newcomer = Peer::new(id_at(&id, 9, 3), addr(3));
        let mut probed = None;
        let outcome = routing_table.add_or_replace(newcomer.clone(), |oldest| {
            probed = Some(oldest.id);
            true
        });

        assert!(matches!(outcome, AddOutcome::Full { .. }));
        assert_eq!(probed, Some(id_at(&id, 9, 1)));
        assert!(routing_table.contains(&id_at(&id, 9, 1)));
        assert!(!routing_table.contains(&newcomer.id));
        assert_eq!(routing_table.len(), 2);
    }

    #[test]
    fn test_add_or_replace_evicts_dead_peer() {
        let id = NodeId::zero();
        let routing_table = RoutingTable::with_bucket_size(&id, 2);
        routing_table.add_or_refresh(Peer::new(id_at(&id, 9, 1), addr(1)));
        routing_table.add_or_refresh(Peer::new(id_at(&id, 9, 2), addr(2)));

        let newcomer = Peer::new(id_at(&id, 9, 3), addr(3));
        let outcome = routing_table.add_or_replace(newcomer.clone(), |_| false);

        match outcome {
            AddOutcome::Replaced { evicted } => assert_eq!(evicted.id, id_at(&id, 9, 1)),
            other => panic!("expected eviction, got {other:?}"),
        }
        assert!(!routing_table.contains(&id_at(&id, 9, 1)));
        assert!(routing_table.contains(&newcomer.id));
        assert_eq!(routing_table.len(), 2);
    }

    #[test]
    fn test_replace_stale_unknown_peer() {
        let id = NodeId::zero();
        let routing_table = RoutingTable::with_bucket_size(&id, 1);
        routing_table.add_or_refresh(Peer::new(id_at(&id, 4, 1), addr(1)));

        let outcome = routing_table.replace_stale(&id_at(&id, 4, 9), Peer::new(id_at(&id, 4, 2), addr(2)));
        assert!(matches!(outcome, AddOutcome::Full { .. }));
        assert!(routing_table.contains(&id_at(&id, 4, 1)));
    }

    #[test]
    fn test_remove() {
        let id = NodeId::random_id();
        let routing_table = RoutingTable::new(&id);
        let new_id = id_at(&id, 30, 1);
        routing_table.add_or_refresh(Peer::new(new_id, addr(1)));
        assert!(routing_table.contains(&new_id));

        assert!(routing_table.remove(&new_id));
        assert!(!routing_table.contains(&new_id));
        // Removing again still reports success
        assert!(routing_table.remove(&new_id));
        assert!(routing_table.is_empty());
    }

    #[test]
    fn test_find_closest_self_is_empty() {
        let id = NodeId::random_id();
        let routing_table = RoutingTable::new(&id);
        for prefix in 0..40 {
            routing_table.add_or_refresh(Peer::new(id_at(&id, prefix, 1), addr(prefix as u16)));
        }
        for count in [0, 1, 7, 100] {
            assert!(routing_table.find_closest(&id, count).is_empty());
        }
    }

    #[test]
    fn test_find_closest_empty_table() {
        let routing_table = RoutingTable::new(&NodeId::random_id());
        assert!(routing_table.find_closest(&NodeId::random_id(), 7).is_empty());
    }

    #[test]
    fn test_find_closest_prefers_home_bucket() {
        let id = NodeId::zero();
        let routing_table = RoutingTable::new(&id);
        for prefix in 0..20 {
            for salt in 1..4 {
                routing_table.add_or_refresh(Peer::new(
                    id_at(&id, prefix, salt),
                    addr((prefix * 10 + salt as usize) as u16),
                ));
            }
        }

        let target = id_at(&id, 10, 0x40);
        let closest = routing_table.find_closest_peers(&target, 7);
        assert_eq!(closest.len(), 7);

        // The three peers of bucket 10 share more than 10 bits with the target
        for peer in &closest[..3] {
            assert_eq!(routing_table.bucket_index(&peer.id), 10);
            assert!(peer.id.prefix_length(&target) > 10);
        }
        for pair in closest.windows(2) {
            assert!(pair[0].id.prefix_length(&target) >= pair[1].id.prefix_length(&target));
        }
    }

    #[test]
    fn test_find_closest_returns_all_when_short() {
        let id = NodeId::zero();
        let routing_table = RoutingTable::new(&id);
        for prefix in [0, 50, 100] {
            routing_table.add_or_refresh(Peer::new(id_at(&id, prefix, 1), addr(prefix as u16)));
        }
        let target = id_at(&id, 60, 0);
        let closest = routing_table.find_closest(&target, 7);
        assert_eq!(closest.len(), 3);
    }

    #[test]
    fn test_find_closest_keeps_near_peer_from_high_bucket() {
        let id = NodeId::zero();
        let routing_table = RoutingTable::new(&id);
        for salt in 1..=7 {
            routing_table.add_or_refresh(Peer::new(id_at(&id, 0, salt), addr(salt as u16)));
        }
        let near = id_at(&id, 99, 0);
        routing_table.add_or_refresh(Peer::new(near, addr(99)));

        // Neither the home bucket (100) nor any bucket above it holds a peer
        let target = id_at(&id, 100, 0);
        let closest = routing_table.find_closest_peers(&target, 7);
        assert_eq!(closest.len(), 7);
        assert_eq!(closest[0].id, near);
        assert_eq!(closest[0].id.prefix_length(&target), 99);
        assert!(closest[1..].iter().all(|p| p.id.prefix_length(&target) == 0));
    }

    #[test]
    fn test_find_closest_truncates_to_count() {
        let id = NodeId::random_id();
        let routing_table = RoutingTable::new(&id);
        for _ in 0..500 {
            routing_table.add_or_refresh(Peer::new(NodeId::random_id(), addr(1)));
        }
        let closest = routing_table.find_closest(&NodeId::random_id(), super::super::ALPHA);
        assert_eq!(closest.len(), super::super::ALPHA);
    }

    #[test]
    fn test_concurrent_adds() {
        let id = NodeId::random_id();
        let routing_table = Arc::new(RoutingTable::new(&id));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&routing_table);
                std::thread::spawn(move || {
                    (0..200)
                        .filter(|_| {
                            let outcome = table.add_or_refresh(Peer::new(NodeId::random_id(), addr(1)));
                            outcome == AddOutcome::Accepted
                        })
                        .count()
                })
            })
            .collect();

        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(routing_table.len(), accepted);
        for index in 0..BUCKET_COUNT {
            assert!(routing_table.bucket_len(index) <= routing_table.bucket_size());
        }
    }
}
