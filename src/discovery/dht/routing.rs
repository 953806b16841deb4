//! The Kademlia routing table: 160 buckets of up to 8 nodes, indexed by the
//! length of the shared prefix with our own node id.
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;

/// Nodes per bucket, Kademlia's `k`.
pub const BUCKET_SIZE: usize = 8;

/// A node silent for this long is replaceable.
const NODE_STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// A 160-bit DHT node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    #[must_use]
    pub fn random(rng: &mut impl Rng) -> Self {
        let mut id = [0u8; 20];
        rng.fill(&mut id);
        Self(id)
    }

    /// # Panics
    ///
    /// Will panic if the slice is not exactly 20 bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), 20);
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        Self(id)
    }

    /// XOR metric distance to `other`.
    #[must_use]
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut distance = [0u8; 20];
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        distance
    }

    /// Number of leading zero bits in the distance; 160 for equality.
    #[must_use]
    pub fn shared_prefix_bits(&self, other: &NodeId) -> usize {
        let mut bits = 0;
        for byte in self.distance(other) {
            if byte == 0 {
                bits += 8;
            } else {
                bits += byte.leading_zeros() as usize;
                break;
            }
        }
        bits
    }
}

#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
}

#[derive(Debug)]
pub struct RoutingTable {
    own_id: NodeId,
    buckets: Vec<Vec<NodeEntry>>,
}

impl RoutingTable {
    #[must_use]
    pub fn new(own_id: NodeId) -> Self {
        Self {
            own_id,
            buckets: (0..160).map(|_| Vec::new()).collect(),
        }
    }

    #[must_use]
    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    /// Record a live node. Known nodes are refreshed in place; a full
    /// bucket only admits the node by replacing a stale entry.
    pub fn insert(&mut self, id: NodeId, addr: SocketAddr) {
        if id == self.own_id {
            return;
        }

        let bucket_index = self.bucket_index(&id);
        let bucket = &mut self.buckets[bucket_index];

        if let Some(existing) = bucket.iter_mut().find(|entry| entry.id == id) {
            existing.addr = addr;
            existing.last_seen = Instant::now();
            return;
        }

        if bucket.len() < BUCKET_SIZE {
            bucket.push(NodeEntry {
                id,
                addr,
                last_seen: Instant::now(),
            });
            return;
        }

        if let Some(stale) = bucket
            .iter_mut()
            .filter(|entry| entry.last_seen.elapsed() > NODE_STALE_AFTER)
            .min_by_key(|entry| entry.last_seen)
        {
            *stale = NodeEntry {
                id,
                addr,
                last_seen: Instant::now(),
            };
        }
    }

    /// The `n` known nodes closest to `target` by the XOR metric.
    #[must_use]
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<NodeEntry> {
        let mut nodes: Vec<NodeEntry> = self.buckets.iter().flatten().cloned().collect();
        nodes.sort_by_key(|entry| entry.id.distance(target));
        nodes.truncate(n);
        nodes
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.own_id.shared_prefix_bits(id).min(159)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::{NodeId, RoutingTable, BUCKET_SIZE};

    fn addr(n: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], n))
    }

    #[test]
    fn distance_is_xor() {
        let a = NodeId([0xFF; 20]);
        let b = NodeId([0x0F; 20]);
        assert_eq!(a.distance(&b), [0xF0; 20]);
        assert_eq!(a.distance(&a), [0x00; 20]);
    }

    #[test]
    fn shared_prefix_counts_leading_zero_bits() {
        let a = NodeId([0x00; 20]);
        let mut close = [0x00; 20];
        close[0] = 0x01; // differs in bit 7
        assert_eq!(a.shared_prefix_bits(&NodeId(close)), 7);
        assert_eq!(a.shared_prefix_bits(&a), 160);
    }

    #[test]
    fn own_id_is_never_inserted() {
        let own = NodeId([1; 20]);
        let mut table = RoutingTable::new(own);
        table.insert(own, addr(1));
        assert!(table.is_empty());
    }

    #[test]
    fn buckets_cap_at_k_fresh_nodes() {
        let own = NodeId([0x00; 20]);
        let mut table = RoutingTable::new(own);

        // All these ids share no prefix bits with us (leading 0xFF), so
        // they land in bucket 0.
        for n in 0..(BUCKET_SIZE as u8 + 4) {
            let mut id = [0xFF; 20];
            id[19] = n;
            table.insert(NodeId(id), addr(u16::from(n)));
        }
        assert_eq!(table.len(), BUCKET_SIZE);
    }

    #[test]
    fn closest_sorts_by_xor_distance() {
        let own = NodeId([0x00; 20]);
        let mut table = RoutingTable::new(own);

        let mut near = [0x00; 20];
        near[19] = 0x01;
        let mut far = [0xF0; 20];
        far[19] = 0x02;
        table.insert(NodeId(near), addr(1));
        table.insert(NodeId(far), addr(2));

        let closest = table.closest(&own, 2);
        assert_eq!(closest[0].id, NodeId(near));
        assert_eq!(closest[1].id, NodeId(far));
    }

    #[test]
    fn reinserting_a_known_node_refreshes_it_without_duplicating() {
        let own = NodeId([0x00; 20]);
        let mut table = RoutingTable::new(own);
        let id = NodeId([0xAB; 20]);

        table.insert(id, addr(1));
        table.insert(id, addr(2));
        assert_eq!(table.len(), 1);
        assert_eq!(table.closest(&own, 1)[0].addr, addr(2));
    }
}
