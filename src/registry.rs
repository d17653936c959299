//! The peer registry: tracks fully-admitted peers by id, allocates and
//! recycles ids, and enumerates for broadcast.

use std::collections::BTreeMap;

use crate::peer::{Peer, PeerId};

/// Ordered set of fully-admitted peers, plus a table of recycled (parked)
/// peers keyed by id.
///
/// Enumeration order (`all`/`all_mut`) is insertion order, matching the
/// source's plain Python list of peer proxies — broadcasts iterate the
/// registry in the order peers connected.
pub struct Registry {
    n_clients: u32,
    server_id: PeerId,
    order: Vec<PeerId>,
    peers: BTreeMap<PeerId, Peer>,
    recycled: BTreeMap<PeerId, Peer>,
}

impl Registry {
    pub fn new(n_clients: u32, server_id: PeerId) -> Registry {
        Registry {
            n_clients,
            server_id,
            order: Vec::new(),
            peers: BTreeMap::new(),
            recycled: BTreeMap::new(),
        }
    }

    /// The smallest unused id in `{1..server_id} \ {assigned}`, or
    /// `PeerId::REJECTED` if the registry is already at capacity.
    pub fn allocate_id(&self) -> PeerId {
        if self.peers.len() as u32 >= self.n_clients {
            return PeerId::REJECTED;
        }
        for candidate in 1..=self.n_clients + 1 {
            let id = PeerId(candidate as i64);
            if id == self.server_id {
                continue;
            }
            if !self.peers.contains_key(&id) {
                return id;
            }
        }
        PeerId::REJECTED
    }

    /// Insert a fully-admitted peer. The caller must have allocated `peer.id()`
    /// via `allocate_id` and it must not already be present.
    pub fn insert(&mut self, peer: Peer) {
        let id = peer.id();
        debug_assert!(!self.peers.contains_key(&id));
        self.order.push(id);
        self.peers.insert(id, peer);
    }

    /// Remove a peer by id; no-op if not present. Returns the removed peer.
    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        let removed = self.peers.remove(&id);
        if removed.is_some() {
            self.order.retain(|&x| x != id);
        }
        removed
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Enumerate admitted peers in insertion order.
    pub fn all(&self) -> impl Iterator<Item = &Peer> {
        self.order.iter().filter_map(move |id| self.peers.get(id))
    }

    /// Enumerate admitted peer ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.order.iter().copied()
    }

    /// Park a disconnected peer's record (notifier vector and all) under its
    /// id for a subsequent reconnect. Overwrites any existing parked entry
    /// for the same id.
    pub fn recycle(&mut self, peer: Peer) {
        self.recycled.insert(peer.id(), peer);
    }

    /// Reclaim a parked peer record for `id`, if one was recycled.
    pub fn reclaim(&mut self, id: PeerId) -> Option<Peer> {
        self.recycled.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn dummy_peer(id: PeerId) -> Peer {
        let (a, _b) = UnixStream::pair().unwrap();
        Peer::new(id, a, Vec::new())
    }

    #[test]
    fn allocates_smallest_free_id_skipping_zero_and_server() {
        let server_id = PeerId(3);
        let mut reg = Registry::new(2, server_id);

        let first = reg.allocate_id();
        assert_eq!(first, PeerId(1));
        reg.insert(dummy_peer(first));

        let second = reg.allocate_id();
        assert_eq!(second, PeerId(2));
        reg.insert(dummy_peer(second));

        // At capacity (n_clients=2): further allocation is rejected, even
        // though id 3 is nominally free within 1..=n_clients+1 -- it's the
        // server's reserved id.
        assert_eq!(reg.allocate_id(), PeerId::REJECTED);
    }

    #[test]
    fn removing_and_reallocating_returns_the_smallest_free_id() {
        let server_id = PeerId(3);
        let mut reg = Registry::new(2, server_id);

        let a = reg.allocate_id();
        reg.insert(dummy_peer(a));
        let b = reg.allocate_id();
        reg.insert(dummy_peer(b));

        reg.remove(a);
        let reallocated = reg.allocate_id();
        assert_eq!(reallocated, a);
    }

    #[test]
    fn recycle_and_reclaim_round_trip() {
        let mut reg = Registry::new(2, PeerId(3));
        let peer = dummy_peer(PeerId(1));
        reg.recycle(peer);

        assert!(reg.reclaim(PeerId(1)).is_some());
        assert!(reg.reclaim(PeerId(1)).is_none());
    }

    #[test]
    fn enumeration_order_is_insertion_order() {
        let mut reg = Registry::new(3, PeerId(4));
        let a = reg.allocate_id();
        reg.insert(dummy_peer(a));
        let b = reg.allocate_id();
        reg.insert(dummy_peer(b));
        let c = reg.allocate_id();
        reg.insert(dummy_peer(c));

        let ids: Vec<PeerId> = reg.ids().collect();
        assert_eq!(ids, vec![a, b, c]);
    }
}
