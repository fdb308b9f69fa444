//! Concurrent registries of live peers and in-flight dials.
//!
//! Each registry guards its state with its own lock and never calls into
//! another registry while holding it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::PeerAddress;
use crate::peer::{same_peer, Peer};

/// Peers with an established, handshaken connection, keyed by peer id.
#[derive(Default)]
pub struct ActiveConnections {
    peers: Mutex<HashMap<PeerAddress, Arc<dyn Peer>>>,
}

impl ActiveConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer` unless its id is already taken. Returns `false` for a
    /// duplicate; the caller owns closing it.
    pub fn add(&self, peer: Arc<dyn Peer>) -> bool {
        let mut peers = self.peers.lock();
        let id = peer.id();
        if peers.contains_key(&id) {
            return false;
        }
        peers.insert(id, peer);
        true
    }

    pub fn get(&self, id: &PeerAddress) -> Option<Arc<dyn Peer>> {
        self.peers.lock().get(id).cloned()
    }

    pub fn exists(&self, id: &PeerAddress) -> bool {
        self.peers.lock().contains_key(id)
    }

    pub fn delete(&self, id: &PeerAddress) -> Option<Arc<dyn Peer>> {
        self.peers.lock().remove(id)
    }

    /// Remove `peer` only if it is the one registered under its id.
    pub fn remove_peer(&self, peer: &Arc<dyn Peer>) -> bool {
        let mut peers = self.peers.lock();
        let id = peer.id();
        match peers.get(&id) {
            Some(current) if same_peer(current, peer) => {
                peers.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Visit every peer under the registry lock. `f` must not touch other
    /// registries.
    pub fn each<F>(&self, mut f: F)
    where
        F: FnMut(&PeerAddress, &Arc<dyn Peer>),
    {
        for (id, peer) in self.peers.lock().iter() {
            f(id, peer);
        }
    }

    /// Point-in-time copy, safe to iterate while sending.
    pub fn peers(&self) -> Vec<Arc<dyn Peer>> {
        self.peers.lock().values().cloned().collect()
    }

    pub fn addresses(&self) -> Vec<PeerAddress> {
        let mut addresses: Vec<_> = self.peers.lock().keys().copied().collect();
        addresses.sort();
        addresses
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove everything, returning what was registered.
    pub fn drain(&self) -> Vec<Arc<dyn Peer>> {
        self.peers.lock().drain().map(|(_, peer)| peer).collect()
    }
}

/// Addresses with a dial in flight.
#[derive(Debug, Default)]
pub struct SpawnedPeers {
    addresses: Mutex<HashSet<PeerAddress>>,
}

impl SpawnedPeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-then-add under one lock. Returns `false` if a dial to `address`
    /// is already in flight.
    pub fn add(&self, address: PeerAddress) -> bool {
        self.addresses.lock().insert(address)
    }

    pub fn exists(&self, address: &PeerAddress) -> bool {
        self.addresses.lock().contains(address)
    }

    pub fn delete(&self, address: &PeerAddress) -> bool {
        self.addresses.lock().remove(address)
    }

    pub fn get_all(&self) -> Vec<PeerAddress> {
        let mut all: Vec<_> = self.addresses.lock().iter().copied().collect();
        all.sort();
        all
    }

    pub fn len(&self) -> usize {
        self.addresses.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
