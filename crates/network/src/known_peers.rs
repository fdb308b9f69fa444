//! Persistent directory of peer addresses we have heard about.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use relay_storage::{Storage, StorageError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::address::PeerAddress;
use crate::handshake::Version;

/// One persisted row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct KnownPeerRow {
    address: PeerAddress,
    version: Version,
}

/// Address to last announced version. A zero version means the address was
/// learned through gossip and never handshaken with.
pub struct KnownPeers {
    peers: RwLock<HashMap<PeerAddress, Version>>,
    storage: Arc<dyn Storage>,
}

impl KnownPeers {
    /// Load whatever `storage` holds. Unreadable or corrupt contents are
    /// logged and the directory starts empty.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let peers = match storage.read() {
            Ok(raw) if raw.is_empty() => HashMap::new(),
            Ok(raw) => match serde_json::from_slice::<Vec<KnownPeerRow>>(&raw) {
                Ok(rows) => rows.into_iter().map(|r| (r.address, r.version)).collect(),
                Err(e) => {
                    warn!(error = %e, "ignoring corrupt known peers document");
                    HashMap::new()
                }
            },
            Err(e) => {
                warn!(error = %e, "failed to read known peers, starting empty");
                HashMap::new()
            }
        };
        info!(count = peers.len(), "loaded known peers");
        Self {
            peers: RwLock::new(peers),
            storage,
        }
    }

    /// Record a handshaken peer's declared address. No-op without an address.
    pub fn add(&self, declared: impl Into<Option<PeerAddress>>, version: Version) {
        let Some(address) = declared.into() else {
            return;
        };
        let previous = self.peers.write().insert(address, version);
        if previous.is_none() {
            debug!(peer = %address, %version, "new known peer");
        }
    }

    /// Record an address learned from gossip, keeping any version we already
    /// know for it.
    pub fn merge(&self, address: PeerAddress) -> bool {
        let mut peers = self.peers.write();
        if peers.contains_key(&address) {
            return false;
        }
        peers.insert(address, Version::default());
        true
    }

    pub fn contains(&self, address: &PeerAddress) -> bool {
        self.peers.read().contains_key(address)
    }

    pub fn version(&self, address: &PeerAddress) -> Option<Version> {
        self.peers.read().get(address).copied()
    }

    pub fn addresses(&self) -> Vec<PeerAddress> {
        let mut addresses: Vec<_> = self.peers.read().keys().copied().collect();
        addresses.sort();
        addresses
    }

    pub fn get_all(&self) -> Vec<String> {
        self.addresses().iter().map(ToString::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the directory. The in-memory map is snapshotted first; storage
    /// is called without holding the lock.
    pub fn save(&self) -> Result<usize, StorageError> {
        let mut rows: Vec<KnownPeerRow> = self
            .peers
            .read()
            .iter()
            .map(|(address, version)| KnownPeerRow {
                address: *address,
                version: *version,
            })
            .collect();
        rows.sort_by_key(|row| row.address);

        // Serialising plain strings cannot fail.
        let document = serde_json::to_vec_pretty(&rows).unwrap_or_default();
        self.storage.save(&document)?;
        debug!(count = rows.len(), "saved known peers");
        Ok(rows.len())
    }

    /// Final save, then release the storage backend.
    pub fn stop(&self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "failed to save known peers on shutdown");
        }
        self.storage.close();
    }
}
