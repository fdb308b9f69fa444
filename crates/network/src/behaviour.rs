//! Retransmission behaviour: routes inbound events, deduplicates and fans out
//! transactions, and keeps the registries current.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use relay_storage::Storage;

use crate::address::PeerAddress;
use crate::config::NetworkConfig;
use crate::deduplication::TransactionDedupCache;
use crate::error::{DialError, SendError, TransportError};
use crate::events::{InfoEvent, ProtocolEvent};
use crate::known_peers::KnownPeers;
use crate::metrics::{NetworkMetrics, NetworkMetricsSnapshot};
use crate::peer::Peer;
use crate::protocol::{Message, TxId};
use crate::registry::{ActiveConnections, SpawnedPeers};
use crate::transport::Dialer;

/// Router between connections and the shared peer state.
///
/// All handlers are synchronous and never hold more than one registry lock
/// at a time; sends go to per-peer queues and never block.
pub struct Behaviour {
    config: Arc<NetworkConfig>,
    active: ActiveConnections,
    known: KnownPeers,
    spawned: SpawnedPeers,
    dedup: TransactionDedupCache,
    dialer: Arc<dyn Dialer>,
    metrics: Arc<NetworkMetrics>,
    cancel: CancellationToken,
}

impl Behaviour {
    pub fn new(
        config: Arc<NetworkConfig>,
        storage: Arc<dyn Storage>,
        dialer: Arc<dyn Dialer>,
        metrics: Arc<NetworkMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let known = KnownPeers::new(storage);
        for seed in &config.seed_peers {
            known.merge(*seed);
        }
        Self {
            dedup: TransactionDedupCache::new(config.dedup_capacity),
            active: ActiveConnections::new(),
            spawned: SpawnedPeers::new(),
            known,
            config,
            dialer,
            metrics,
            cancel,
        }
    }

    pub fn handle_protocol(&self, event: ProtocolEvent) {
        let ProtocolEvent {
            peer,
            message,
            frame,
        } = event;
        match message {
            Message::Transaction(tx) => self.on_transaction(&peer, tx.id(), frame),
            Message::GetPeers => self.on_get_peers(&peer),
            Message::Peers(addresses) => self.on_peers(&peer, addresses),
            Message::Other { .. } => {
                trace!(peer = %peer.id(), "ignoring message without a relay handler");
            }
        }
    }

    pub fn handle_info(&self, event: InfoEvent) {
        match event {
            InfoEvent::Connected(peer) => self.connected(peer),
            InfoEvent::Error { peer, error } => self.errored(peer, error),
        }
    }

    /// Register a freshly handshaken peer. A second connection under an id
    /// that is already active is closed.
    ///
    /// The peer's error may have been handled before this call; a peer found
    /// closed after registration is taken back out so its address can be
    /// dialed again.
    pub fn connected(&self, peer: Arc<dyn Peer>) {
        let id = peer.id();
        if !self.active.add(peer.clone()) {
            debug!(peer = %id, "already connected, closing duplicate");
            peer.close();
            return;
        }
        let handshake = peer.handshake();
        self.known.add(handshake.declared_address, handshake.version);
        if peer.is_closed() {
            self.active.remove_peer(&peer);
            debug!(peer = %id, "peer closed before it was registered");
            return;
        }
        info!(
            peer = %id,
            direction = %peer.direction(),
            version = %handshake.version,
            node = %handshake.node_name,
            "peer connected"
        );
    }

    fn errored(&self, peer: Arc<dyn Peer>, error: TransportError) {
        peer.close();
        if self.active.remove_peer(&peer) {
            info!(peer = %peer.id(), %error, "peer disconnected");
        } else {
            debug!(peer = %peer.id(), %error, "error from unregistered peer");
        }
    }

    fn on_transaction(&self, from: &Arc<dyn Peer>, id: TxId, frame: Bytes) {
        self.metrics.record_transaction();
        if !self.dedup.add(id) {
            self.metrics.record_duplicate();
            trace!(tx = %id, peer = %from.id(), "duplicate transaction");
            return;
        }

        let origin = from.id();
        let mut sent = 0usize;
        for peer in self.active.peers() {
            if peer.id() == origin {
                continue;
            }
            match peer.send_frame(frame.clone()) {
                Ok(()) => {
                    self.metrics.record_fanout_send();
                    sent += 1;
                }
                Err(SendError::QueueFull) => {}
                Err(e) => debug!(peer = %peer.id(), error = %e, "fan-out send failed"),
            }
        }
        trace!(tx = %id, origin = %origin, peers = sent, "transaction relayed");
    }

    fn on_get_peers(&self, from: &Arc<dyn Peer>) {
        let reply = Message::Peers(self.known.addresses());
        if let Err(e) = from.send(&reply) {
            debug!(peer = %from.id(), error = %e, "failed to answer peers request");
        }
    }

    fn on_peers(&self, from: &Arc<dyn Peer>, addresses: Vec<PeerAddress>) {
        let mut learned = 0usize;
        for address in addresses {
            if self.is_self(&address) {
                continue;
            }
            if self.known.merge(address) {
                learned += 1;
            }
        }
        if learned > 0 {
            debug!(peer = %from.id(), learned, "learned peers from gossip");
        }
    }

    /// Ask every active peer for its known peers.
    pub fn ask_about_known_peers(&self) {
        self.broadcast(&Message::GetPeers);
    }

    /// Send our whole directory to every active peer.
    pub fn send_all_my_known_peers(&self) {
        self.broadcast(&Message::Peers(self.known.addresses()));
    }

    fn broadcast(&self, message: &Message) {
        let payload = match message.encode() {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!(error = %e, kind = ?message.kind(), "failed to encode broadcast");
                return;
            }
        };
        for peer in self.active.peers() {
            if let Err(e) = peer.send_frame(payload.clone()) {
                debug!(
                    peer = %peer.id(),
                    error = %e,
                    kind = ?message.kind(),
                    "broadcast send failed"
                );
            }
        }
    }

    /// Dial every known address that is neither connected nor being dialed.
    pub fn spawn_known_peers(self: &Arc<Self>) -> usize {
        let mut started = 0;
        for address in self.known.addresses() {
            if self.address(address) {
                started += 1;
            }
        }
        if started > 0 {
            debug!(started, "dialing known peers");
        }
        started
    }

    /// Start a dial to `address` unless it is us, already active, or already
    /// being dialed. Returns whether a dial was started.
    pub fn address(self: &Arc<Self>, address: PeerAddress) -> bool {
        if self.is_self(&address) || self.active.exists(&address) {
            return false;
        }
        if !self.spawned.add(address) {
            return false;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = this.cancel.cancelled() => Err(DialError::Cancelled),
                result = this.dialer.dial(address) => result,
            };
            match result {
                Ok(peer) => this.connected(peer),
                Err(DialError::Cancelled) => debug!(peer = %address, "dial cancelled"),
                Err(e) => {
                    this.metrics.record_dial_failure();
                    info!(peer = %address, error = %e, "giving up on peer");
                }
            }
            this.spawned.delete(&address);
        });
        true
    }

    fn is_self(&self, address: &PeerAddress) -> bool {
        self.config.declared_address.as_ref() == Some(address)
    }

    /// Persist the known-peers directory, logging failures.
    pub fn save_known_peers(&self) {
        match self.known.save() {
            Ok(count) => debug!(count, "known peers saved"),
            Err(e) => warn!(error = %e, "failed to save known peers"),
        }
    }

    /// Persist known peers and close every active connection.
    pub fn stop(&self) {
        self.known.stop();
        let peers = self.active.drain();
        let count = peers.len();
        for peer in peers {
            peer.close();
        }
        info!(closed = count, "behaviour stopped");
    }

    pub fn active_connections(&self) -> &ActiveConnections {
        &self.active
    }

    pub fn known_peers(&self) -> &KnownPeers {
        &self.known
    }

    pub fn spawned_peers(&self) -> &SpawnedPeers {
        &self.spawned
    }

    pub fn dedup_cache(&self) -> &TransactionDedupCache {
        &self.dedup
    }

    pub fn metrics(&self) -> NetworkMetricsSnapshot {
        self.metrics.snapshot()
    }
}
