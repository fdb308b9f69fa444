//! Peers: a handshaken connection plus its identity.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::address::PeerAddress;
use crate::connection::{Connection, ConnectionHandles, ConnectionParams};
use crate::error::{SendError, TransportError};
use crate::events::{InfoEvent, Mailbox, ProtocolEvent};
use crate::handshake::Handshake;
use crate::metrics::NetworkMetrics;
use crate::protocol::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Incoming => f.write_str("incoming"),
            Direction::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// A live, handshaken connection to a remote node.
///
/// The id is the dialed address for outgoing peers and the remote socket
/// address for incoming ones.
pub trait Peer: Send + Sync + fmt::Debug {
    fn id(&self) -> PeerAddress;

    fn direction(&self) -> Direction;

    /// The handshake the remote sent us.
    fn handshake(&self) -> &Handshake;

    fn remote_addr(&self) -> SocketAddr {
        self.id().socket_addr()
    }

    /// Queue an already encoded payload. Never blocks; a full queue drops the
    /// frame.
    fn send_frame(&self, frame: Bytes) -> Result<(), SendError>;

    fn send(&self, message: &Message) -> Result<(), SendError> {
        let payload = message
            .encode()
            .map_err(|e| SendError::Encode(e.to_string()))?;
        self.send_frame(Bytes::from(payload))
    }

    /// Idempotent; no events are emitted for a locally closed peer.
    fn close(&self);

    /// True once the peer was closed locally or its connection failed.
    fn is_closed(&self) -> bool;

    /// Underlying connection, if this peer is backed by a socket.
    fn connection(&self) -> Option<&Connection> {
        None
    }
}

/// Pointer identity for trait objects, ignoring vtables.
pub fn same_peer(a: &Arc<dyn Peer>, b: &Arc<dyn Peer>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Where a peer's decoded traffic and lifecycle events go.
#[derive(Clone)]
pub struct PeerSinks {
    pub protocol: Mailbox<ProtocolEvent>,
    pub info: Mailbox<InfoEvent>,
    pub metrics: Arc<NetworkMetrics>,
    pub cancel: CancellationToken,
}

/// Socket-backed peer.
#[derive(Debug)]
pub struct TcpPeer {
    id: PeerAddress,
    direction: Direction,
    handshake: Handshake,
    connection: Connection,
}

impl TcpPeer {
    /// Take ownership of a handshaken stream and start moving traffic.
    pub fn start(
        stream: TcpStream,
        id: PeerAddress,
        direction: Direction,
        handshake: Handshake,
        params: &ConnectionParams,
        sinks: &PeerSinks,
    ) -> std::io::Result<Arc<TcpPeer>> {
        let (connection, handles) = Connection::spawn(stream, params, &sinks.cancel)?;
        let peer = Arc::new(TcpPeer {
            id,
            direction,
            handshake,
            connection,
        });
        debug!(
            peer = %id,
            remote = %peer.connection.remote_addr(),
            %direction,
            version = %peer.handshake.version,
            node = %peer.handshake.node_name,
            "peer started"
        );
        tokio::spawn(forward(Arc::downgrade(&peer), handles, sinks.clone()));
        Ok(peer)
    }
}

impl Peer for TcpPeer {
    fn id(&self) -> PeerAddress {
        self.id
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_addr()
    }

    fn send_frame(&self, frame: Bytes) -> Result<(), SendError> {
        self.connection.send(frame)
    }

    fn close(&self) {
        self.connection.close();
    }

    fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    fn connection(&self) -> Option<&Connection> {
        Some(&self.connection)
    }
}

/// Moves decoded frames and the terminal error into the shared mailboxes.
/// Holds only a weak reference so a dropped peer is not kept alive.
async fn forward(peer: Weak<TcpPeer>, handles: ConnectionHandles, sinks: PeerSinks) {
    let ConnectionHandles { mut inbound, error } = handles;
    let id = match peer.upgrade() {
        Some(peer) => peer.id,
        None => return,
    };

    forward_frames(&peer, &mut inbound, &sinks).await;
    report_error(&peer, error, &sinks).await;

    sinks.metrics.record_connection_closed();
    trace!(peer = %id, "forwarder stopped");
}

async fn forward_frames(
    peer: &Weak<TcpPeer>,
    inbound: &mut mpsc::Receiver<Bytes>,
    sinks: &PeerSinks,
) {
    while let Some(frame) = inbound.recv().await {
        let Some(live) = peer.upgrade() else {
            return;
        };
        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                sinks.metrics.record_undecodable();
                debug!(peer = %live.id, error = %e, "ignoring undecodable message");
                continue;
            }
        };
        let event = ProtocolEvent {
            peer: live as Arc<dyn Peer>,
            message,
            frame,
        };
        let _ = sinks.protocol.push(event);
    }
}

async fn report_error(
    peer: &Weak<TcpPeer>,
    error: oneshot::Receiver<TransportError>,
    sinks: &PeerSinks,
) {
    let Ok(error) = error.await else {
        return;
    };
    let Some(live) = peer.upgrade() else {
        return;
    };
    debug!(peer = %live.id, %error, "connection failed");
    let event = InfoEvent::Error {
        peer: live as Arc<dyn Peer>,
        error,
    };
    let _ = sinks.info.deliver(event, &sinks.cancel).await;
}
