//! Events flowing from connections into the behaviour, and the bounded
//! mailboxes that carry them.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::TransportError;
use crate::metrics::NetworkMetrics;
use crate::peer::Peer;
use crate::protocol::Message;

/// A decoded protocol message together with the peer it came from.
///
/// `frame` is the exact payload received, so fan-out can forward it without
/// re-encoding.
pub struct ProtocolEvent {
    pub peer: Arc<dyn Peer>,
    pub message: Message,
    pub frame: Bytes,
}

impl fmt::Debug for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolEvent")
            .field("peer", &self.peer.id())
            .field("kind", &self.message.kind())
            .field("len", &self.frame.len())
            .finish()
    }
}

/// Connection lifecycle notifications.
pub enum InfoEvent {
    Connected(Arc<dyn Peer>),
    Error {
        peer: Arc<dyn Peer>,
        error: TransportError,
    },
}

impl fmt::Debug for InfoEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfoEvent::Connected(peer) => f.debug_tuple("Connected").field(&peer.id()).finish(),
            InfoEvent::Error { peer, error } => f
                .debug_struct("Error")
                .field("peer", &peer.id())
                .field("error", error)
                .finish(),
        }
    }
}

/// Sending half of a bounded queue drained by a worker pool.
pub struct Mailbox<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    metrics: Arc<NetworkMetrics>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

pub fn mailbox<T>(
    name: &'static str,
    capacity: usize,
    metrics: Arc<NetworkMetrics>,
) -> (Mailbox<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Mailbox { name, tx, metrics }, rx)
}

impl<T> Mailbox<T> {
    /// Non-blocking push. A full mailbox drops the item with a warning and
    /// hands it back so the caller can release anything it owns.
    pub fn push(&self, item: T) -> Result<(), T> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) => {
                self.metrics.record_inbound_dropped();
                warn!(mailbox = self.name, "mailbox full, dropping event");
                Err(item)
            }
            Err(TrySendError::Closed(item)) => Err(item),
        }
    }

    /// Waits for room. Used for lifecycle events, which must not be lost
    /// while the sender still owns a live connection.
    pub async fn deliver(&self, item: T, cancel: &CancellationToken) -> Result<(), T> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(item),
            permit = self.tx.reserve() => permit,
        };
        match permit {
            Ok(permit) => {
                permit.send(item);
                Ok(())
            }
            Err(_) => Err(item),
        }
    }
}
