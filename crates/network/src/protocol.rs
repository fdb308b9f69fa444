//! Relay protocol messages.
//!
//! Defines the message set exchanged after the handshake. The relay only
//! needs to identify transactions, answer peer-list requests and merge
//! announced peer lists; every other kind is carried opaquely so that it can
//! still be framed and counted.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::PeerAddress;
use crate::error::CodecError;

/// Coarse classification used by the behaviour to route inbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Transaction,
    GetPeers,
    Peers,
    Other,
}

/// Stable identifier of a transaction: BLAKE3 of its encoded body.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(pub [u8; 32]);

impl TxId {
    pub fn of(body: &[u8]) -> Self {
        Self(*blake3::hash(body).as_bytes())
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({self})")
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Opaque transaction body. Validity rules live elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub body: Vec<u8>,
}

impl Transaction {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self { body: body.into() }
    }

    pub fn id(&self) -> TxId {
        TxId::of(&self.body)
    }
}

/// Network message structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Transaction(Transaction),
    GetPeers,
    Peers(Vec<PeerAddress>),
    Other { content_id: u8, payload: Vec<u8> },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Transaction(_) => MessageKind::Transaction,
            Message::GetPeers => MessageKind::GetPeers,
            Message::Peers(_) => MessageKind::Peers,
            Message::Other { .. } => MessageKind::Other,
        }
    }

    /// Dedup identifier; only transactions carry one.
    pub fn id(&self) -> Option<TxId> {
        match self {
            Message::Transaction(tx) => Some(tx.id()),
            _ => None,
        }
    }

    /// Serialize the message
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(CodecError::Encode)
    }

    /// Deserialize a message
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(data).map_err(CodecError::Decode)
    }
}
