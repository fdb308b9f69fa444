//! Error taxonomy for the relay network layer.
//!
//! Only [`NetworkError`] ever leaves the orchestrator, and only for startup
//! failures. Everything scoped to a single connection is logged and absorbed
//! by the behaviour.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::address::PeerAddress;
use crate::handshake::Version;

/// Problems detected while exchanging handshakes. The socket is closed and the
/// transport does not retry on its own.
#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
    #[error("handshake I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed handshake: {0}")]
    Malformed(String),
    #[error("application name mismatch: expected {expected:?}, got {actual:?}")]
    AppNameMismatch { expected: String, actual: String },
    #[error("incompatible protocol version {peer}, we speak {ours}")]
    IncompatibleVersion { peer: Version, ours: Version },
    #[error("refusing to connect to ourselves ({0})")]
    SelfConnection(String),
    #[error("{field} too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("handshake cancelled")]
    Cancelled,
}

/// Frame-level violations on an established connection.
#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("frame I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

/// Outgoing connection failures.
#[derive(thiserror::Error, Debug)]
pub enum DialError {
    #[error("refusing to dial our own declared address {0}")]
    SelfDial(PeerAddress),
    #[error("handshake with {address} failed: {source}")]
    Handshake {
        address: PeerAddress,
        #[source]
        source: HandshakeError,
    },
    #[error("gave up dialing {address} after {attempts} attempts: {last_error}")]
    GaveUp {
        address: PeerAddress,
        attempts: usize,
        last_error: String,
    },
    #[error("dial cancelled")]
    Cancelled,
}

/// Read/write failures on an established connection. Reported once per
/// connection through the info mailbox.
#[derive(thiserror::Error, Debug, Clone)]
pub enum TransportError {
    #[error("connection to {0} closed by remote")]
    Closed(SocketAddr),
    #[error("read from {addr} failed: {reason}")]
    Read { addr: SocketAddr, reason: String },
    #[error("write to {addr} failed: {reason}")]
    Write { addr: SocketAddr, reason: String },
    #[error("protocol violation from {addr}: {reason}")]
    Protocol { addr: SocketAddr, reason: String },
}

/// Result of a non-blocking send into a peer's outbound queue.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue full, message dropped")]
    QueueFull,
    #[error("peer connection closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Message codec failures.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),
}

/// Fatal errors surfaced by the orchestrator.
#[derive(thiserror::Error, Debug)]
pub enum NetworkError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}
