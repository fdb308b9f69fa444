//! Relay Network Core
//!
//! Peer connection management and transaction gossip for relay nodes.
//!
//! ## Modules
//! - `handshake`: Versioned identity exchange preceding all traffic
//! - `transport`: Dialing with retries and accepting inbound peers
//! - `connection`: Per-socket inbound and outbound pumps
//! - `peer`: The peer abstraction and its socket-backed implementation
//! - `registry`: Active connections and in-flight dials
//! - `known_peers`: Persistent directory of peer addresses
//! - `deduplication`: Bounded recency cache of transaction ids
//! - `behaviour`: Routes events, deduplicates and fans out transactions
//! - `orchestrator`: Accept loop, periodic tasks and worker pools
//! - `protocol`: Message kinds and their wire encoding
//! - `frame`: Length-prefixed frame codec
//! - `buffer_pool`: Reusable write buffers
//! - `metrics`: Relay counters

pub mod address;
pub mod behaviour;
pub mod buffer_pool;
pub mod config;
pub mod connection;
pub mod deduplication;
pub mod error;
pub mod events;
pub mod frame;
pub mod handshake;
pub mod known_peers;
pub mod metrics;
pub mod orchestrator;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod transport;

// ------------------------------------------------------------
// Re-exports for workspace-wide use
// ------------------------------------------------------------

// Configuration & addressing
pub use address::{AddressError, PeerAddress};
pub use config::NetworkConfig;

// Transport & connections
pub use connection::{Connection, ConnectionParams};
pub use handshake::{Handshake, Version};
pub use peer::{Direction, Peer, TcpPeer};
pub use transport::{Dialer, Transport};

// Routing & state
pub use behaviour::Behaviour;
pub use deduplication::TransactionDedupCache;
pub use events::{InfoEvent, ProtocolEvent};
pub use known_peers::KnownPeers;
pub use orchestrator::Orchestrator;
pub use registry::{ActiveConnections, SpawnedPeers};

// Messages & errors
pub use error::{
    CodecError, DialError, FrameError, HandshakeError, NetworkError, SendError, TransportError,
};
pub use protocol::{Message, MessageKind, Transaction, TxId};

// Metrics
pub use metrics::{NetworkMetrics, NetworkMetricsSnapshot};
