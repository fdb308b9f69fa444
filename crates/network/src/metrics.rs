use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Relay counters, read by observability collaborators.
#[derive(Debug)]
pub struct NetworkMetrics {
    // Frame counters
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,

    // Gossip counters
    transactions_received: AtomicU64,
    duplicate_transactions: AtomicU64,
    fanout_sends: AtomicU64,
    outbound_dropped: AtomicU64,
    inbound_dropped: AtomicU64,
    undecodable_messages: AtomicU64,

    // Connection counters
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    dial_failures: AtomicU64,
    handshake_failures: AtomicU64,

    // Timing
    start_time: Instant,
}

impl NetworkMetrics {
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            transactions_received: AtomicU64::new(0),
            duplicate_transactions: AtomicU64::new(0),
            fanout_sends: AtomicU64::new(0),
            outbound_dropped: AtomicU64::new(0),
            inbound_dropped: AtomicU64::new(0),
            undecodable_messages: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_frame_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_frame_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_transaction(&self) {
        self.transactions_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_transactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fanout_send(&self) {
        self.fanout_sends.fetch_add(1, Ordering::Relaxed);
    }

    /// A peer's outbound queue was full.
    pub fn record_outbound_dropped(&self) {
        self.outbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// A shared mailbox was full.
    pub fn record_inbound_dropped(&self) {
        self.inbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_undecodable(&self) {
        self.undecodable_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_failure(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current network metrics snapshot
    pub fn snapshot(&self) -> NetworkMetricsSnapshot {
        NetworkMetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            transactions_received: self.transactions_received.load(Ordering::Relaxed),
            duplicate_transactions: self.duplicate_transactions.load(Ordering::Relaxed),
            fanout_sends: self.fanout_sends.load(Ordering::Relaxed),
            outbound_dropped: self.outbound_dropped.load(Ordering::Relaxed),
            inbound_dropped: self.inbound_dropped.load(Ordering::Relaxed),
            undecodable_messages: self.undecodable_messages.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Get number of active connections
    pub fn active_connections(&self) -> u64 {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        opened.saturating_sub(closed)
    }
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of network metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMetricsSnapshot {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub transactions_received: u64,
    pub duplicate_transactions: u64,
    pub fanout_sends: u64,
    pub outbound_dropped: u64,
    pub inbound_dropped: u64,
    pub undecodable_messages: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub dial_failures: u64,
    pub handshake_failures: u64,
    pub uptime_seconds: u64,
}

impl NetworkMetricsSnapshot {
    /// Share of received transactions that were already known.
    pub fn duplicate_ratio(&self) -> f64 {
        if self.transactions_received == 0 {
            return 0.0;
        }
        self.duplicate_transactions as f64 / self.transactions_received as f64
    }
}
