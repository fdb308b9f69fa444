//! Network configuration.
//!
//! Everything the relay needs is passed in through [`NetworkConfig`]; nothing
//! is read from globals. Durations are expressed in whole seconds when
//! deserialized so that TOML files and environment variables stay readable.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::PeerAddress;
use crate::handshake::Version;

pub const DEFAULT_APP_NAME: &str = "relay";
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Relay network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listen address; `None` disables inbound connections.
    pub bind_address: Option<SocketAddr>,
    /// Address announced in our handshake; also used as the self-dial guard.
    pub declared_address: Option<PeerAddress>,
    pub app_name: String,
    pub node_name: String,
    pub node_nonce: u64,
    /// Protocol versions tried in order when dialing. The first entry is the
    /// one we announce by default.
    pub versions: Vec<Version>,
    pub seed_peers: Vec<PeerAddress>,

    pub dial_attempts: usize,
    #[serde(with = "secs")]
    pub dial_backoff: Duration,
    #[serde(with = "secs")]
    pub dial_timeout: Duration,
    #[serde(with = "secs")]
    pub handshake_timeout: Duration,

    pub dedup_capacity: usize,

    #[serde(with = "secs")]
    pub known_peers_save_interval: Duration,
    #[serde(with = "secs")]
    pub send_known_peers_interval: Duration,
    #[serde(with = "secs")]
    pub ask_known_peers_interval: Duration,
    #[serde(with = "secs")]
    pub spawn_known_peers_interval: Duration,

    /// Per-connection queue of raw frames read from the socket.
    pub inbound_queue_capacity: usize,
    /// Per-connection queue of frames waiting to be written.
    pub outbound_queue_capacity: usize,
    /// Shared protocol and info mailboxes drained by the worker pools.
    pub mailbox_capacity: usize,
    pub max_frame_size: usize,
    /// Worker count per pool; `0` means available parallelism.
    pub workers: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            declared_address: None,
            app_name: DEFAULT_APP_NAME.to_string(),
            node_name: "relay-node".to_string(),
            node_nonce: rand::random(),
            versions: vec![
                Version::new(1, 4, 0),
                Version::new(1, 3, 0),
                Version::new(1, 2, 0),
            ],
            seed_peers: Vec::new(),
            dial_attempts: 20,
            dial_backoff: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            dedup_capacity: 10_000,
            known_peers_save_interval: Duration::from_secs(5 * 60),
            send_known_peers_interval: Duration::from_secs(5 * 60),
            ask_known_peers_interval: Duration::from_secs(60),
            spawn_known_peers_interval: Duration::from_secs(60),
            inbound_queue_capacity: 128,
            outbound_queue_capacity: 128,
            mailbox_capacity: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            workers: 0,
        }
    }
}

impl NetworkConfig {
    /// Version we announce first when dialing.
    pub fn preferred_version(&self) -> Version {
        self.versions.first().copied().unwrap_or_default()
    }

    /// Version tried on the given (zero based) dial attempt.
    pub fn version_for_attempt(&self, attempt: usize) -> Version {
        if self.versions.is_empty() {
            return Version::default();
        }
        self.versions[attempt % self.versions.len()]
    }

    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.app_name.is_empty() || self.app_name.len() > u8::MAX as usize {
            return Err(format!(
                "app_name must be 1..=255 bytes, got {}",
                self.app_name.len()
            ));
        }
        if self.node_name.len() > u8::MAX as usize {
            return Err(format!(
                "node_name must be at most 255 bytes, got {}",
                self.node_name.len()
            ));
        }
        if self.versions.is_empty() {
            return Err("at least one protocol version is required".to_string());
        }
        if self.dial_attempts == 0 {
            return Err("dial_attempts must be positive".to_string());
        }
        if self.max_frame_size == 0 {
            return Err("max_frame_size must be positive".to_string());
        }
        if self.dedup_capacity == 0 {
            return Err("dedup_capacity must be positive".to_string());
        }
        if self.inbound_queue_capacity == 0
            || self.outbound_queue_capacity == 0
            || self.mailbox_capacity == 0
        {
            return Err("queue capacities must be positive".to_string());
        }
        Ok(())
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = NetworkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dial_attempts, 20);
        assert_eq!(config.spawn_known_peers_interval, Duration::from_secs(60));
        assert_eq!(config.preferred_version(), Version::new(1, 4, 0));
    }

    #[test]
    fn versions_rotate_across_attempts() {
        let config = NetworkConfig::default();
        assert_eq!(config.version_for_attempt(0), Version::new(1, 4, 0));
        assert_eq!(config.version_for_attempt(1), Version::new(1, 3, 0));
        assert_eq!(config.version_for_attempt(3), Version::new(1, 4, 0));
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: NetworkConfig = serde_json::from_str(
            r#"{ "app_name": "testnet", "dial_backoff": 2, "seed_peers": ["10.0.0.1:6868"] }"#,
        )
        .unwrap();
        assert_eq!(config.app_name, "testnet");
        assert_eq!(config.dial_backoff, Duration::from_secs(2));
        assert_eq!(config.seed_peers.len(), 1);
        assert_eq!(config.dedup_capacity, 10_000);
    }

    #[test]
    fn rejects_zero_frame_size() {
        let config = NetworkConfig {
            max_frame_size: 0,
            ..NetworkConfig::default()
        };
        assert!(config.validate().unwrap_err().contains("max_frame_size"));
    }

    #[test]
    fn rejects_empty_versions() {
        let config = NetworkConfig {
            versions: Vec::new(),
            ..NetworkConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
