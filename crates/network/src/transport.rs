//! Dialing and accepting handshaken peers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::PeerAddress;
use crate::config::NetworkConfig;
use crate::connection::ConnectionParams;
use crate::error::{DialError, HandshakeError};
use crate::handshake::{self, Version};
use crate::metrics::NetworkMetrics;
use crate::peer::{Direction, Peer, PeerSinks, TcpPeer};

/// Something that can turn an address into a connected peer.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: PeerAddress) -> Result<Arc<dyn Peer>, DialError>;
}

/// TCP transport performing the relay handshake.
pub struct Transport {
    config: Arc<NetworkConfig>,
    params: ConnectionParams,
    sinks: PeerSinks,
}

enum AttemptError {
    Connect(String),
    Handshake(HandshakeError),
}

impl Transport {
    pub fn new(config: Arc<NetworkConfig>, params: ConnectionParams, sinks: PeerSinks) -> Self {
        Self {
            config,
            params,
            sinks,
        }
    }

    fn metrics(&self) -> &NetworkMetrics {
        &self.sinks.metrics
    }

    fn cancel(&self) -> &CancellationToken {
        &self.sinks.cancel
    }

    /// Dial `address`, retrying up to the configured attempt count. Each
    /// attempt announces the next version from the configured list.
    pub async fn dial(&self, address: PeerAddress) -> Result<Arc<dyn Peer>, DialError> {
        if self.config.declared_address == Some(address) {
            return Err(DialError::SelfDial(address));
        }

        let attempts = self.config.dial_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::select! {
                    _ = self.cancel().cancelled() => return Err(DialError::Cancelled),
                    _ = sleep(self.config.dial_backoff) => {}
                }
            }
            if self.cancel().is_cancelled() {
                return Err(DialError::Cancelled);
            }

            let version = self.config.version_for_attempt(attempt);
            match self.try_dial(address, version).await {
                Ok(peer) => return Ok(peer),
                Err(AttemptError::Handshake(HandshakeError::Cancelled)) => {
                    return Err(DialError::Cancelled);
                }
                Err(AttemptError::Handshake(e)) if is_fatal(&e) => {
                    self.metrics().record_handshake_failure();
                    return Err(DialError::Handshake { address, source: e });
                }
                Err(AttemptError::Handshake(e)) => {
                    self.metrics().record_handshake_failure();
                    debug!(
                        peer = %address,
                        attempt,
                        %version,
                        error = %e,
                        "handshake attempt failed"
                    );
                    last_error = e.to_string();
                }
                Err(AttemptError::Connect(e)) => {
                    debug!(peer = %address, attempt, error = %e, "connect attempt failed");
                    last_error = e;
                }
            }
        }

        Err(DialError::GaveUp {
            address,
            attempts,
            last_error,
        })
    }

    async fn try_dial(
        &self,
        address: PeerAddress,
        version: Version,
    ) -> Result<Arc<dyn Peer>, AttemptError> {
        let connect = tokio::select! {
            _ = self.cancel().cancelled() => {
                return Err(AttemptError::Handshake(HandshakeError::Cancelled));
            }
            res = timeout(
                self.config.dial_timeout,
                TcpStream::connect(address.socket_addr()),
            ) => res,
        };
        let mut stream = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(AttemptError::Connect(e.to_string())),
            Err(_) => {
                return Err(AttemptError::Connect(format!(
                    "connect timed out after {:?}",
                    self.config.dial_timeout
                )))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(peer = %address, error = %e, "failed to set TCP_NODELAY");
        }

        let theirs = handshake::outgoing(&mut stream, &self.config, version, self.cancel())
            .await
            .map_err(AttemptError::Handshake)?;

        let peer = TcpPeer::start(
            stream,
            address,
            Direction::Outgoing,
            theirs,
            &self.params,
            &self.sinks,
        )
        .map_err(|e| AttemptError::Connect(e.to_string()))?;
        info!(peer = %address, "connected to peer");
        Ok(peer as Arc<dyn Peer>)
    }

    /// Run the acceptor handshake on a freshly accepted socket. On failure the
    /// socket is dropped.
    pub async fn accept(&self, mut stream: TcpStream) -> Result<Arc<dyn Peer>, HandshakeError> {
        let remote = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!(remote = %remote, error = %e, "failed to set TCP_NODELAY");
        }
        let theirs = match handshake::incoming(&mut stream, &self.config, self.cancel()).await {
            Ok(theirs) => theirs,
            Err(e) => {
                self.metrics().record_handshake_failure();
                return Err(e);
            }
        };
        let peer = TcpPeer::start(
            stream,
            PeerAddress::from(remote),
            Direction::Incoming,
            theirs,
            &self.params,
            &self.sinks,
        )?;
        info!(remote = %remote, "accepted peer");
        Ok(peer as Arc<dyn Peer>)
    }
}

#[async_trait]
impl Dialer for Transport {
    async fn dial(&self, address: PeerAddress) -> Result<Arc<dyn Peer>, DialError> {
        Transport::dial(self, address).await
    }
}

/// Rejections that another attempt cannot fix.
fn is_fatal(error: &HandshakeError) -> bool {
    matches!(
        error,
        HandshakeError::AppNameMismatch { .. }
            | HandshakeError::SelfConnection(_)
            | HandshakeError::FieldTooLong { .. }
    )
}
