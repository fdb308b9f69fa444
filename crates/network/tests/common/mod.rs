#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relay_network::{
    Behaviour, DialError, Direction, Handshake, Message, NetworkConfig, NetworkMetrics, Peer,
    PeerAddress, ProtocolEvent, SendError, Transaction, Version,
};
use relay_storage::{MemoryStorage, Storage};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub const OUR_ADDRESS: &str = "10.0.0.100:6868";

/// Route `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn addr(s: &str) -> PeerAddress {
    s.parse().expect("valid test address")
}

/// Peer that records every frame handed to it.
#[derive(Debug)]
pub struct MockPeer {
    id: PeerAddress,
    handshake: Handshake,
    sent: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl MockPeer {
    pub fn new(id: &str) -> Arc<Self> {
        Self::declaring(id, None)
    }

    pub fn declaring(id: &str, declared: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            id: addr(id),
            handshake: Handshake {
                app_name: "relay".to_string(),
                version: Version::new(1, 4, 0),
                node_name: format!("mock-{id}"),
                node_nonce: rand::random(),
                declared_address: declared.map(addr),
                timestamp: 0,
            },
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn sends(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn frames(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .map(|frame| Message::decode(frame).expect("mock received a valid message"))
            .collect()
    }
}

impl Peer for MockPeer {
    fn id(&self) -> PeerAddress {
        self.id
    }

    fn direction(&self) -> Direction {
        Direction::Outgoing
    }

    fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    fn send_frame(&self, frame: Bytes) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Dialer that waits on a gate and then either connects a [`MockPeer`] or
/// fails.
pub struct MockDialer {
    gate: Semaphore,
    succeed: bool,
    dials: AtomicUsize,
    dialed: Mutex<Vec<PeerAddress>>,
}

impl MockDialer {
    pub fn succeeding() -> Arc<Self> {
        Self::build(true, Semaphore::MAX_PERMITS)
    }

    pub fn failing() -> Arc<Self> {
        Self::build(false, Semaphore::MAX_PERMITS)
    }

    /// Dials block until [`MockDialer::release`] is called.
    pub fn gated(succeed: bool) -> Arc<Self> {
        Self::build(succeed, 0)
    }

    fn build(succeed: bool, permits: usize) -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(permits),
            succeed,
            dials: AtomicUsize::new(0),
            dialed: Mutex::new(Vec::new()),
        })
    }

    pub fn release(&self) {
        self.gate.add_permits(1_000);
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn dialed(&self) -> Vec<PeerAddress> {
        self.dialed.lock().clone()
    }
}

#[async_trait]
impl relay_network::Dialer for MockDialer {
    async fn dial(&self, address: PeerAddress) -> Result<Arc<dyn Peer>, DialError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.dialed.lock().push(address);
        let _permit = self.gate.acquire().await.map_err(|_| DialError::Cancelled)?;
        if self.succeed {
            Ok(MockPeer::new(&address.to_string()) as Arc<dyn Peer>)
        } else {
            Err(DialError::GaveUp {
                address,
                attempts: 1,
                last_error: "connection refused".to_string(),
            })
        }
    }
}

pub fn test_config() -> NetworkConfig {
    NetworkConfig {
        declared_address: Some(addr(OUR_ADDRESS)),
        workers: 2,
        ..NetworkConfig::default()
    }
}

pub fn behaviour_with(
    dialer: Arc<MockDialer>,
    storage: Arc<dyn Storage>,
) -> Arc<Behaviour> {
    Arc::new(Behaviour::new(
        Arc::new(test_config()),
        storage,
        dialer,
        Arc::new(NetworkMetrics::new()),
        CancellationToken::new(),
    ))
}

pub fn behaviour(dialer: Arc<MockDialer>) -> Arc<Behaviour> {
    behaviour_with(dialer, Arc::new(MemoryStorage::new()))
}

pub fn event(from: &Arc<MockPeer>, message: Message) -> ProtocolEvent {
    let frame = Bytes::from(message.encode().expect("encodable message"));
    ProtocolEvent {
        peer: from.clone(),
        message,
        frame,
    }
}

pub fn transaction(from: &Arc<MockPeer>, body: &[u8]) -> ProtocolEvent {
    event(from, Message::Transaction(Transaction::new(body.to_vec())))
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
