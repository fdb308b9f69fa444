mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, init_tracing};
use relay_network::events::{mailbox, InfoEvent, ProtocolEvent};
use relay_network::peer::PeerSinks;
use relay_network::{
    ConnectionParams, DialError, Direction, Message, NetworkConfig, NetworkMetrics, Orchestrator,
    Peer, PeerAddress, Transaction, Transport,
};
use relay_storage::MemoryStorage;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn config(node_name: &str) -> NetworkConfig {
    NetworkConfig {
        node_name: node_name.to_string(),
        dial_attempts: 1,
        dial_backoff: Duration::from_millis(10),
        dial_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        workers: 2,
        ..NetworkConfig::default()
    }
}

struct TestTransport {
    transport: Arc<Transport>,
    protocol: mpsc::Receiver<ProtocolEvent>,
    info: mpsc::Receiver<InfoEvent>,
    cancel: CancellationToken,
}

fn transport(config: NetworkConfig) -> TestTransport {
    let metrics = Arc::new(NetworkMetrics::new());
    let cancel = CancellationToken::new();
    let (protocol_tx, protocol) = mailbox("protocol", 64, metrics.clone());
    let (info_tx, info) = mailbox("info", 64, metrics.clone());
    let params = ConnectionParams::from_config(&config, metrics.clone());
    let sinks = PeerSinks {
        protocol: protocol_tx,
        info: info_tx,
        metrics,
        cancel: cancel.clone(),
    };
    TestTransport {
        transport: Arc::new(Transport::new(Arc::new(config), params, sinks)),
        protocol,
        info,
        cancel,
    }
}

/// Accept one connection on `listener` through `transport`.
fn accept_one(
    listener: TcpListener,
    transport: Arc<Transport>,
) -> tokio::task::JoinHandle<Result<Arc<dyn Peer>, relay_network::HandshakeError>> {
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        transport.accept(stream).await
    })
}

async fn listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

#[tokio::test]
async fn dial_and_accept_exchange_handshakes_and_frames() {
    init_tracing();
    let mut alpha = transport(config("alpha"));
    let mut beta = transport(config("beta"));
    let (listener, addr) = listener().await;

    let accepting = accept_one(listener, alpha.transport.clone());
    let dialed = assert_ok!(beta.transport.dial(PeerAddress::from(addr)).await);
    let accepted = assert_ok!(accepting.await.unwrap());

    assert_eq!(dialed.id(), PeerAddress::from(addr));
    assert_eq!(dialed.direction(), Direction::Outgoing);
    assert_eq!(dialed.handshake().node_name, "alpha");
    assert_eq!(accepted.direction(), Direction::Incoming);
    assert_eq!(accepted.handshake().node_name, "beta");

    let message = Message::Transaction(Transaction::new(b"hello".to_vec()));
    dialed.send(&message).unwrap();
    let event = timeout(WAIT, alpha.protocol.recv()).await.unwrap().unwrap();
    assert_eq!(event.message, message);
    assert_eq!(event.peer.id(), accepted.id());
    assert_eq!(event.frame, message.encode().unwrap());

    // closing one side surfaces a single error on the other
    dialed.close();
    match timeout(WAIT, alpha.info.recv()).await.unwrap().unwrap() {
        InfoEvent::Error { peer, .. } => assert_eq!(peer.id(), accepted.id()),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(beta.info.try_recv().is_err());
    alpha.cancel.cancel();
}

#[tokio::test]
async fn dial_refuses_own_declared_address() {
    let mut cfg = config("self");
    let own: PeerAddress = "127.0.0.1:6868".parse().unwrap();
    cfg.declared_address = Some(own);
    let node = transport(cfg);

    let err = node.transport.dial(own).await.unwrap_err();
    assert!(matches!(err, DialError::SelfDial(addr) if addr == own));
}

#[tokio::test]
async fn same_nonce_is_rejected_as_self_connection() {
    let alpha_cfg = config("alpha");
    let mut twin_cfg = config("twin");
    twin_cfg.node_nonce = alpha_cfg.node_nonce;
    twin_cfg.dial_attempts = 5;

    let alpha = transport(alpha_cfg);
    let twin = transport(twin_cfg);
    let (listener, addr) = listener().await;

    // the listener goes away after one accept, so a retry would give up
    // instead of reporting the handshake error
    let accepting = accept_one(listener, alpha.transport.clone());
    let err = twin.transport.dial(PeerAddress::from(addr)).await.unwrap_err();
    assert!(matches!(
        err,
        DialError::Handshake {
            source: relay_network::HandshakeError::SelfConnection(_),
            ..
        }
    ));
    let accepted = accepting.await.unwrap();
    assert!(matches!(
        accepted,
        Err(relay_network::HandshakeError::SelfConnection(_))
    ));
}

#[tokio::test]
async fn app_name_mismatch_is_rejected() {
    let alpha = transport(config("alpha"));
    let mut foreign_cfg = config("foreign");
    foreign_cfg.app_name = "other-chain".to_string();
    let foreign = transport(foreign_cfg);
    let (listener, addr) = listener().await;

    let accepting = accept_one(listener, alpha.transport.clone());
    assert!(foreign.transport.dial(PeerAddress::from(addr)).await.is_err());
    assert!(matches!(
        accepting.await.unwrap(),
        Err(relay_network::HandshakeError::AppNameMismatch { .. })
    ));
}

#[tokio::test]
async fn unreachable_address_gives_up_after_configured_attempts() {
    let (listener, addr) = listener().await;
    drop(listener);

    let mut cfg = config("dialer");
    cfg.dial_attempts = 3;
    let node = transport(cfg);
    match node.transport.dial(PeerAddress::from(addr)).await {
        Err(DialError::GaveUp { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("unexpected dial outcome {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_dial_stops_retrying() {
    let (listener, addr) = listener().await;
    drop(listener);

    let mut cfg = config("dialer");
    cfg.dial_attempts = 100;
    cfg.dial_backoff = Duration::from_secs(60);
    let node = transport(cfg);
    node.cancel.cancel();

    let outcome = timeout(WAIT, node.transport.dial(PeerAddress::from(addr)))
        .await
        .unwrap();
    assert!(matches!(outcome, Err(DialError::Cancelled)));
    assert!(node.transport.dial(PeerAddress::from(addr)).await.is_err());
}

#[tokio::test]
async fn transactions_are_relayed_between_nodes() {
    init_tracing();
    let hub_cfg = NetworkConfig {
        bind_address: Some("127.0.0.1:0".parse().unwrap()),
        ..config("hub")
    };
    let storage = Arc::new(MemoryStorage::new());
    let mut hub = Orchestrator::new(hub_cfg, storage, CancellationToken::new()).unwrap();
    hub.start().await.unwrap();
    let hub_addr = PeerAddress::from(hub.local_addr().unwrap());

    let mut leaves = Vec::new();
    for name in ["left", "right"] {
        let cfg = NetworkConfig {
            seed_peers: vec![hub_addr],
            ..config(name)
        };
        let mut leaf =
            Orchestrator::new(cfg, Arc::new(MemoryStorage::new()), CancellationToken::new())
                .unwrap();
        leaf.start().await.unwrap();
        leaves.push(leaf);
    }

    let hub_behaviour = hub.behaviour();
    assert!(eventually(|| hub_behaviour.active_connections().len() == 2).await);
    let left = leaves[0].behaviour();
    let right = leaves[1].behaviour();
    assert!(eventually(|| left.active_connections().len() == 1).await);
    assert!(eventually(|| right.active_connections().len() == 1).await);

    let tx = Transaction::new(b"relay me".to_vec());
    let to_hub = left.active_connections().get(&hub_addr).unwrap();
    to_hub.send(&Message::Transaction(tx.clone())).unwrap();

    assert!(eventually(|| right.dedup_cache().exists(&tx.id())).await);
    assert!(hub_behaviour.dedup_cache().exists(&tx.id()));
    assert!(!left.dedup_cache().exists(&tx.id()));

    for leaf in &mut leaves {
        leaf.stop().await;
    }
    hub.stop().await;
    assert!(hub_behaviour.active_connections().is_empty());
}

#[tokio::test]
async fn bind_failure_is_fatal() {
    let (_held, addr) = listener().await;
    let cfg = NetworkConfig {
        bind_address: Some(addr),
        ..config("clash")
    };
    let mut node =
        Orchestrator::new(cfg, Arc::new(MemoryStorage::new()), CancellationToken::new()).unwrap();
    assert!(matches!(
        node.start().await,
        Err(relay_network::NetworkError::Bind { .. })
    ));
}
