mod common;

use std::sync::Arc;

use common::*;
use relay_network::{InfoEvent, Message, Peer, TransportError, Version};
use relay_storage::{MemoryStorage, Storage};

#[tokio::test]
async fn resent_transaction_is_relayed_once() {
    let behaviour = behaviour(MockDialer::failing());
    let peer1 = MockPeer::new("10.0.0.1:6868");
    let peer2 = MockPeer::new("10.0.0.2:6868");
    behaviour.connected(peer1.clone());
    behaviour.connected(peer2.clone());

    behaviour.handle_protocol(transaction(&peer1, b"tx1"));
    assert_eq!(peer2.sends(), 1);

    behaviour.handle_protocol(transaction(&peer1, b"tx1"));
    assert_eq!(peer2.sends(), 1);

    let metrics = behaviour.metrics();
    assert_eq!(metrics.transactions_received, 2);
    assert_eq!(metrics.duplicate_transactions, 1);
}

#[tokio::test]
async fn fanout_excludes_origin_and_forwards_original_bytes() {
    let behaviour = behaviour(MockDialer::failing());
    let peers: Vec<_> = (1..=4)
        .map(|n| MockPeer::new(&format!("10.0.0.{n}:6868")))
        .collect();
    for peer in &peers {
        behaviour.connected(peer.clone());
    }

    let event = transaction(&peers[0], b"payment");
    let original = event.frame.clone();
    behaviour.handle_protocol(event);

    assert_eq!(peers[0].sends(), 0);
    for peer in &peers[1..] {
        assert_eq!(peer.frames(), vec![original.clone()]);
    }
    assert_eq!(behaviour.metrics().fanout_sends, 3);
}

#[tokio::test]
async fn same_transaction_from_two_origins_fans_out_once() {
    let behaviour = behaviour(MockDialer::failing());
    let a = MockPeer::new("10.0.0.1:6868");
    let b = MockPeer::new("10.0.0.2:6868");
    let c = MockPeer::new("10.0.0.3:6868");
    for peer in [&a, &b, &c] {
        behaviour.connected(peer.clone());
    }

    behaviour.handle_protocol(transaction(&a, b"tx"));
    behaviour.handle_protocol(transaction(&b, b"tx"));

    assert_eq!(a.sends(), 0);
    assert_eq!(b.sends(), 1);
    assert_eq!(c.sends(), 1);
}

#[tokio::test]
async fn get_peers_is_answered_to_the_asker_only() {
    let behaviour = behaviour(MockDialer::failing());
    let asker = MockPeer::declaring("10.0.0.1:6868", Some("10.0.0.1:6868"));
    let other = MockPeer::declaring("10.0.0.2:6868", Some("10.0.0.2:6868"));
    behaviour.connected(asker.clone());
    behaviour.connected(other.clone());

    behaviour.handle_protocol(event(&asker, Message::GetPeers));

    assert_eq!(other.sends(), 0);
    assert_eq!(
        asker.messages(),
        vec![Message::Peers(vec![addr("10.0.0.1:6868"), addr("10.0.0.2:6868")])]
    );
}

#[tokio::test]
async fn peer_lists_are_merged_without_our_own_address() {
    let behaviour = behaviour(MockDialer::failing());
    let peer = MockPeer::new("10.0.0.1:6868");
    behaviour.connected(peer.clone());

    behaviour.handle_protocol(event(
        &peer,
        Message::Peers(vec![
            addr("10.0.0.7:6868"),
            addr(OUR_ADDRESS),
            addr("10.0.0.8:6868"),
        ]),
    ));

    assert_eq!(
        behaviour.known_peers().get_all(),
        vec!["10.0.0.7:6868".to_string(), "10.0.0.8:6868".to_string()]
    );
    assert_eq!(
        behaviour.known_peers().version(&addr("10.0.0.7:6868")),
        Some(Version::default())
    );
}

#[tokio::test]
async fn other_messages_are_ignored() {
    let behaviour = behaviour(MockDialer::failing());
    let a = MockPeer::new("10.0.0.1:6868");
    let b = MockPeer::new("10.0.0.2:6868");
    behaviour.connected(a.clone());
    behaviour.connected(b.clone());

    behaviour.handle_protocol(event(
        &a,
        Message::Other {
            content_id: 42,
            payload: vec![1, 2, 3],
        },
    ));
    assert_eq!(b.sends(), 0);
    assert!(behaviour.dedup_cache().is_empty());
}

#[tokio::test]
async fn connected_registers_and_learns_declared_address() {
    let behaviour = behaviour(MockDialer::failing());
    let peer = MockPeer::declaring("192.168.1.9:50000", Some("192.168.1.9:6868"));
    behaviour.handle_info(InfoEvent::Connected(peer.clone()));

    assert!(behaviour
        .active_connections()
        .exists(&addr("192.168.1.9:50000")));
    assert_eq!(
        behaviour.known_peers().version(&addr("192.168.1.9:6868")),
        Some(Version::new(1, 4, 0))
    );

    let silent = MockPeer::new("192.168.1.10:50000");
    behaviour.connected(silent);
    assert_eq!(behaviour.known_peers().len(), 1);
}

#[tokio::test]
async fn duplicate_connection_is_closed() {
    let behaviour = behaviour(MockDialer::failing());
    let first = MockPeer::new("10.0.0.1:6868");
    let second = MockPeer::new("10.0.0.1:6868");
    behaviour.connected(first.clone());
    behaviour.connected(second.clone());

    assert!(second.is_closed());
    assert!(!first.is_closed());
    assert_eq!(behaviour.active_connections().len(), 1);
}

#[tokio::test]
async fn error_event_closes_and_removes_peer() {
    let behaviour = behaviour(MockDialer::failing());
    let peer = MockPeer::new("10.0.0.1:6868");
    behaviour.connected(peer.clone());

    behaviour.handle_info(InfoEvent::Error {
        peer: peer.clone(),
        error: TransportError::Closed(peer.id().socket_addr()),
    });

    assert!(peer.is_closed());
    assert!(behaviour.active_connections().is_empty());
}

#[tokio::test]
async fn stale_error_does_not_remove_replacement() {
    let behaviour = behaviour(MockDialer::failing());
    let current = MockPeer::new("10.0.0.1:6868");
    let stale = MockPeer::new("10.0.0.1:6868");
    behaviour.connected(current.clone());

    behaviour.handle_info(InfoEvent::Error {
        peer: stale.clone(),
        error: TransportError::Closed(stale.id().socket_addr()),
    });

    assert!(stale.is_closed());
    assert!(behaviour
        .active_connections()
        .exists(&addr("10.0.0.1:6868")));
}

#[tokio::test]
async fn error_handled_before_connected_leaves_address_dialable() {
    let dialer = MockDialer::gated(true);
    let behaviour = behaviour(dialer.clone());
    let peer = MockPeer::declaring("10.0.0.1:6868", Some("10.0.0.1:6868"));

    behaviour.handle_info(InfoEvent::Error {
        peer: peer.clone(),
        error: TransportError::Closed(peer.id().socket_addr()),
    });
    behaviour.handle_info(InfoEvent::Connected(peer.clone()));

    assert!(peer.is_closed());
    assert!(behaviour.active_connections().is_empty());
    assert!(behaviour.known_peers().contains(&addr("10.0.0.1:6868")));

    assert_eq!(behaviour.spawn_known_peers(), 1);
    assert!(eventually(|| dialer.dialed() == vec![addr("10.0.0.1:6868")]).await);
}

#[tokio::test]
async fn periodic_broadcasts_reach_every_active_peer() {
    let behaviour = behaviour(MockDialer::failing());
    let a = MockPeer::declaring("10.0.0.1:6868", Some("10.0.0.1:6868"));
    let b = MockPeer::new("10.0.0.2:6868");
    behaviour.connected(a.clone());
    behaviour.connected(b.clone());

    behaviour.ask_about_known_peers();
    behaviour.send_all_my_known_peers();

    let expected = vec![
        Message::GetPeers,
        Message::Peers(vec![addr("10.0.0.1:6868")]),
    ];
    assert_eq!(a.messages(), expected);
    assert_eq!(b.messages(), expected);
}

#[tokio::test]
async fn refuses_to_dial_ourselves() {
    let dialer = MockDialer::succeeding();
    let behaviour = behaviour(dialer.clone());

    assert!(!behaviour.address(addr(OUR_ADDRESS)));
    tokio::task::yield_now().await;
    assert_eq!(dialer.dials(), 0);
    assert!(behaviour.spawned_peers().is_empty());
}

#[tokio::test]
async fn does_not_dial_active_peers() {
    let dialer = MockDialer::succeeding();
    let behaviour = behaviour(dialer.clone());
    behaviour.connected(MockPeer::new("10.0.0.1:6868"));

    assert!(!behaviour.address(addr("10.0.0.1:6868")));
    assert_eq!(dialer.dials(), 0);
}

#[tokio::test]
async fn concurrent_spawn_dials_each_address_once() {
    let dialer = MockDialer::gated(true);
    let behaviour = behaviour(dialer.clone());
    behaviour.known_peers().merge(addr("10.0.0.1:6868"));
    behaviour.known_peers().merge(addr("10.0.0.2:6868"));

    assert_eq!(behaviour.spawn_known_peers(), 2);
    assert_eq!(behaviour.spawn_known_peers(), 0);
    assert!(!behaviour.address(addr("10.0.0.1:6868")));
    assert_eq!(
        behaviour.spawned_peers().get_all(),
        vec![addr("10.0.0.1:6868"), addr("10.0.0.2:6868")]
    );

    assert!(eventually(|| dialer.dials() == 2).await);
    dialer.release();

    assert!(eventually(|| behaviour.spawned_peers().is_empty()).await);
    assert_eq!(dialer.dials(), 2);
    assert_eq!(behaviour.active_connections().len(), 2);

    // connected now, so nothing left to dial
    assert_eq!(behaviour.spawn_known_peers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_address_calls_start_a_single_dial() {
    let dialer = MockDialer::gated(true);
    let behaviour = behaviour(dialer.clone());
    let target = addr("10.0.0.7:6868");
    let start = Arc::new(tokio::sync::Barrier::new(8));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let behaviour = behaviour.clone();
        let start = start.clone();
        tasks.push(tokio::spawn(async move {
            start.wait().await;
            behaviour.address(target)
        }));
    }
    let mut started = 0;
    for task in tasks {
        if task.await.unwrap() {
            started += 1;
        }
    }

    assert_eq!(started, 1);
    assert_eq!(behaviour.spawned_peers().get_all(), vec![target]);
    assert!(eventually(|| dialer.dials() == 1).await);

    dialer.release();
    assert!(eventually(|| behaviour.spawned_peers().is_empty()).await);
    assert_eq!(dialer.dials(), 1);
    assert_eq!(behaviour.active_connections().len(), 1);
}

#[tokio::test]
async fn failed_dial_clears_spawned_and_can_retry() {
    let dialer = MockDialer::failing();
    let behaviour = behaviour(dialer.clone());
    let target = addr("10.0.0.5:6868");

    assert!(behaviour.address(target));
    assert!(eventually(|| behaviour.spawned_peers().is_empty()).await);
    assert!(behaviour.active_connections().is_empty());
    assert_eq!(behaviour.metrics().dial_failures, 1);

    assert!(behaviour.address(target));
    assert!(eventually(|| dialer.dials() == 2).await);
}

#[tokio::test]
async fn stop_persists_known_peers_and_closes_connections() {
    let storage = Arc::new(MemoryStorage::new());
    let behaviour = behaviour_with(MockDialer::failing(), storage.clone());
    let peer = MockPeer::declaring("10.0.0.1:50000", Some("10.0.0.1:6868"));
    behaviour.connected(peer.clone());
    behaviour
        .known_peers()
        .add(addr("10.0.0.2:6868"), Version::new(1, 3, 0));

    behaviour.stop();
    assert!(peer.is_closed());
    assert!(behaviour.active_connections().is_empty());
    assert!(storage.is_closed());

    let restored = behaviour_with(MockDialer::failing(), storage.clone() as Arc<dyn Storage>);
    assert_eq!(
        restored.known_peers().get_all(),
        vec!["10.0.0.1:6868".to_string(), "10.0.0.2:6868".to_string()]
    );
}
