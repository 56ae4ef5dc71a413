mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rendezvous_client::signaling::memory::MemoryRendezvous;
use rendezvous_client::transport::mock::MockTransportFactory;
use rendezvous_client::{Connection, ConnectionEvent, ConnectionState, PoolEvent, SendOutcome};
use tokio::sync::broadcast;

use common::{client, eventually, fast_config, init_tracing, tags};

async fn next_message(events: &mut broadcast::Receiver<ConnectionEvent>) -> Bytes {
    loop {
        if let ConnectionEvent::Message(payload) = events.recv().await.expect("event") {
            return payload;
        }
    }
}

async fn opened(events: &mut broadcast::Receiver<PoolEvent>) -> Connection {
    loop {
        if let PoolEvent::ConnectionOpened { connection, .. } = events.recv().await.expect("event")
        {
            return connection;
        }
    }
}

#[test_timeout::tokio_timeout_test(20, paused)]
async fn answered_offer_connects_within_pool_capacity() {
    init_tracing();
    let server = MemoryRendezvous::new();
    let factory = Arc::new(MockTransportFactory::new());
    let alice = client(&server, "alice", &factory, fast_config()).await;
    let bob = client(&server, "bob", &factory, fast_config()).await;

    let pool = alice.publish(tags(&["chat"])).await;
    assert_eq!(pool.active_offer_count(), 2);
    assert_eq!(server.open_offers("alice").len(), 2);
    let mut pool_events = pool.subscribe();

    let guest = bob.connect(tags(&["chat"]), Some("alice")).await.expect("connect");
    assert!(guest.wait_for(ConnectionState::Connected, Duration::from_secs(5)).await);
    let host = opened(&mut pool_events).await;
    assert_eq!(host.offer_id(), guest.offer_id());
    assert_eq!(host.peer_identity().as_deref(), Some("bob"));

    // One connected plus one pending: the answered offer keeps its slot.
    eventually(|| pool.len() == 2 && pool.active_offer_count() == 1).await;
    assert_eq!(server.open_offers("alice").len(), 1);
    assert_eq!(server.published_count(), 2);
    assert_eq!(host.state(), ConnectionState::Connected);

    let mut guest_inbox = guest.subscribe();
    let mut host_inbox = host.subscribe();
    assert_eq!(host.send("hi bob").await.expect("send"), SendOutcome::Sent);
    assert_eq!(guest.send("hi alice").await.expect("send"), SendOutcome::Sent);
    assert_eq!(next_message(&mut guest_inbox).await, Bytes::from_static(b"hi bob"));
    assert_eq!(next_message(&mut host_inbox).await, Bytes::from_static(b"hi alice"));

    bob.shutdown().await;
    alice.shutdown().await;
    assert!(!pool.is_running());
}

#[test_timeout::tokio_timeout_test(20, paused)]
async fn guest_messages_sent_before_connecting_are_replayed() {
    init_tracing();
    let server = MemoryRendezvous::new();
    let factory = Arc::new(MockTransportFactory::new());
    let alice = client(&server, "alice", &factory, fast_config()).await;
    let bob = client(&server, "bob", &factory, fast_config()).await;

    let pool = alice.publish(tags(&["chat"])).await;
    let mut inboxes: Vec<(String, broadcast::Receiver<ConnectionEvent>)> = pool
        .connections()
        .iter()
        .map(|conn| (conn.offer_id(), conn.subscribe()))
        .collect();

    let guest = bob.connect(tags(&["chat"]), None).await.expect("connect");
    assert_eq!(guest.state(), ConnectionState::Signaling);
    assert!(matches!(
        guest.send("early").await.expect("send"),
        SendOutcome::Buffered(_)
    ));

    let index = inboxes
        .iter()
        .position(|(offer_id, _)| *offer_id == guest.offer_id())
        .expect("host connection for the answered offer");
    let (_, host_inbox) = &mut inboxes[index];
    assert_eq!(next_message(host_inbox).await, Bytes::from_static(b"early"));
    assert_eq!(guest.buffered_len(), 0);

    bob.shutdown().await;
    alice.shutdown().await;
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn unanswered_offer_rotates_instead_of_reconnecting() {
    init_tracing();
    let server = MemoryRendezvous::new();
    let factory = Arc::new(MockTransportFactory::new());
    let mut config = fast_config();
    config.pool.max_offers = 1;
    config.pool.connection.connection_timeout = Duration::from_secs(2);
    let alice = client(&server, "alice", &factory, config).await;
    let bob = client(&server, "bob", &factory, fast_config()).await;

    let pool = alice.publish(tags(&["chat"])).await;
    let host = pool.connections().into_iter().next().expect("pending offer");
    let first_offer = host.offer_id();
    let mut host_events = host.subscribe();
    let mut pool_events = pool.subscribe();

    let (old_offer_id, new_offer_id) = loop {
        if let PoolEvent::Rotated {
            connection,
            old_offer_id,
            new_offer_id,
        } = pool_events.recv().await.expect("event")
        {
            assert_eq!(connection, host.id());
            break (old_offer_id, new_offer_id);
        }
    };
    assert_eq!(old_offer_id, first_offer);
    assert_eq!(host.offer_id(), new_offer_id);
    assert_eq!(pool.offer_ids(), vec![new_offer_id.clone()]);
    assert_eq!(host.rotation_attempts(), 1);

    let mut seen = Vec::new();
    while let Ok(event) = host_events.try_recv() {
        if let ConnectionEvent::StateChanged { to, .. } = event {
            seen.push(to);
        }
    }
    assert!(seen.contains(&ConnectionState::Failed));
    assert!(!seen.contains(&ConnectionState::Reconnecting));

    // Rotation does not withdraw the old offer; drop it so discovery only sees the new one.
    assert!(server.expire(&old_offer_id));
    let guest = bob.connect(tags(&["chat"]), None).await.expect("connect");
    assert_eq!(guest.offer_id(), new_offer_id);
    assert!(host.wait_for(ConnectionState::Connected, Duration::from_secs(1)).await);
    assert_eq!(host.rotation_attempts(), 0);

    bob.shutdown().await;
    alice.shutdown().await;
}
