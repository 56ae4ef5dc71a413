use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;

use super::*;
use crate::config::BackoffConfig;
use crate::signaling::memory::{MemoryRendezvous, MemorySignaling};
use crate::transport::{LocalOffer, TransportFactory};
use crate::transport::mock::{MockTransport, MockTransportFactory};

fn tags() -> Vec<String> {
    vec!["chat".to_string()]
}

fn quick_config() -> ConnectionConfig {
    ConnectionConfig {
        reconnect_backoff: BackoffConfig {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: 0.0,
        },
        ..ConnectionConfig::default()
    }
}

struct Published {
    offer_id: String,
    sdp: String,
    local: LocalOffer,
    mock: Arc<MockTransport>,
}

async fn publish(factory: &MockTransportFactory, signaling: &MemorySignaling) -> Published {
    let local = factory.create_offer().await.expect("offer");
    let mock = factory.offer_for_sdp(&local.sdp).expect("mock transport");
    let published = signaling
        .publish(&tags(), vec![local.sdp.clone()], Duration::from_secs(300))
        .await
        .expect("publish");
    Published {
        offer_id: published[0].offer_id.clone(),
        sdp: local.sdp.clone(),
        local,
        mock,
    }
}

async fn offerer(
    factory: &MockTransportFactory,
    signaling: &MemorySignaling,
    config: ConnectionConfig,
) -> (Connection, String, Arc<MockTransport>) {
    let Published {
        offer_id,
        sdp,
        local,
        mock,
    } = publish(factory, signaling).await;
    let conn = Connection::new_offerer(offer_id, local, Arc::new(signaling.clone()), config);
    (conn, sdp, mock)
}

/// Bob answers the first offer alice published.
async fn answerer(
    server: &MemoryRendezvous,
    factory: &Arc<MockTransportFactory>,
    config: ConnectionConfig,
) -> Connection {
    let bob = server.session("bob");
    let discovered = bob
        .discover(&tags(), 10, 0)
        .await
        .expect("discover")
        .offers
        .into_iter()
        .next()
        .expect("an open offer");
    let ctx = AnswererContext::new(Arc::new(bob), factory.clone(), config);
    Connection::answer(&discovered, tags(), ctx)
        .await
        .expect("answer")
}

/// Plays the host side: fetches the answer for `offer_id` and applies it.
async fn accept_on_host(alice: &MemorySignaling, offer_id: &str, offer: &MockTransport) {
    let answer = alice
        .poll(0)
        .await
        .expect("poll")
        .answers
        .into_iter()
        .find(|answer| answer.offer_id == offer_id)
        .expect("answer for offer");
    offer.apply_answer(&answer.sdp).await.expect("apply");
}

fn drain(events: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn states(events: &[ConnectionEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|event| match event {
            ConnectionEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    while !check() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn repeated_answer_is_a_duplicate_and_a_different_one_conflicts() {
    let server = MemoryRendezvous::new();
    let factory = MockTransportFactory::new();
    let alice = server.session("alice");
    let (conn, sdp, mock) = offerer(&factory, &alice, quick_config()).await;
    let mut events = conn.subscribe();

    let answer = factory.accept_offer(&sdp).await.expect("answer");
    let applied = conn.process_answer(&answer.sdp, "bob", None).await;
    assert_eq!(applied.expect("first answer"), AnswerOutcome::Applied);
    let repeated = conn.process_answer(&answer.sdp, "bob", None).await;
    assert_eq!(repeated.expect("same answer"), AnswerOutcome::Duplicate);
    assert_eq!(mock.answers_applied(), 1);

    let other = factory.accept_offer(&sdp).await.expect("answer");
    let err = conn
        .process_answer(&other.sdp, "mallory", None)
        .await
        .expect_err("conflicting answer");
    assert!(matches!(err, RendezvousError::ConflictingAnswer { .. }));
    assert_eq!(conn.peer_identity().as_deref(), Some("bob"));

    assert!(conn.wait_for(ConnectionState::Connected, Duration::from_secs(5)).await);
    let seen = drain(&mut events);
    assert!(seen.contains(&ConnectionEvent::AnswerAccepted {
        offer_id: conn.offer_id(),
        answerer: "bob".into(),
    }));
    assert!(seen.contains(&ConnectionEvent::AnswerDuplicate {
        offer_id: conn.offer_id(),
    }));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn failed_apply_rolls_back_the_acceptance() {
    let server = MemoryRendezvous::new();
    let factory = MockTransportFactory::manual();
    let alice = server.session("alice");
    let (conn, sdp, mock) = offerer(&factory, &alice, quick_config()).await;

    let answer = factory.accept_offer(&sdp).await.expect("answer");
    mock.fail_next_apply();
    let err = conn
        .process_answer(&answer.sdp, "bob", Some(tags()))
        .await
        .expect_err("apply fails");
    assert!(matches!(err, RendezvousError::Transport(_)));
    assert!(!conn.answer_accepted());
    assert_eq!(conn.peer_identity(), None);
    assert_eq!(conn.matched_tags(), None);

    let retried = conn.process_answer(&answer.sdp, "bob", Some(tags())).await;
    assert_eq!(retried.expect("retry"), AnswerOutcome::Applied);
    assert!(conn.answer_accepted());
    assert_eq!(conn.matched_tags(), Some(tags()));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn connected_needs_both_transport_and_channel() {
    let server = MemoryRendezvous::new();
    let factory = MockTransportFactory::manual();
    let alice = server.session("alice");
    let (conn, sdp, mock) = offerer(&factory, &alice, quick_config()).await;
    assert_eq!(conn.state(), ConnectionState::Signaling);

    let answer = factory.accept_offer(&sdp).await.expect("answer");
    conn.process_answer(&answer.sdp, "bob", None)
        .await
        .expect("answer applied");

    mock.set_state(TransportState::Checking);
    assert!(conn.wait_for(ConnectionState::Checking, Duration::from_secs(1)).await);
    mock.set_state(TransportState::Connected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(conn.state(), ConnectionState::Checking);

    mock.channel().expect("offer channel").open();
    assert!(conn.wait_for(ConnectionState::Connected, Duration::from_secs(1)).await);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn buffered_messages_replay_in_order_once_connected() {
    let server = MemoryRendezvous::new();
    let factory = MockTransportFactory::manual();
    let alice = server.session("alice");
    let (conn, sdp, mock) = offerer(&factory, &alice, quick_config()).await;
    let mut events = conn.subscribe();

    let mut queued = Vec::new();
    for payload in ["one", "two", "three"] {
        match conn.send(payload).await.expect("send") {
            SendOutcome::Buffered(id) => queued.push(id),
            other => panic!("expected buffering while signaling, got {other:?}"),
        }
    }
    assert_eq!(conn.buffered_ids(), queued);

    let answer = factory.accept_offer(&sdp).await.expect("answer");
    conn.process_answer(&answer.sdp, "bob", None)
        .await
        .expect("answer applied");
    mock.set_state(TransportState::Connected);
    let channel = mock.channel().expect("offer channel");
    channel.open();
    assert!(conn.wait_for(ConnectionState::Connected, Duration::from_secs(1)).await);
    eventually(|| conn.buffered_len() == 0).await;

    assert_eq!(
        channel.sent(),
        vec![
            Bytes::from_static(b"one"),
            Bytes::from_static(b"two"),
            Bytes::from_static(b"three")
        ]
    );
    let replayed: Vec<MessageId> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            ConnectionEvent::Replayed { message_id } => Some(message_id),
            _ => None,
        })
        .collect();
    assert_eq!(replayed, queued);

    assert_eq!(conn.send("four").await.expect("send"), SendOutcome::Sent);
    assert_eq!(channel.sent().len(), 4);
}

#[test_timeout::tokio_timeout_test(300, paused)]
async fn messages_older_than_max_age_are_not_replayed() {
    let server = MemoryRendezvous::new();
    let factory = MockTransportFactory::manual();
    let alice = server.session("alice");
    let config = ConnectionConfig {
        connection_timeout: Duration::from_secs(600),
        ..quick_config()
    };
    let (conn, sdp, mock) = offerer(&factory, &alice, config).await;
    let mut events = conn.subscribe();

    let SendOutcome::Buffered(stale) = conn.send("stale").await.expect("send") else {
        panic!("expected buffering");
    };
    tokio::time::sleep(Duration::from_secs(61)).await;

    let answer = factory.accept_offer(&sdp).await.expect("answer");
    conn.process_answer(&answer.sdp, "bob", None)
        .await
        .expect("answer applied");
    mock.set_state(TransportState::Connected);
    let channel = mock.channel().expect("offer channel");
    channel.open();
    assert!(conn.wait_for(ConnectionState::Connected, Duration::from_secs(1)).await);
    eventually(|| conn.buffered_len() == 0).await;

    assert!(channel.sent().is_empty());
    assert!(drain(&mut events).contains(&ConnectionEvent::BufferExpired {
        message_ids: vec![stale],
    }));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn full_buffer_evicts_the_oldest_message() {
    let server = MemoryRendezvous::new();
    let factory = MockTransportFactory::manual();
    let alice = server.session("alice");
    let mut config = quick_config();
    config.buffer.max_size = 2;
    let (conn, _, _) = offerer(&factory, &alice, config).await;
    let mut events = conn.subscribe();

    let mut ids = Vec::new();
    for payload in ["a", "b", "c"] {
        if let SendOutcome::Buffered(id) = conn.send(payload).await.expect("send") {
            ids.push(id);
        }
    }
    assert_eq!(ids.len(), 3);
    assert_eq!(conn.buffered_ids(), ids[1..].to_vec());
    assert!(drain(&mut events).contains(&ConnectionEvent::BufferOverflow { evicted: ids[0] }));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn sends_are_dropped_when_buffering_is_disabled() {
    let server = MemoryRendezvous::new();
    let factory = MockTransportFactory::manual();
    let alice = server.session("alice");
    let config = ConnectionConfig {
        buffer_enabled: false,
        ..quick_config()
    };
    let (conn, _, _) = offerer(&factory, &alice, config).await;
    let mut events = conn.subscribe();

    assert_eq!(conn.send("lost").await.expect("send"), SendOutcome::Dropped);
    assert_eq!(conn.buffered_len(), 0);
    assert!(drain(&mut events).contains(&ConnectionEvent::MessageDropped));
}

#[test_timeout::tokio_timeout_test(300, paused)]
async fn unanswered_offerer_fails_without_reconnecting() {
    let server = MemoryRendezvous::new();
    let factory = MockTransportFactory::new();
    let alice = server.session("alice");
    let config = ConnectionConfig {
        connection_timeout: Duration::from_secs(5),
        ..quick_config()
    };
    let (conn, _, _) = offerer(&factory, &alice, config).await;
    let mut events = conn.subscribe();

    assert!(conn.wait_for(ConnectionState::Failed, Duration::from_secs(10)).await);
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(conn.state(), ConnectionState::Failed);
    assert_eq!(conn.reconnect_attempts(), 0);
    let seen = drain(&mut events);
    assert!(seen.contains(&ConnectionEvent::Failed {
        reason: "connection timeout".into(),
    }));
    assert!(!states(&seen).contains(&ConnectionState::Reconnecting));
    assert!(
        !seen
            .iter()
            .any(|event| matches!(event, ConnectionEvent::ReconnectScheduled { .. }))
    );
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn late_answer_rescues_a_timed_out_offer() {
    let server = MemoryRendezvous::new();
    let factory = MockTransportFactory::new();
    let alice = server.session("alice");
    let config = ConnectionConfig {
        connection_timeout: Duration::from_secs(5),
        ..quick_config()
    };
    let (conn, sdp, _) = offerer(&factory, &alice, config).await;
    assert!(conn.wait_for(ConnectionState::Failed, Duration::from_secs(10)).await);

    let answer = factory.accept_offer(&sdp).await.expect("answer");
    let outcome = conn.process_answer(&answer.sdp, "bob", None).await;
    assert_eq!(outcome.expect("late answer"), AnswerOutcome::Applied);
    assert!(conn.wait_for(ConnectionState::Connected, Duration::from_secs(1)).await);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn rotation_keeps_identity_and_buffered_messages() {
    let server = MemoryRendezvous::new();
    let factory = MockTransportFactory::new();
    let alice = server.session("alice");
    let (conn, _, first) = offerer(&factory, &alice, quick_config()).await;
    let first_offer_id = conn.offer_id();
    let id = conn.id();
    let mut events = conn.subscribe();

    let SendOutcome::Buffered(queued) = conn.send("queued").await.expect("send") else {
        panic!("expected buffering");
    };

    let second = publish(&factory, &alice).await;
    conn.rebind_to_offer(second.offer_id.clone(), second.local)
        .await
        .expect("rotate");
    assert_eq!(conn.id(), id);
    assert_eq!(conn.offer_id(), second.offer_id);
    assert_eq!(conn.rotation_attempts(), 1);
    assert_eq!(conn.buffered_ids(), vec![queued]);
    assert_eq!(conn.state(), ConnectionState::Signaling);
    assert!(first.is_closed());
    assert!(drain(&mut events).contains(&ConnectionEvent::Rotated {
        old_offer_id: first_offer_id,
        new_offer_id: second.offer_id.clone(),
    }));

    let answer = factory.accept_offer(&second.sdp).await.expect("answer");
    conn.process_answer(&answer.sdp, "bob", None)
        .await
        .expect("answer applied");
    assert!(conn.wait_for(ConnectionState::Connected, Duration::from_secs(1)).await);
    eventually(|| conn.buffered_len() == 0).await;
    let channel = second.mock.channel().expect("offer channel");
    assert_eq!(channel.sent(), vec![Bytes::from_static(b"queued")]);
    assert_eq!(conn.rotation_attempts(), 0);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn rotation_is_refused_while_busy_and_past_the_limit() {
    let server = MemoryRendezvous::new();
    let factory = MockTransportFactory::manual();
    let alice = server.session("alice");
    let config = ConnectionConfig {
        max_rotation_attempts: 1,
        ..quick_config()
    };
    let (conn, _, _) = offerer(&factory, &alice, config).await;

    {
        let _held = conn.inner.rotation_lock.try_acquire().expect("lock free");
        let busy = publish(&factory, &alice).await;
        let err = conn
            .rebind_to_offer(busy.offer_id, busy.local)
            .await
            .expect_err("rotation in progress");
        assert!(matches!(err, RendezvousError::RotationInProgress));
        assert!(busy.mock.is_closed());
        assert_eq!(conn.rotation_attempts(), 0);
    }

    let next = publish(&factory, &alice).await;
    conn.rebind_to_offer(next.offer_id.clone(), next.local)
        .await
        .expect("first rotation");

    let over = publish(&factory, &alice).await;
    let err = conn
        .rebind_to_offer(over.offer_id, over.local)
        .await
        .expect_err("limit reached");
    assert!(matches!(err, RendezvousError::RotationLimit { attempts: 1 }));
    assert!(over.mock.is_closed());
    assert_eq!(conn.offer_id(), next.offer_id);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn answerer_rejects_offerer_operations() {
    let server = MemoryRendezvous::new();
    let factory = Arc::new(MockTransportFactory::manual());
    let alice = server.session("alice");
    publish(&factory, &alice).await;
    let conn = answerer(&server, &factory, quick_config()).await;
    assert_eq!(conn.role(), Role::Answerer);
    assert_eq!(conn.peer_identity().as_deref(), Some("alice"));
    assert_eq!(conn.state(), ConnectionState::Signaling);

    let err = conn
        .process_answer("mock-answer:1:1", "carol", None)
        .await
        .expect_err("answerers take no answers");
    assert!(matches!(err, RendezvousError::WrongRole { .. }));

    let fresh = publish(&factory, &alice).await;
    let err = conn
        .rebind_to_offer(fresh.offer_id, fresh.local)
        .await
        .expect_err("answerers do not rotate");
    assert!(matches!(err, RendezvousError::WrongRole { .. }));
    assert!(fresh.mock.is_closed());
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn remote_candidates_are_filtered_by_role_and_applied_once() {
    let server = MemoryRendezvous::new();
    let factory = Arc::new(MockTransportFactory::manual());
    let alice = server.session("alice");
    publish(&factory, &alice).await;
    let conn = answerer(&server, &factory, quick_config()).await;

    let remote = |candidate: &str, role| RemoteCandidate {
        candidate: IceCandidate::new(candidate),
        role,
        created_at: 1,
    };
    let batch = [
        remote("candidate:offerer-1", CandidateRole::Offerer),
        remote("candidate:offerer-1", CandidateRole::Offerer),
        remote("candidate:answerer-1", CandidateRole::Answerer),
    ];
    assert_eq!(conn.add_remote_candidates(&batch).await, 1);
    assert_eq!(conn.add_remote_candidates(&batch[..1]).await, 0);

    let transport = factory.answers()[0].clone();
    let applied: Vec<String> = transport
        .remote_candidates()
        .into_iter()
        .map(|candidate| candidate.candidate)
        .collect();
    assert_eq!(applied, vec!["candidate:offerer-1".to_string()]);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn rejected_candidate_is_applied_on_redelivery() {
    let server = MemoryRendezvous::new();
    let factory = Arc::new(MockTransportFactory::manual());
    let alice = server.session("alice");
    publish(&factory, &alice).await;
    let conn = answerer(&server, &factory, quick_config()).await;
    let transport = factory.answers()[0].clone();

    let batch = [RemoteCandidate {
        candidate: IceCandidate::new("candidate:offerer-1"),
        role: CandidateRole::Offerer,
        created_at: 1,
    }];
    transport.fail_next_candidates(1);
    assert_eq!(conn.add_remote_candidates(&batch).await, 0);
    assert!(transport.remote_candidates().is_empty());

    assert_eq!(conn.add_remote_candidates(&batch).await, 1);
    assert_eq!(conn.add_remote_candidates(&batch).await, 0);
    assert_eq!(transport.remote_candidates().len(), 1);
}

async fn gathering_connection(
    factory: &MockTransportFactory,
    signaling: &MemorySignaling,
    config: ConnectionConfig,
) -> (Connection, Arc<MockTransport>) {
    factory.hold_gathering();
    let local = factory.create_offer().await.expect("offer");
    let mock = factory.offer_for_sdp(&local.sdp).expect("mock transport");
    let conn =
        Connection::offerer_unbound("offer-gathering".into(), Arc::new(signaling.clone()), config);
    conn.bind_transport(&local.transport, local.channel.as_ref());
    assert!(conn.wait_for(ConnectionState::Gathering, Duration::from_millis(100)).await);
    (conn, mock)
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn stalled_gathering_fails_at_the_ice_timeout() {
    let server = MemoryRendezvous::new();
    let factory = MockTransportFactory::manual();
    let config = ConnectionConfig {
        ice_gathering_timeout: Duration::from_secs(2),
        ..quick_config()
    };
    let (conn, _mock) = gathering_connection(&factory, &server.session("alice"), config).await;
    let mut events = conn.subscribe();

    tokio::time::sleep(Duration::from_millis(1_900)).await;
    assert_eq!(conn.state(), ConnectionState::Gathering);

    assert!(conn.wait_for(ConnectionState::Failed, Duration::from_millis(500)).await);
    let reasons: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            ConnectionEvent::Failed { reason } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec!["ice gathering timeout".to_string()]);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn finished_gathering_disarms_the_ice_timeout() {
    let server = MemoryRendezvous::new();
    let factory = MockTransportFactory::manual();
    let config = ConnectionConfig {
        ice_gathering_timeout: Duration::from_secs(2),
        ..quick_config()
    };
    let (conn, mock) = gathering_connection(&factory, &server.session("alice"), config).await;

    mock.finish_gathering();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(conn.state(), ConnectionState::Gathering);
    conn.close().await;
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn close_clears_the_buffer_unless_preserved() {
    let server = MemoryRendezvous::new();
    let factory = MockTransportFactory::manual();
    let alice = server.session("alice");

    let (cleared, _, mock) = offerer(&factory, &alice, quick_config()).await;
    cleared.send("pending").await.expect("send");
    cleared.close().await;
    cleared.close().await;
    assert_eq!(cleared.state(), ConnectionState::Closed);
    assert_eq!(cleared.buffered_len(), 0);
    assert!(mock.is_closed());
    assert!(matches!(
        cleared.send("late").await,
        Err(RendezvousError::Closed)
    ));

    let config = ConnectionConfig {
        preserve_buffer_on_close: true,
        ..quick_config()
    };
    let (kept, _, _) = offerer(&factory, &alice, config).await;
    kept.send("pending").await.expect("send");
    kept.close().await;
    assert_eq!(kept.buffered_len(), 1);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn answerer_reconnects_to_a_fresh_offer_from_the_same_peer() {
    let server = MemoryRendezvous::new();
    let factory = Arc::new(MockTransportFactory::new());
    let alice = server.session("alice");
    let first = publish(&factory, &alice).await;
    let conn = answerer(&server, &factory, quick_config()).await;
    accept_on_host(&alice, &first.offer_id, &first.mock).await;
    assert!(conn.wait_for(ConnectionState::Connected, Duration::from_secs(1)).await);
    let mut events = conn.subscribe();

    let second = publish(&factory, &alice).await;
    first.mock.close().await;
    eventually(|| {
        conn.offer_id() == second.offer_id && conn.state() == ConnectionState::Signaling
    })
    .await;
    assert_eq!(conn.reconnect_attempts(), 1);
    assert_eq!(server.answerer_of(&second.offer_id).as_deref(), Some("bob"));

    accept_on_host(&alice, &second.offer_id, &second.mock).await;
    assert!(conn.wait_for(ConnectionState::Connected, Duration::from_secs(1)).await);
    assert_eq!(conn.reconnect_attempts(), 0);

    let seen = drain(&mut events);
    let order = states(&seen);
    let position = |state| order.iter().position(|s| *s == state);
    assert!(position(ConnectionState::Disconnected) < position(ConnectionState::Reconnecting));
    assert!(position(ConnectionState::Reconnecting) < position(ConnectionState::Signaling));
    assert!(seen.iter().any(|event| matches!(
        event,
        ConnectionEvent::ReconnectScheduled { attempt: 1, .. }
    )));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn answerer_gives_up_after_max_reconnect_attempts() {
    let server = MemoryRendezvous::new();
    let factory = Arc::new(MockTransportFactory::new());
    let alice = server.session("alice");
    let first = publish(&factory, &alice).await;
    let config = ConnectionConfig {
        max_reconnect_attempts: 2,
        ..quick_config()
    };
    let conn = answerer(&server, &factory, config).await;
    accept_on_host(&alice, &first.offer_id, &first.mock).await;
    assert!(conn.wait_for(ConnectionState::Connected, Duration::from_secs(1)).await);
    let mut events = conn.subscribe();

    first.mock.close().await;
    let attempts = loop {
        match events.recv().await.expect("event") {
            ConnectionEvent::ReconnectExhausted { attempts } => break attempts,
            _ => continue,
        }
    };
    assert_eq!(attempts, 2);
    assert_eq!(conn.state(), ConnectionState::Failed);
    assert_eq!(conn.reconnect_attempts(), 2);
}
