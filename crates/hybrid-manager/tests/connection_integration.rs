//! End-to-end tests with two managers talking over loopback.
//!
//! Each test builds its own managers on ephemeral ports, so tests can run in
//! parallel.  Observations go through [`EchoHandler`]'s event channel.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{collect_events, expect_event, linked_pair, node, tcp_addr, wait_until, LOCALHOST};
use hybrid_core::{MessageVocabulary, ProtocolError};
use hybrid_manager::{EchoEvent, EchoMessage, ManagerError, Probe};
use tokio::time::Instant;

/// A vocabulary no handler in these tests speaks.
#[derive(Debug)]
struct Foreign;

impl MessageVocabulary for Foreign {
    fn identifier(&self) -> &'static str {
        "foreign"
    }
    fn encode_fields(&self, _buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        Ok(())
    }
    fn decode_fields(ident: &str, _fields: &[u8]) -> Result<Self, ProtocolError> {
        Err(ProtocolError::UnknownIdentifier(ident.to_string()))
    }
}

fn text(s: &str) -> EchoMessage {
    EchoMessage::Text(s.to_string())
}

// ── Handshake ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_handshake_is_symmetric() {
    // Arrange / Act
    let pair = linked_pair("game").await;

    // Assert – each side learns the other's id from NotifyUdpInfo
    let ok = wait_until(
        || {
            pair.a.net.get_remote_id(pair.a_id) == Some(pair.b_id)
                && pair.b.net.get_remote_id(pair.b_id) == Some(pair.a_id)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(ok, "remote ids must mirror each other's local ids");

    assert!(pair.a.net.is_connection_valid(pair.a_id));
    assert!(pair.b.net.is_connection_valid(pair.b_id));
    assert_eq!(pair.b.net.get_address(pair.b_id).unwrap(), tcp_addr(&pair.a.net));
    assert_eq!(pair.a.net.get_address(pair.a_id).unwrap().ip(), LOCALHOST);
}

#[tokio::test]
async fn test_new_connection_reports_peer_address() {
    // Arrange
    let mut a = node("game", true).await;
    let b = node("game", false).await;

    // Act
    b.net.connect(Arc::clone(&b.handler), tcp_addr(&a.net)).unwrap();
    let event = expect_event(&mut a.events, |e| matches!(e, EchoEvent::NewConnection { .. })).await;

    // Assert
    match event {
        EchoEvent::NewConnection { id, peer } => {
            assert_eq!(peer.ip(), LOCALHOST);
            assert_eq!(a.net.get_address(id).unwrap(), peer);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_connections_route_to_handler_by_greeting() {
    // Arrange – A serves two greetings
    let mut alpha = node("alpha", true).await;
    let (beta_handler, mut beta_events) = hybrid_manager::EchoHandler::with_events("beta");
    alpha.net.add_handler(Arc::new(beta_handler)).unwrap();
    let mut b = node("beta", false).await;

    // Act
    let b_id = b.net.connect(Arc::clone(&b.handler), tcp_addr(&alpha.net)).unwrap();
    expect_event(&mut b.events, |e| *e == EchoEvent::Complete(b_id)).await;

    // Assert
    expect_event(&mut beta_events, |e| matches!(e, EchoEvent::NewConnection { .. })).await;
    let stray = collect_events(&mut alpha.events, Duration::from_millis(200), |e| {
        matches!(e, EchoEvent::NewConnection { .. })
    })
    .await;
    assert!(stray.is_empty(), "alpha handler must not see a beta connection");
}

// ── UDP verification and sending ──────────────────────────────────────────────

#[tokio::test]
async fn test_udp_verification_converges_on_both_sides() {
    // Arrange
    let pair = linked_pair("game").await;

    // Act
    let verified = wait_until(
        || pair.a.net.get_udp_status(pair.a_id) && pair.b.net.get_udp_status(pair.b_id),
        Duration::from_secs(2),
    )
    .await;

    // Assert
    assert!(verified, "loopback UDP must verify within one ping timeout");
}

#[tokio::test]
async fn test_send_is_delivered_exactly_once() {
    // Arrange
    let mut pair = linked_pair("game").await;
    assert!(
        wait_until(|| pair.b.net.get_udp_status(pair.b_id), Duration::from_secs(2)).await,
        "UDP must verify first"
    );

    // Act
    pair.b.net.send(pair.b_id, &text("hello")).unwrap();

    // Assert
    let a_id = pair.a_id;
    let received = collect_events(&mut pair.a.events, Duration::from_millis(500), |e| {
        matches!(e, EchoEvent::Message { message: EchoMessage::Text(_), .. })
    })
    .await;
    assert_eq!(
        received,
        vec![EchoEvent::Message {
            id: a_id,
            message: text("hello"),
        }]
    );
}

#[tokio::test]
async fn test_send_before_verification_uses_tcp_and_arrives_in_order() {
    // Arrange – send immediately after the handshake; UDP may not be verified
    let mut pair = linked_pair("game").await;

    // Act
    for i in 0..20 {
        pair.b.net.send_tcp(pair.b_id, &text(&i.to_string())).unwrap();
    }

    // Assert – TCP preserves order
    let mut seen = Vec::new();
    while seen.len() < 20 {
        if let EchoEvent::Message {
            message: EchoMessage::Text(t),
            ..
        } = expect_event(&mut pair.a.events, |e| matches!(e, EchoEvent::Message { .. })).await
        {
            seen.push(t);
        }
    }
    let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_send_udp_delivers_once_udp_info_is_known() {
    // Arrange
    let mut pair = linked_pair("game").await;
    assert!(
        wait_until(|| pair.b.net.get_remote_id(pair.b_id).is_some(), Duration::from_secs(2)).await
    );

    // Act
    pair.b.net.send_udp(pair.b_id, &text("datagram")).unwrap();

    // Assert
    let a_id = pair.a_id;
    expect_event(&mut pair.a.events, |e| {
        *e == EchoEvent::Message {
            id: a_id,
            message: text("datagram"),
        }
    })
    .await;
}

#[tokio::test]
async fn test_ping_is_answered_with_matching_pong() {
    // Arrange
    let mut pair = linked_pair("game").await;
    let probe = Probe::now(41);

    // Act
    pair.b.net.send(pair.b_id, &EchoMessage::Ping(probe)).unwrap();

    // Assert
    let b_id = pair.b_id;
    expect_event(&mut pair.b.events, |e| {
        *e == EchoEvent::Message {
            id: b_id,
            message: EchoMessage::Pong(probe),
        }
    })
    .await;
}

#[tokio::test]
async fn test_foreign_vocabulary_is_rejected() {
    // Arrange
    let pair = linked_pair("game").await;

    // Act
    let tcp = pair.b.net.send_tcp(pair.b_id, &Foreign);
    let any = pair.b.net.send(pair.b_id, &Foreign);

    // Assert
    assert!(matches!(tcp, Err(ManagerError::VocabularyMismatch { .. })));
    assert!(matches!(any, Err(ManagerError::VocabularyMismatch { .. })));
}

// ── Closing ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_close_reports_lost_on_both_sides() {
    // Arrange
    let mut pair = linked_pair("game").await;
    let (a_id, b_id) = (pair.a_id, pair.b_id);

    // Act
    pair.b.net.close_connection(b_id);

    // Assert
    assert!(!pair.b.net.is_connection_valid(b_id), "local close removes the entry at once");
    expect_event(&mut pair.b.events, |e| *e == EchoEvent::Lost(b_id)).await;
    expect_event(&mut pair.a.events, |e| *e == EchoEvent::Lost(a_id)).await;
    assert!(!pair.a.net.is_connection_valid(a_id));
    assert!(matches!(
        pair.b.net.send(b_id, &text("late")),
        Err(ManagerError::UnknownConnection(_))
    ));
}

#[tokio::test]
async fn test_lost_is_reported_exactly_once() {
    // Arrange
    let mut pair = linked_pair("game").await;
    let b_id = pair.b_id;

    // Act – close twice, locally and via the peer
    pair.a.net.close_connection(pair.a_id);
    pair.b.net.close_connection(b_id);

    // Assert
    let lost = collect_events(&mut pair.b.events, Duration::from_millis(500), |e| {
        *e == EchoEvent::Lost(b_id)
    })
    .await;
    assert_eq!(lost.len(), 1);
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    // Arrange
    let mut pair = linked_pair("game").await;
    let (a_id, b_id) = (pair.a_id, pair.b_id);

    // Act
    pair.a.net.shutdown();

    // Assert
    assert_eq!(pair.a.net.get_tcp_port(), None);
    assert!(pair.a.net.connection_ids().is_empty());
    expect_event(&mut pair.a.events, |e| *e == EchoEvent::Lost(a_id)).await;
    expect_event(&mut pair.b.events, |e| *e == EchoEvent::Lost(b_id)).await;
}

#[tokio::test]
async fn test_kill_keeps_existing_connections_but_refuses_new_ones() {
    // Arrange
    let mut pair = linked_pair("game").await;
    let listen_addr = tcp_addr(&pair.a.net);

    // Act
    pair.a.net.kill();

    // Assert – existing link still works
    assert_eq!(pair.a.net.get_tcp_port(), None);
    pair.b.net.send_tcp(pair.b_id, &text("still here")).unwrap();
    let a_id = pair.a_id;
    expect_event(&mut pair.a.events, |e| {
        *e == EchoEvent::Message {
            id: a_id,
            message: text("still here"),
        }
    })
    .await;

    // Assert – a fresh connect is refused
    let id = pair.b.net.connect(Arc::clone(&pair.b.handler), listen_addr).unwrap();
    expect_event(&mut pair.b.events, |e| *e == EchoEvent::Failed(id)).await;
}

// ── Connect failures ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_timeout_reports_failure_and_frees_id() {
    // Arrange – a non-routable address never answers
    let mut b = node("game", false).await;
    let started = Instant::now();

    // Act
    let id = b
        .net
        .connect_with_timeout(
            Arc::clone(&b.handler),
            "10.255.255.1:9000".parse().unwrap(),
            Duration::from_secs(1),
        )
        .unwrap();

    // Assert
    expect_event(&mut b.events, |e| *e == EchoEvent::Failed(id)).await;
    assert!(started.elapsed() < Duration::from_secs(3), "failure must follow the 1 s timeout");
    assert!(matches!(
        b.net.send_tcp(id, &text("x")),
        Err(ManagerError::UnknownConnection(_))
    ));
}

#[tokio::test]
async fn test_duplicate_handler_is_rejected() {
    let a = node("game", false).await;
    let (dup, _events) = hybrid_manager::EchoHandler::with_events("game");
    assert!(matches!(
        a.net.add_handler(Arc::new(dup)),
        Err(ManagerError::DuplicateHandler(g)) if g == "game"
    ));
}
