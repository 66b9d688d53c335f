//! Shared fixtures for the hybrid-manager integration tests.
//!
//! - [`Node`]: a manager on loopback with an event-reporting [`EchoHandler`].
//! - [`linked_pair`]: two nodes with one established connection.
//! - [`RawPeer`]: a hand-driven peer speaking the wire format over plain
//!   sockets, for tests that need to control every byte.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hybrid_core::{decode_datagram, encode_datagram, encode_frame, ConnectionId, FrameDecoder};
use hybrid_manager::{EchoEvent, EchoHandler, ListenConfig, NetworkManager};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Instant};

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Upper bound for anything a test waits on.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

// ── Managers ──────────────────────────────────────────────────────────────────

pub async fn start_manager(accept: bool) -> NetworkManager {
    NetworkManager::listen_with(ListenConfig {
        tcp_port: accept.then_some(0),
        ..ListenConfig::default()
    })
    .await
    .expect("manager must start")
}

/// Loopback address of `net`'s TCP listener.
pub fn tcp_addr(net: &NetworkManager) -> SocketAddr {
    SocketAddr::new(LOCALHOST, net.get_tcp_port().expect("manager must be listening"))
}

/// Loopback address of `net`'s UDP socket.
pub fn udp_addr(net: &NetworkManager) -> SocketAddr {
    SocketAddr::new(LOCALHOST, net.get_udp_port())
}

pub struct Node {
    pub net: NetworkManager,
    pub handler: Arc<EchoHandler>,
    pub events: UnboundedReceiver<EchoEvent>,
}

pub async fn node(greeting: &str, accept: bool) -> Node {
    let (handler, events) = EchoHandler::with_events(greeting);
    let handler = Arc::new(handler);
    let net = start_manager(accept).await;
    net.add_handler(Arc::clone(&handler)).expect("handler must register");
    Node { net, handler, events }
}

/// Two nodes where `b` connected to `a`; `a_id`/`b_id` are each side's id.
pub struct Linked {
    pub a: Node,
    pub b: Node,
    pub a_id: ConnectionId,
    pub b_id: ConnectionId,
}

pub async fn linked_pair(greeting: &str) -> Linked {
    let mut a = node(greeting, true).await;
    let mut b = node(greeting, false).await;

    let b_id = b
        .net
        .connect(Arc::clone(&b.handler), tcp_addr(&a.net))
        .expect("connect must start");
    expect_event(&mut b.events, |e| *e == EchoEvent::Complete(b_id)).await;
    let a_id = match expect_event(&mut a.events, |e| matches!(e, EchoEvent::NewConnection { .. })).await {
        EchoEvent::NewConnection { id, .. } => id,
        other => panic!("unexpected event {other:?}"),
    };
    Linked { a, b, a_id, b_id }
}

// ── Waiting helpers ───────────────────────────────────────────────────────────

/// Returns the first event matching `pred`, discarding others.
///
/// Panics if none arrives within [`EVENT_TIMEOUT`].
pub async fn expect_event(
    rx: &mut UnboundedReceiver<EchoEvent>,
    mut pred: impl FnMut(&EchoEvent) -> bool,
) -> EchoEvent {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = timeout(remaining, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

/// Collects every event matching `pred` that arrives within `window`.
pub async fn collect_events(
    rx: &mut UnboundedReceiver<EchoEvent>,
    window: Duration,
    mut pred: impl FnMut(&EchoEvent) -> bool,
) -> Vec<EchoEvent> {
    let deadline = Instant::now() + window;
    let mut matched = Vec::new();
    while let Ok(Some(event)) = timeout(deadline.saturating_duration_since(Instant::now()), rx.recv()).await {
        if pred(&event) {
            matched.push(event);
        }
    }
    matched
}

/// Polls `cond` every 10 ms until it holds or `limit` passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// ── Raw peer ──────────────────────────────────────────────────────────────────

/// A peer driven byte by byte over plain TCP and UDP sockets.
pub struct RawPeer {
    pub tcp: TcpStream,
    pub udp: UdpSocket,
    decoder: FrameDecoder,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self::connect_with_udp_ip(addr, LOCALHOST).await
    }

    /// Like [`connect`](Self::connect) with the UDP socket bound to `udp_ip`.
    pub async fn connect_with_udp_ip(addr: SocketAddr, udp_ip: IpAddr) -> Self {
        let tcp = TcpStream::connect(addr).await.expect("raw TCP connect");
        let udp = UdpSocket::bind((udp_ip, 0)).await.expect("raw UDP bind");
        Self {
            tcp,
            udp,
            decoder: FrameDecoder::new(),
        }
    }

    pub fn udp_port(&self) -> u16 {
        self.udp.local_addr().expect("bound").port()
    }

    pub async fn send_frame(&mut self, payload: &[u8]) {
        let frame = encode_frame(payload).expect("frame");
        self.tcp.write_all(&frame).await.expect("raw TCP write");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.tcp.write_all(bytes).await.expect("raw TCP write");
    }

    /// Next frame from the manager, or `None` once the stream is closed.
    pub async fn recv_frame(&mut self) -> Option<Vec<u8>> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.decoder.next_frame().expect("manager sent a bad frame") {
                return Some(frame);
            }
            let read = timeout(EVENT_TIMEOUT, self.tcp.read(&mut buf))
                .await
                .expect("timed out waiting for a frame");
            match read {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.decoder.extend(&buf[..n]),
            }
        }
    }

    pub async fn send_datagram(&self, to: SocketAddr, receiver: ConnectionId, payload: &[u8]) {
        let datagram = encode_datagram(receiver, payload).expect("datagram");
        self.udp.send_to(&datagram, to).await.expect("raw UDP send");
    }

    /// Next datagram, split into receiver id and payload.
    pub async fn recv_datagram(&self) -> (ConnectionId, Vec<u8>) {
        let mut buf = vec![0u8; 65_536];
        let (n, _) = timeout(EVENT_TIMEOUT, self.udp.recv_from(&mut buf))
            .await
            .expect("timed out waiting for a datagram")
            .expect("raw UDP receive");
        let (id, payload) = decode_datagram(&buf[..n]).expect("manager sent a bad datagram");
        (id, payload.to_vec())
    }
}
