//! The hybrid TCP/UDP network manager.
//!
//! A [`NetworkManager`] owns one TCP listener (optional), one UDP socket, the
//! handler table and every connection.  Each connection is a TCP stream used
//! for ordered traffic plus a best-effort UDP path to the same peer that is
//! continuously verified with a ping/ack cycle.
//!
//! # Handshake (for beginners)
//!
//! ```text
//!   connector (B)                               acceptor (A)
//!   ─────────────                               ────────────
//!   connect() → id_B allocated
//!   TCP connect ───────────────────────────────► accept
//!   frame 1: greeting "game" ──────────────────► look up handler by greeting
//!                                                unknown → close, no callback
//!                                                known   → allocate id_A
//!   frame 2: NotifyUdpInfo(udp_B, id_B) ───────►
//!   connection_complete(id_B)            ◄────── NotifyUdpInfo(udp_A, id_A)
//!                                                new_connection(id_A, peer)
//! ```
//!
//! After the handshake each side knows the other's UDP port and the id the
//! other side wants stamped on datagrams addressed to it (`remote_id`).
//! Receiving `NotifyUdpInfo` immediately starts a reliability check; until
//! one succeeds, [`NetworkManager::send`] routes everything over TCP.
//!
//! # Concurrency
//!
//! All bookkeeping sits behind one `parking_lot::Mutex`, so id allocation and
//! registry insertion are atomic.  The lock is never held across an `.await`
//! or while a handler callback runs.  Background tasks (accept loop, UDP
//! receive loop, per-connection reader/writer, check timers) hold only a
//! `Weak` reference to the manager and stop once every handle is dropped.

use std::any::{type_name, TypeId};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::time::Duration;

use hybrid_core::protocol::framing::MAX_DATAGRAM_PAYLOAD;
use hybrid_core::{
    decode_datagram, encode_datagram, CheckOutcome, ConnectionId, ControlMessage, Decoded,
    MessageVocabulary, ReliabilityConfig, UdpReliability,
};
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::application::handler::{erase, handler_ptr, ErasedHandler, Handler};
use crate::application::registry::{ConnectionRegistry, Entry};
use crate::error::ManagerError;
use crate::infrastructure::network::connection::{write_loop, Connection, FrameReader};
use crate::infrastructure::network::udp;

/// Default limit for an outbound TCP connect.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(7);

/// Pause after a failed `accept()` so a persistent error (e.g. out of file
/// descriptors) does not spin the accept loop.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

// ── Configuration ─────────────────────────────────────────────────────────────

/// Everything [`NetworkManager::listen_with`] needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenConfig {
    /// Address both sockets bind to.
    pub bind_address: IpAddr,
    /// TCP listening port; `None` disables inbound connections.
    pub tcp_port: Option<u16>,
    /// Requested UDP port; `0` or an unavailable port yields an ephemeral one.
    pub udp_port: u16,
    /// Used by `connect`, and as the greeting deadline for inbound streams.
    pub connect_timeout: Duration,
    pub reliability: ReliabilityConfig,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port: None,
            udp_port: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reliability: ReliabilityConfig::default(),
        }
    }
}

// ── Internal state ────────────────────────────────────────────────────────────

/// An outbound attempt waiting for its TCP connect to finish.
struct PendingAttempt {
    handler: Arc<dyn ErasedHandler>,
    addr: SocketAddr,
    task: Option<AbortHandle>,
}

struct State {
    registry: ConnectionRegistry<PendingAttempt, Connection>,
    tcp_port: Option<u16>,
    accept_task: Option<AbortHandle>,
    udp_task: Option<AbortHandle>,
    last_serial: u64,
}

impl State {
    fn next_serial(&mut self) -> u64 {
        self.last_serial += 1;
        self.last_serial
    }
}

struct Inner {
    state: Mutex<State>,
    udp: Arc<UdpSocket>,
    udp_port: u16,
    config: ListenConfig,
    runtime: Handle,
}

/// Serial and handler of a freshly established connection.
type Bound = (u64, Arc<dyn ErasedHandler>);

/// Where `send` routes a message.
enum Route {
    Tcp,
    Udp(SocketAddr, ConnectionId),
}

// ── Public handle ─────────────────────────────────────────────────────────────

/// Cheaply cloneable handle to one manager instance.
///
/// Every method except the `listen` constructors is synchronous and returns
/// immediately; connection progress is reported through [`Handler`]
/// callbacks.  Dropping the last handle stops all background tasks.
#[derive(Clone)]
pub struct NetworkManager {
    inner: Arc<Inner>,
}

impl NetworkManager {
    /// Binds a TCP listener (if `tcp_port` is `Some`) and a UDP socket on all
    /// interfaces.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Bind`] if the TCP port cannot be bound, or if
    /// the UDP socket cannot be bound even on an ephemeral port.
    pub async fn listen(tcp_port: Option<u16>, udp_port: u16) -> Result<Self, ManagerError> {
        Self::listen_with(ListenConfig {
            tcp_port,
            udp_port,
            ..ListenConfig::default()
        })
        .await
    }

    /// Like [`listen`](Self::listen) with full control over the configuration.
    ///
    /// Must be called from within a Tokio runtime; the manager spawns its
    /// background tasks on that runtime.
    ///
    /// # Errors
    ///
    /// As [`listen`](Self::listen), plus [`ManagerError::InvalidReliability`]
    /// before anything is bound if `config.reliability` is out of range.
    pub async fn listen_with(config: ListenConfig) -> Result<Self, ManagerError> {
        config.reliability.validate()?;
        let udp_socket = udp::bind_with_fallback(config.bind_address, config.udp_port).await?;
        let udp_port = udp_socket.local_addr()?.port();

        let listener = match config.tcp_port {
            Some(port) => {
                let addr = SocketAddr::new(config.bind_address, port);
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|source| ManagerError::Bind { addr, source })?;
                Some(listener)
            }
            None => None,
        };
        let tcp_port = match &listener {
            Some(l) => Some(l.local_addr()?.port()),
            None => None,
        };

        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                registry: ConnectionRegistry::new(),
                tcp_port,
                accept_task: None,
                udp_task: None,
                last_serial: 0,
            }),
            udp: Arc::new(udp_socket),
            udp_port,
            config,
            runtime: Handle::current(),
        });

        let weak = Arc::downgrade(&inner);
        let udp_task = inner
            .runtime
            .spawn(udp_receive(Arc::clone(&inner.udp), weak.clone()));
        let accept_task = listener.map(|l| inner.runtime.spawn(accept_loop(l, weak)));
        {
            let mut st = inner.state.lock();
            st.udp_task = Some(udp_task.abort_handle());
            st.accept_task = accept_task.map(|t| t.abort_handle());
        }

        match tcp_port {
            Some(port) => info!("listening on TCP {port}, UDP {udp_port}"),
            None => info!("UDP bound on {udp_port}; inbound TCP disabled"),
        }
        Ok(Self { inner })
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    /// Registers `handler` under its greeting.
    ///
    /// # Errors
    ///
    /// [`ManagerError::DuplicateHandler`] if the greeting is taken.
    pub fn add_handler<H: Handler>(&self, handler: Arc<H>) -> Result<(), ManagerError> {
        let greeting = handler.greeting().to_string();
        self.inner.state.lock().registry.add_handler(erase(handler))?;
        debug!("registered handler for greeting {greeting:?}");
        Ok(())
    }

    /// Unregisters `handler`.  Existing connections keep their handler.
    ///
    /// # Errors
    ///
    /// [`ManagerError::UnknownHandler`] if this instance is not registered.
    pub fn remove_handler<H: Handler>(&self, handler: &Arc<H>) -> Result<(), ManagerError> {
        self.inner
            .state
            .lock()
            .registry
            .remove_handler(handler.greeting(), handler_ptr(handler))?;
        debug!("unregistered handler for greeting {:?}", handler.greeting());
        Ok(())
    }

    // ── Connections ───────────────────────────────────────────────────────────

    /// Starts connecting to `addr` with the configured timeout.
    ///
    /// See [`connect_with_timeout`](Self::connect_with_timeout).
    pub fn connect<H: Handler>(&self, handler: Arc<H>, addr: SocketAddr) -> Result<ConnectionId, ManagerError> {
        self.connect_with_timeout(handler, addr, self.inner.config.connect_timeout)
    }

    /// Allocates an id and starts an asynchronous connect to `addr`.
    ///
    /// The id is returned immediately.  On success the greeting and
    /// `NotifyUdpInfo` are sent and `handler.connection_complete(id)` runs; on
    /// failure or timeout the id is freed and `handler.connection_failed(id)`
    /// runs.  `handler` does not need to be registered with
    /// [`add_handler`](Self::add_handler).
    ///
    /// # Errors
    ///
    /// [`ManagerError::IdSpaceExhausted`] if no id is free.
    pub fn connect_with_timeout<H: Handler>(
        &self,
        handler: Arc<H>,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<ConnectionId, ManagerError> {
        let mut st = self.inner.state.lock();
        let id = st.registry.reserve(PendingAttempt {
            handler: erase(handler),
            addr,
            task: None,
        })?;
        let task = self
            .inner
            .runtime
            .spawn(run_outgoing(Arc::downgrade(&self.inner), id, addr, timeout));
        if let Some(attempt) = st.registry.pending_mut(id) {
            attempt.task = Some(task.abort_handle());
        }
        drop(st);
        debug!("connection {id}: connecting to {addr}");
        Ok(id)
    }

    /// `true` once the handshake for `id` has completed and until it closes.
    pub fn is_connection_valid(&self, id: ConnectionId) -> bool {
        self.inner.state.lock().registry.is_established(id)
    }

    /// Closes `id`'s transport and forgets it.
    ///
    /// No-op for unknown or still-pending ids.  `connection_lost` is reported
    /// later by the connection's reader task, not from inside this call.
    pub fn close_connection(&self, id: ConnectionId) {
        let removed = self.inner.state.lock().registry.remove_established(id);
        if let Some(mut conn) = removed {
            conn.close();
            info!("connection {id}: closing");
        }
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Sends `message` over the stream transport.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::UnknownConnection`] / [`ManagerError::NotEstablished`]
    /// - [`ManagerError::VocabularyMismatch`] if `M` is not the handler's vocabulary
    /// - [`ManagerError::Protocol`] if the message cannot be encoded
    /// - [`ManagerError::ConnectionClosed`] if the writer has already stopped
    pub fn send_tcp<M: MessageVocabulary>(&self, id: ConnectionId, message: &M) -> Result<(), ManagerError> {
        let payload = message.encode()?;
        let st = self.inner.state.lock();
        let conn = st.registry.connection(id)?;
        check_vocabulary::<M>(conn)?;
        conn.send_frame(&payload)
    }

    /// Sends `message` as a single datagram, whether or not UDP is verified.
    ///
    /// # Errors
    ///
    /// As [`send_tcp`](Self::send_tcp), plus
    /// [`ManagerError::UdpInfoUnavailable`] before the peer's
    /// `NotifyUdpInfo` has arrived.
    pub fn send_udp<M: MessageVocabulary>(&self, id: ConnectionId, message: &M) -> Result<(), ManagerError> {
        let payload = message.encode()?;
        let (addr, remote_id) = {
            let st = self.inner.state.lock();
            let conn = st.registry.connection(id)?;
            check_vocabulary::<M>(conn)?;
            conn.udp_target().ok_or(ManagerError::UdpInfoUnavailable(id))?
        };
        self.inner.send_datagram(addr, remote_id, &payload)
    }

    /// Sends over UDP when the path is verified, otherwise over TCP.
    ///
    /// Payloads too large for one datagram always go over TCP.
    ///
    /// # Errors
    ///
    /// As [`send_tcp`](Self::send_tcp).
    pub fn send<M: MessageVocabulary>(&self, id: ConnectionId, message: &M) -> Result<(), ManagerError> {
        let payload = message.encode()?;
        let route = {
            let st = self.inner.state.lock();
            let conn = st.registry.connection(id)?;
            check_vocabulary::<M>(conn)?;
            match conn.udp_target() {
                Some((addr, remote_id))
                    if conn.reliability.is_verified() && payload.len() <= MAX_DATAGRAM_PAYLOAD =>
                {
                    Route::Udp(addr, remote_id)
                }
                _ => {
                    conn.send_frame(&payload)?;
                    Route::Tcp
                }
            }
        };
        match route {
            Route::Tcp => Ok(()),
            Route::Udp(addr, remote_id) => self.inner.send_datagram(addr, remote_id, &payload),
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// Peer address of an established connection.
    pub fn get_address(&self, id: ConnectionId) -> Result<SocketAddr, ManagerError> {
        Ok(self.inner.state.lock().registry.connection(id)?.peer)
    }

    /// `true` if the last UDP reliability check on `id` succeeded.
    pub fn get_udp_status(&self, id: ConnectionId) -> bool {
        self.inner
            .state
            .lock()
            .registry
            .connection(id)
            .map(|c| c.reliability.is_verified())
            .unwrap_or(false)
    }

    /// The id the peer asked us to stamp on datagrams for `id`, once known.
    pub fn get_remote_id(&self, id: ConnectionId) -> Option<ConnectionId> {
        self.inner.state.lock().registry.connection(id).ok()?.remote_id
    }

    /// The bound TCP port, or `None` when not listening (or after [`kill`](Self::kill)).
    pub fn get_tcp_port(&self) -> Option<u16> {
        self.inner.state.lock().tcp_port
    }

    /// The actually bound UDP port.
    pub fn get_udp_port(&self) -> u16 {
        self.inner.udp_port
    }

    /// Snapshot of established connection ids, ascending.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.state.lock().registry.established_ids()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Stops accepting inbound connections; existing ones are unaffected.
    pub fn kill(&self) {
        let mut st = self.inner.state.lock();
        if let Some(task) = st.accept_task.take() {
            task.abort();
            info!("stopped accepting TCP connections on port {:?}", st.tcp_port);
        }
        st.tcp_port = None;
    }

    /// [`kill`](Self::kill), then close every connection, cancel pending
    /// attempts and stop the UDP receive loop.
    ///
    /// Established connections still report `connection_lost`; cancelled
    /// attempts report `connection_failed`.
    pub fn shutdown(&self) {
        self.kill();
        let (entries, udp_task) = {
            let mut st = self.inner.state.lock();
            (st.registry.drain(), st.udp_task.take())
        };
        if let Some(task) = udp_task {
            task.abort();
        }
        for (id, entry) in entries {
            match entry {
                Entry::Established(mut conn) => conn.close(),
                Entry::Pending(attempt) => {
                    if let Some(task) = attempt.task {
                        task.abort();
                    }
                    debug!("connection {id}: attempt to {} cancelled", attempt.addr);
                    attempt.handler.connection_failed(self, id);
                }
            }
        }
        info!("network manager shut down");
    }
}

impl fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("NetworkManager")
            .field("tcp_port", &st.tcp_port)
            .field("udp_port", &self.inner.udp_port)
            .field("entries", &st.registry.len())
            .finish()
    }
}

fn check_vocabulary<M: MessageVocabulary>(conn: &Connection) -> Result<(), ManagerError> {
    if conn.handler.message_type() == TypeId::of::<M>() {
        Ok(())
    } else {
        Err(ManagerError::VocabularyMismatch {
            id: conn.id,
            expected: conn.handler.message_type_name(),
            actual: type_name::<M>(),
        })
    }
}

/// Compares hosts, treating IPv4-mapped IPv6 addresses as IPv4.
fn same_host(a: IpAddr, b: IpAddr) -> bool {
    a.to_canonical() == b.to_canonical()
}

// ── Manager internals ─────────────────────────────────────────────────────────

impl Inner {
    fn handle(self: &Arc<Self>) -> NetworkManager {
        NetworkManager {
            inner: Arc::clone(self),
        }
    }

    fn new_reliability(&self) -> UdpReliability {
        UdpReliability::new(self.config.reliability.clone())
    }

    /// Our `NotifyUdpInfo` for the connection the peer knows as `id`.
    fn udp_info(&self, id: ConnectionId) -> Vec<u8> {
        ControlMessage::NotifyUdpInfo {
            udp_port: self.udp_port,
            remote_id: id,
        }
        .encode()
    }

    fn send_datagram(&self, addr: SocketAddr, remote_id: ConnectionId, payload: &[u8]) -> Result<(), ManagerError> {
        let datagram = encode_datagram(remote_id, payload)?;
        match self.udp.try_send_to(&datagram, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("UDP send buffer full; dropping {} byte datagram to {addr}", datagram.len());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Inbound handshake ─────────────────────────────────────────────────────

    /// Binds an accepted stream to the handler owning `greeting`.
    ///
    /// Returns `None` (and the stream is dropped) for unknown greetings or
    /// when no id is free.
    fn accept_greeting(
        &self,
        greeting: &[u8],
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        close_tx: oneshot::Sender<()>,
    ) -> Option<(ConnectionId, u64, Arc<dyn ErasedHandler>)> {
        let Ok(greeting) = std::str::from_utf8(greeting) else {
            warn!("{peer} sent a non-UTF-8 greeting; closing");
            return None;
        };
        let mut st = self.state.lock();
        let Some(handler) = st.registry.handler_for(greeting) else {
            warn!("{peer} sent unknown greeting {greeting:?}; closing");
            return None;
        };
        let id = match st.registry.allocate() {
            Ok(id) => id,
            Err(e) => {
                error!("refusing connection from {peer}: {e}");
                return None;
            }
        };
        let serial = st.next_serial();
        let conn = Connection::new(
            id,
            serial,
            Arc::clone(&handler),
            peer,
            self.new_reliability(),
            outbound,
            close_tx,
        );
        if let Err(e) = conn.send_frame(&self.udp_info(id)) {
            warn!("connection from {peer}: could not queue UDP info: {e}");
            return None;
        }
        st.registry.insert_established(id, conn);
        info!("connection {id}: accepted from {peer} for {greeting:?}");
        Some((id, serial, handler))
    }

    // ── Outbound handshake ────────────────────────────────────────────────────

    /// Promotes pending attempt `id` to an established connection and queues
    /// the greeting plus `NotifyUdpInfo`.
    ///
    /// `Ok(None)` means the attempt was cancelled meanwhile.  `Err` carries the
    /// handler to notify of a failed handshake.
    fn complete_outgoing(
        &self,
        id: ConnectionId,
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        close_tx: oneshot::Sender<()>,
    ) -> Result<Option<Bound>, Arc<dyn ErasedHandler>> {
        let mut st = self.state.lock();
        let Some(attempt) = st.registry.take_pending(id) else {
            return Ok(None);
        };
        let handler = attempt.handler;
        let serial = st.next_serial();
        let conn = Connection::new(
            id,
            serial,
            Arc::clone(&handler),
            peer,
            self.new_reliability(),
            outbound,
            close_tx,
        );
        let queued = conn
            .send_frame(handler.greeting().as_bytes())
            .and_then(|()| conn.send_frame(&self.udp_info(id)));
        if let Err(e) = queued {
            warn!("connection {id}: handshake to {peer} failed: {e}");
            return Err(handler);
        }
        st.registry.insert_established(id, conn);
        info!("connection {id}: connected to {peer}");
        Ok(Some((serial, handler)))
    }

    /// Frees pending attempt `id` and reports the failure.
    fn fail_outgoing(self: &Arc<Self>, id: ConnectionId) {
        let attempt = self.state.lock().registry.take_pending(id);
        if let Some(attempt) = attempt {
            attempt.handler.connection_failed(&self.handle(), id);
        }
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    fn dispatch(self: &Arc<Self>, id: ConnectionId, serial: u64, handler: &Arc<dyn ErasedHandler>, payload: &[u8]) {
        match handler.decode(payload) {
            Decoded::Control(message) => self.handle_control(id, serial, message),
            Decoded::Application(message) => handler.receive_message(&self.handle(), id, message),
            Decoded::Unrecognized(err) => handler.receive_bad_string(&self.handle(), id, payload, &err),
        }
    }

    fn on_datagram(self: &Arc<Self>, datagram: &[u8], src: SocketAddr) {
        let (id, payload) = match decode_datagram(datagram) {
            Ok(parts) => parts,
            Err(e) => {
                debug!("dropping malformed datagram from {src}: {e}");
                return;
            }
        };
        let target = {
            let st = self.state.lock();
            match st.registry.connection(id) {
                Ok(conn) if !conn.announced => {
                    debug!("dropping datagram for {id} from {src}; handler not yet told of the connection");
                    None
                }
                Ok(conn) if same_host(conn.peer.ip(), src.ip()) => Some((conn.serial, Arc::clone(&conn.handler))),
                Ok(conn) => {
                    debug!("dropping datagram for {id} from {src}; connection peer is {}", conn.peer);
                    None
                }
                Err(_) => {
                    debug!("dropping datagram from {src} for unknown connection {id}");
                    None
                }
            }
        };
        if let Some((serial, handler)) = target {
            self.dispatch(id, serial, &handler, payload);
        }
    }

    fn handle_control(self: &Arc<Self>, id: ConnectionId, serial: u64, message: ControlMessage) {
        let mut st = self.state.lock();
        let conn = match st.registry.connection_mut(id) {
            Ok(conn) if conn.serial == serial => conn,
            _ => return,
        };
        match message {
            ControlMessage::NotifyUdpInfo { udp_port, remote_id } => {
                debug!("connection {id}: peer UDP port {udp_port}, remote id {remote_id}");
                conn.remote_udp_port = Some(udp_port);
                conn.remote_id = Some(remote_id);
                conn.reliability.invalidate();
                self.check_udp(conn);
            }
            ControlMessage::UdpPing(counter) => match conn.udp_target() {
                Some((addr, remote_id)) => {
                    let ack = ControlMessage::UdpReceived(counter).encode();
                    if let Err(e) = self.send_datagram(addr, remote_id, &ack) {
                        debug!("connection {id}: could not acknowledge ping: {e}");
                    }
                }
                None => debug!("connection {id}: ping before UDP info; not acknowledged"),
            },
            ControlMessage::UdpReceived(counter) => {
                let was_verified = conn.reliability.is_verified();
                match conn.reliability.on_ack(counter) {
                    Some(CheckOutcome::Verified { next_check }) => {
                        if !was_verified {
                            info!("connection {id}: UDP path verified");
                        }
                        conn.cancel_check_timer();
                        self.schedule_check(conn, next_check);
                    }
                    _ => debug!("connection {id}: ignoring stale UdpReceived({counter})"),
                }
            }
        }
    }

    // ── Reliability check ─────────────────────────────────────────────────────

    /// Sends a fresh ping on `conn` and arms its timeout.  Caller holds the lock.
    fn check_udp(self: &Arc<Self>, conn: &mut Connection) {
        conn.cancel_check_timer();
        let Some((addr, remote_id)) = conn.udp_target() else {
            return;
        };
        let plan = conn.reliability.begin_check();
        let ping = ControlMessage::UdpPing(plan.counter).encode();
        if let Err(e) = self.send_datagram(addr, remote_id, &ping) {
            debug!("connection {}: ping {} not sent: {e}", conn.id, plan.counter);
        }

        let weak = Arc::downgrade(self);
        let (id, serial) = (conn.id, conn.serial);
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(plan.timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_ping_timeout(id, serial, plan.token);
            }
        });
        conn.set_check_timer(timer.abort_handle());
    }

    /// Arms a timer that starts the next check on `conn` after `delay`.
    fn schedule_check(self: &Arc<Self>, conn: &mut Connection, delay: Duration) {
        let weak = Arc::downgrade(self);
        let (id, serial) = (conn.id, conn.serial);
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.run_scheduled_check(id, serial);
            }
        });
        conn.set_check_timer(timer.abort_handle());
    }

    fn run_scheduled_check(self: &Arc<Self>, id: ConnectionId, serial: u64) {
        let mut st = self.state.lock();
        if let Ok(conn) = st.registry.connection_mut(id) {
            if conn.serial == serial {
                self.check_udp(conn);
            }
        }
    }

    fn on_ping_timeout(self: &Arc<Self>, id: ConnectionId, serial: u64, token: u64) {
        let mut st = self.state.lock();
        let conn = match st.registry.connection_mut(id) {
            Ok(conn) if conn.serial == serial => conn,
            _ => return,
        };
        let was_verified = conn.reliability.is_verified();
        if let Some(CheckOutcome::Failed { retry_after }) = conn.reliability.on_timeout(token) {
            if was_verified {
                warn!("connection {id}: UDP path lost; falling back to TCP");
            }
            debug!("connection {id}: UDP check failed; retrying in {retry_after:?}");
            self.schedule_check(conn, retry_after);
        }
    }

    /// Lets datagrams through to `id` now that its handler knows the id.
    fn mark_announced(&self, id: ConnectionId, serial: u64) {
        let mut st = self.state.lock();
        if let Ok(conn) = st.registry.connection_mut(id) {
            if conn.serial == serial {
                conn.announced = true;
            }
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Called once by each reader task when its stream ends.
    fn on_stream_closed(self: &Arc<Self>, id: ConnectionId, serial: u64, handler: &Arc<dyn ErasedHandler>) {
        let removed = {
            let mut st = self.state.lock();
            let current = st.registry.connection(id).is_ok_and(|c| c.serial == serial);
            if current {
                st.registry.remove_established(id)
            } else {
                None
            }
        };
        drop(removed);
        info!("connection {id}: lost");
        handler.connection_lost(&self.handle(), id);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        for task in [st.accept_task.take(), st.udp_task.take()].into_iter().flatten() {
            task.abort();
        }
        for (_, entry) in st.registry.drain() {
            if let Entry::Pending(PendingAttempt { task: Some(task), .. }) = entry {
                task.abort();
            }
        }
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, weak: Weak<Inner>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                debug!("TCP connection from {peer}");
                inner.runtime.spawn(run_incoming(weak.clone(), stream, peer));
            }
            Err(e) => {
                error!("accept error: {e}");
                tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
            }
        }
    }
}

async fn udp_receive(socket: Arc<UdpSocket>, weak: Weak<Inner>) {
    udp::recv_loop(socket, |datagram, src| match weak.upgrade() {
        Some(inner) => {
            inner.on_datagram(datagram, src);
            ControlFlow::Continue(())
        }
        None => ControlFlow::Break(()),
    })
    .await;
}

async fn run_incoming(weak: Weak<Inner>, stream: TcpStream, peer: SocketAddr) {
    let Some(deadline) = weak.upgrade().map(|inner| inner.config.connect_timeout) else {
        return;
    };
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);

    let greeting = match tokio::time::timeout(deadline, reader.next_frame()).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => {
            debug!("{peer} closed before sending a greeting");
            return;
        }
        Ok(Err(e)) => {
            debug!("{peer}: reading greeting failed: {e}");
            return;
        }
        Err(_) => {
            warn!("{peer} sent no greeting within {deadline:?}; closing");
            return;
        }
    };

    let Some(inner) = weak.upgrade() else {
        return;
    };
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = oneshot::channel();
    let Some((id, serial, handler)) = inner.accept_greeting(&greeting, peer, outbound, close_tx) else {
        return;
    };
    inner.runtime.spawn(write_loop(write_half, outbound_rx, peer));
    handler.new_connection(&inner.handle(), id, peer);
    inner.mark_announced(id, serial);
    drop(inner);

    read_loop(weak, reader, close_rx, id, serial, handler).await;
}

async fn run_outgoing(weak: Weak<Inner>, id: ConnectionId, addr: SocketAddr, timeout: Duration) {
    let result = tokio::time::timeout(timeout, TcpStream::connect(addr)).await;
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let stream = match result {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            info!("connection {id}: connect to {addr} failed: {e}");
            inner.fail_outgoing(id);
            return;
        }
        Err(_) => {
            info!("connection {id}: connect to {addr} timed out after {timeout:?}");
            inner.fail_outgoing(id);
            return;
        }
    };

    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = oneshot::channel();
    let (serial, handler) = match inner.complete_outgoing(id, addr, outbound, close_tx) {
        Ok(Some(bound)) => bound,
        Ok(None) => return,
        Err(handler) => {
            handler.connection_failed(&inner.handle(), id);
            return;
        }
    };
    inner.runtime.spawn(write_loop(write_half, outbound_rx, addr));
    handler.connection_complete(&inner.handle(), id);
    inner.mark_announced(id, serial);
    drop(inner);

    read_loop(weak, FrameReader::new(read_half), close_rx, id, serial, handler).await;
}

/// Dispatches frames until EOF, a transport error, or a local close.
async fn read_loop<R: AsyncRead + Unpin>(
    weak: Weak<Inner>,
    mut reader: FrameReader<R>,
    mut close_rx: oneshot::Receiver<()>,
    id: ConnectionId,
    serial: u64,
    handler: Arc<dyn ErasedHandler>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut close_rx => {
                debug!("connection {id}: closed locally");
                break;
            }
            frame = reader.next_frame() => frame,
        };
        match frame {
            Ok(Some(payload)) => match weak.upgrade() {
                Some(inner) => inner.dispatch(id, serial, &handler, &payload),
                None => return,
            },
            Ok(None) => {
                debug!("connection {id}: closed by peer");
                break;
            }
            Err(e) => {
                warn!("connection {id}: transport error: {e}");
                break;
            }
        }
    }
    if let Some(inner) = weak.upgrade() {
        inner.on_stream_closed(id, serial, &handler);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
