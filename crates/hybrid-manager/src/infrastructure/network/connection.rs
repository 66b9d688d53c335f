//! Per-connection state and the stream transport tasks behind it.
//!
//! Every established TCP connection is served by two Tokio tasks:
//!
//! - a **writer** that drains an unbounded channel of pre-framed byte buffers
//!   into the socket's write half, and shuts the write half down once the
//!   channel closes, and
//! - a **reader** (driven by the manager) that pulls frames out of a
//!   [`FrameReader`] until EOF, an I/O error, or a local close signal.
//!
//! Sending therefore never blocks the caller: `send_tcp` only pushes bytes
//! into the channel.  Frames already queued when the connection is closed
//! locally are still flushed before the FIN goes out.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use hybrid_core::{encode_frame, ConnectionId, FrameDecoder, UdpReliability};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::debug;

use crate::application::handler::ErasedHandler;
use crate::error::ManagerError;

const READ_CHUNK: usize = 8 * 1024;

// ── FrameReader ───────────────────────────────────────────────────────────────

/// Async adapter turning a byte stream into length-prefixed frames.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; READ_CHUNK],
        }
    }

    /// Returns the next complete frame payload, or `Ok(None)` on a clean EOF.
    ///
    /// # Errors
    ///
    /// - [`io::ErrorKind::InvalidData`] if the peer announces a frame larger
    ///   than the frame-size ceiling.
    /// - [`io::ErrorKind::UnexpectedEof`] if the stream ends mid-frame.
    /// - Any error from the underlying reader.
    pub async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self
                .decoder
                .next_frame()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            {
                return Ok(Some(frame));
            }

            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                return if self.decoder.buffered() == 0 {
                    Ok(None)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("stream closed with {} bytes of a partial frame", self.decoder.buffered()),
                    ))
                };
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }
}

// ── Writer task ───────────────────────────────────────────────────────────────

/// Drains `rx` into `writer`, then shuts the writer down.
pub(crate) async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>, peer: SocketAddr)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!("write to {peer} failed: {e}");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

// ── Connection ────────────────────────────────────────────────────────────────

/// An established connection as stored in the registry.
pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    /// Distinguishes this connection from a later one that reuses `id`.
    pub(crate) serial: u64,
    pub(crate) handler: Arc<dyn ErasedHandler>,
    pub(crate) peer: SocketAddr,
    pub(crate) remote_udp_port: Option<u16>,
    pub(crate) remote_id: Option<ConnectionId>,
    pub(crate) reliability: UdpReliability,
    /// Set once the handler has seen `new_connection` or
    /// `connection_complete`; datagrams are dropped until then.
    pub(crate) announced: bool,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    close_tx: Option<oneshot::Sender<()>>,
    check_timer: Option<AbortHandle>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        serial: u64,
        handler: Arc<dyn ErasedHandler>,
        peer: SocketAddr,
        reliability: UdpReliability,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        close_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            id,
            serial,
            handler,
            peer,
            remote_udp_port: None,
            remote_id: None,
            reliability,
            announced: false,
            outbound,
            close_tx: Some(close_tx),
            check_timer: None,
        }
    }

    /// Frames `payload` and queues it on the writer task.
    pub(crate) fn send_frame(&self, payload: &[u8]) -> Result<(), ManagerError> {
        let frame = encode_frame(payload)?;
        self.outbound
            .send(frame)
            .map_err(|_| ManagerError::ConnectionClosed(self.id))
    }

    /// Peer UDP address and the id the peer wants on its datagrams, once
    /// `NotifyUdpInfo` has arrived.
    pub(crate) fn udp_target(&self) -> Option<(SocketAddr, ConnectionId)> {
        let port = self.remote_udp_port?;
        let remote_id = self.remote_id?;
        Some((SocketAddr::new(self.peer.ip(), port), remote_id))
    }

    /// Replaces the armed check timer, cancelling the previous one.
    pub(crate) fn set_check_timer(&mut self, timer: AbortHandle) {
        self.cancel_check_timer();
        self.check_timer = Some(timer);
    }

    pub(crate) fn cancel_check_timer(&mut self) {
        if let Some(timer) = self.check_timer.take() {
            timer.abort();
        }
    }

    /// Stops timers and tells the reader task to stop.
    pub(crate) fn close(&mut self) {
        self.cancel_check_timer();
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
