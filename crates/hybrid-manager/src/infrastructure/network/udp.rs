//! The manager's UDP socket: binding with an ephemeral fallback and the
//! datagram receive loop.
//!
//! One socket serves every connection.  Each datagram starts with the
//! receiver's connection id, so routing happens after the read, in the
//! manager.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use crate::error::ManagerError;

/// Largest datagram the loop accepts; anything longer is truncated by the OS.
const RECV_BUFFER: usize = 65_536;

/// Binds `ip:port`, falling back to an OS-chosen port if `port` is taken.
///
/// # Errors
///
/// Returns [`ManagerError::Bind`] if even the ephemeral bind fails.
pub(crate) async fn bind_with_fallback(ip: IpAddr, port: u16) -> Result<UdpSocket, ManagerError> {
    let requested = SocketAddr::new(ip, port);
    match UdpSocket::bind(requested).await {
        Ok(socket) => Ok(socket),
        Err(e) if port != 0 => {
            warn!("UDP port {port} unavailable ({e}); falling back to an ephemeral port");
            let fallback = SocketAddr::new(ip, 0);
            UdpSocket::bind(fallback)
                .await
                .map_err(|source| ManagerError::Bind { addr: fallback, source })
        }
        Err(source) => Err(ManagerError::Bind { addr: requested, source }),
    }
}

/// Receives datagrams until `on_datagram` breaks or the socket fails hard.
pub(crate) async fn recv_loop<F>(socket: Arc<UdpSocket>, mut on_datagram: F)
where
    F: FnMut(&[u8], SocketAddr) -> ControlFlow<()>,
{
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) if is_transient(&e) => continue,
            Err(e) => {
                error!("UDP receive failed, stopping receive loop: {e}");
                return;
            }
        };
        if on_datagram(&buf[..len], src).is_break() {
            info!("UDP receive loop stopped");
            return;
        }
    }
}

/// Errors that leave the socket usable.
///
/// Windows reports an ICMP port-unreachable from an earlier send as
/// `ConnectionReset` on the next receive.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
