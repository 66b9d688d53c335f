//! Reserved control messages exchanged by the connection managers themselves.
//!
//! Control identifiers all begin with [`CONTROL_SENTINEL`], a byte that no
//! application vocabulary may use as the first byte of its identifiers.  That
//! lets control and application messages share one decode path without
//! namespace collisions.
//!
//! | Message         | Identifier   | Fields                                   |
//! |-----------------|--------------|------------------------------------------|
//! | `NotifyUdpInfo` | `\x07NUI`    | `udp_port:u32` `remote_id:u32`           |
//! | `UdpPing`       | `\x07PNG`    | `counter:u32`                            |
//! | `UdpReceived`   | `\x07ACK`    | `counter:u32`                            |

use crate::domain::connection_id::ConnectionId;
use crate::protocol::codec::{read_identifier, read_u32, write_identifier, ProtocolError};

/// First byte of every reserved control-message identifier.
pub const CONTROL_SENTINEL: u8 = 0x07;

const NOTIFY_UDP_INFO: &str = "\x07NUI";
const UDP_PING: &str = "\x07PNG";
const UDP_RECEIVED: &str = "\x07ACK";

/// The three messages the manager intercepts before anything reaches a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// "Here is my UDP port, and here is the id you should tag packets to me with."
    NotifyUdpInfo {
        udp_port: u16,
        remote_id: ConnectionId,
    },
    /// Liveness probe.
    UdpPing(u32),
    /// Echo of a probe.
    UdpReceived(u32),
}

impl ControlMessage {
    /// Returns the reserved identifier for this message.
    pub fn identifier(&self) -> &'static str {
        match self {
            ControlMessage::NotifyUdpInfo { .. } => NOTIFY_UDP_INFO,
            ControlMessage::UdpPing(_) => UDP_PING,
            ControlMessage::UdpReceived(_) => UDP_RECEIVED,
        }
    }

    /// Encodes the message as a payload (identifier + packed fields).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 4 + 8);
        // The identifiers are compile-time constants, so this cannot fail.
        let _ = write_identifier(&mut buf, self.identifier());
        match self {
            ControlMessage::NotifyUdpInfo {
                udp_port,
                remote_id,
            } => {
                buf.extend_from_slice(&u32::from(*udp_port).to_be_bytes());
                buf.extend_from_slice(&remote_id.get().to_be_bytes());
            }
            ControlMessage::UdpPing(counter) | ControlMessage::UdpReceived(counter) => {
                buf.extend_from_slice(&counter.to_be_bytes());
            }
        }
        buf
    }

    /// Attempts to decode a payload as a control message.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnknownIdentifier`] when the payload is not a
    ///   control message at all (the caller should try the handler's
    ///   vocabulary next).
    /// - [`ProtocolError::MalformedPayload`] when the identifier is a control
    ///   identifier but the fields are wrong.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (ident, fields) = read_identifier(payload)?;
        match ident {
            NOTIFY_UDP_INFO => {
                require_exact(fields, 8, "NotifyUdpInfo")?;
                let port = read_u32(fields, 0)?;
                let udp_port = u16::try_from(port).map_err(|_| {
                    ProtocolError::MalformedPayload(format!("UDP port {port} out of range"))
                })?;
                let remote_id = ConnectionId::new(read_u32(fields, 4)?);
                Ok(ControlMessage::NotifyUdpInfo {
                    udp_port,
                    remote_id,
                })
            }
            UDP_PING => {
                require_exact(fields, 4, "UdpPing")?;
                Ok(ControlMessage::UdpPing(read_u32(fields, 0)?))
            }
            UDP_RECEIVED => {
                require_exact(fields, 4, "UdpReceived")?;
                Ok(ControlMessage::UdpReceived(read_u32(fields, 0)?))
            }
            other => Err(ProtocolError::UnknownIdentifier(other.to_string())),
        }
    }
}

/// Returns `true` if `ident` lives in the reserved control namespace.
pub fn is_reserved_identifier(ident: &str) -> bool {
    ident.as_bytes().first() == Some(&CONTROL_SENTINEL)
}

fn require_exact(fields: &[u8], len: usize, context: &str) -> Result<(), ProtocolError> {
    if fields.len() != len {
        return Err(ProtocolError::MalformedPayload(format!(
            "{context}: expected {len} field bytes, got {}",
            fields.len()
        )));
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
