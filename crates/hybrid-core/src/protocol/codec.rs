//! Shared codec primitives for HybridNet payloads.
//!
//! Every payload, whether it travels inside a TCP frame or a UDP datagram,
//! starts with a message identifier:
//! ```text
//! [ident_len:1][ident:ident_len][fields:N]
//! ```
//! The identifier is 1–255 ASCII bytes.  Identifiers whose first byte is
//! [`crate::CONTROL_SENTINEL`] are reserved for the manager's own control
//! messages.  All multi-byte integers in `fields` are big-endian.

use thiserror::Error;

/// Errors that can occur during frame or payload encoding/decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// A stream frame announced a length above the accepted ceiling.
    #[error("frame of {declared} bytes exceeds the {limit}-byte limit")]
    FrameTooLarge { declared: usize, limit: usize },

    /// The identifier is not part of the vocabulary being decoded.
    #[error("unknown message identifier: {0:?}")]
    UnknownIdentifier(String),

    /// An application vocabulary tried to use a reserved control identifier.
    #[error("identifier {0:?} is reserved for control messages")]
    ReservedIdentifier(String),

    /// The payload could not be parsed (field value out of range, UTF-8 error, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

// ── Message identifiers ───────────────────────────────────────────────────────

/// Writes the 1-byte length prefix and the identifier bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if `ident` is empty, longer
/// than 255 bytes, or not ASCII.
pub fn write_identifier(buf: &mut Vec<u8>, ident: &str) -> Result<(), ProtocolError> {
    if ident.is_empty() || ident.len() > u8::MAX as usize || !ident.is_ascii() {
        return Err(ProtocolError::MalformedPayload(format!(
            "identifier must be 1-255 ASCII bytes, got {ident:?}"
        )));
    }
    buf.push(ident.len() as u8);
    buf.extend_from_slice(ident.as_bytes());
    Ok(())
}

/// Splits a payload into its identifier and the packed fields that follow.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] if the payload is shorter than
/// its identifier prefix claims, and [`ProtocolError::MalformedPayload`] for
/// an empty or non-ASCII identifier.
pub fn read_identifier(payload: &[u8]) -> Result<(&str, &[u8]), ProtocolError> {
    let Some(&len) = payload.first() else {
        return Err(ProtocolError::InsufficientData {
            needed: 1,
            available: 0,
        });
    };
    let len = len as usize;
    if len == 0 {
        return Err(ProtocolError::MalformedPayload(
            "empty message identifier".to_string(),
        ));
    }
    if payload.len() < 1 + len {
        return Err(ProtocolError::InsufficientData {
            needed: 1 + len,
            available: payload.len(),
        });
    }
    let raw = &payload[1..1 + len];
    if !raw.is_ascii() {
        return Err(ProtocolError::MalformedPayload(
            "message identifier is not ASCII".to_string(),
        ));
    }
    // ASCII is always valid UTF-8.
    let ident = std::str::from_utf8(raw)
        .map_err(|e| ProtocolError::MalformedPayload(format!("invalid identifier: {e}")))?;
    Ok((ident, &payload[1 + len..]))
}

// ── Field helpers ─────────────────────────────────────────────────────────────

/// Checks that `buf` holds at least `needed` bytes.
pub fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

/// Reads a big-endian `u32` at `offset`.
pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    if buf.len() < offset + 4 {
        return Err(ProtocolError::InsufficientData {
            needed: offset + 4,
            available: buf.len(),
        });
    }
    Ok(u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}

/// Writes a 2-byte length prefix followed by the UTF-8 string bytes.
///
/// Strings longer than `u16::MAX` bytes are truncated at a character
/// boundary.
#[cfg(test)]
pub(crate) fn write_length_prefixed_string(buf: &mut Vec<u8>, s: &str) {
    let mut end = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    buf.extend_from_slice(&(end as u16).to_be_bytes());
    buf.extend_from_slice(&s.as_bytes()[..end]);
}

/// Reads a 2-byte length prefix and then that many UTF-8 bytes.
/// Returns the string and the offset of the byte after the string.
#[cfg(test)]
pub(crate) fn read_length_prefixed_string(
    buf: &[u8],
    offset: usize,
) -> Result<(String, usize), ProtocolError> {
    if buf.len() < offset + 2 {
        return Err(ProtocolError::MalformedPayload(format!(
            "need 2 bytes for string length at offset {offset}"
        )));
    }
    let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
    let start = offset + 2;
    if buf.len() < start + len {
        return Err(ProtocolError::MalformedPayload(format!(
            "string of length {len} at offset {start} exceeds buffer"
        )));
    }
    let s = std::str::from_utf8(&buf[start..start + len])
        .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))?
        .to_string();
    Ok((s, start + len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
