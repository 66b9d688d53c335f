//! Stream and datagram framing.
//!
//! Wire format:
//! ```text
//! TCP frame:    [length:4][payload:length]
//! UDP datagram: [connection_id:4][payload:N]
//! ```
//! All multi-byte integers are big-endian.  The connection id on a datagram
//! names the *receiving* side's connection: the sender stamps the id the
//! receiver told it to use during the handshake.
//!
//! # Why a decoder object? (for beginners)
//!
//! TCP is a byte stream.  One `read()` may return half a frame, or three
//! frames glued together.  [`FrameDecoder`] accumulates whatever arrives and
//! hands out complete frames one at a time, never emitting a frame before all
//! of its bytes have been buffered.

use crate::domain::connection_id::ConnectionId;
use crate::protocol::codec::{read_u32, ProtocolError};

/// Size of the stream frame length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Size of the datagram connection-id prefix.
pub const DATAGRAM_HEADER_SIZE: usize = 4;

/// Largest stream payload accepted by [`FrameDecoder`] and [`encode_frame`].
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Largest payload that fits in a single IPv4 UDP datagram after our header.
pub const MAX_DATAGRAM_PAYLOAD: usize = 65_507 - DATAGRAM_HEADER_SIZE;

/// Encodes `payload` as a length-prefixed stream frame.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if `payload` exceeds
/// [`MAX_FRAME_LEN`].
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            declared: payload.len(),
            limit: MAX_FRAME_LEN,
        });
    }
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Encodes `payload` as a datagram tagged with the receiver's connection id.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if the datagram would not fit in a
/// single UDP packet.
pub fn encode_datagram(receiver_id: ConnectionId, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_DATAGRAM_PAYLOAD {
        return Err(ProtocolError::FrameTooLarge {
            declared: payload.len(),
            limit: MAX_DATAGRAM_PAYLOAD,
        });
    }
    let mut buf = Vec::with_capacity(DATAGRAM_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&receiver_id.get().to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Splits a received datagram into the local connection id and its payload.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] for datagrams shorter than the
/// 4-byte id prefix.
pub fn decode_datagram(datagram: &[u8]) -> Result<(ConnectionId, &[u8]), ProtocolError> {
    let id = read_u32(datagram, 0)?;
    Ok((ConnectionId::new(id), &datagram[DATAGRAM_HEADER_SIZE..]))
}

/// Incremental decoder turning a byte stream into discrete frames.
///
/// # Examples
///
/// ```rust
/// use hybrid_core::{encode_frame, FrameDecoder};
///
/// let frame = encode_frame(b"hello").unwrap();
/// let mut decoder = FrameDecoder::new();
/// decoder.extend(&frame[..3]);
/// assert_eq!(decoder.next_frame().unwrap(), None);
/// decoder.extend(&frame[3..]);
/// assert_eq!(decoder.next_frame().unwrap(), Some(b"hello".to_vec()));
/// ```
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends newly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet emitted as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Removes and returns the next complete frame's payload, if one is
    /// fully buffered.
    ///
    /// Call repeatedly until it returns `Ok(None)`; a single read may have
    /// delivered several frames.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] as soon as a header announces
    /// a payload above [`MAX_FRAME_LEN`].  The stream cannot be resynchronised
    /// after that, so callers should close it.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let declared = read_u32(&self.buf, 0)? as usize;
        if declared > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                declared,
                limit: MAX_FRAME_LEN,
            });
        }
        let total = FRAME_HEADER_SIZE + declared;
        if self.buf.len() < total {
            return Ok(None);
        }
        let payload = self.buf[FRAME_HEADER_SIZE..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(payload))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_prefixes_big_endian_length() {
        // Arrange / Act
        let frame = encode_frame(b"abc").unwrap();

        // Assert
        assert_eq!(frame, vec![0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_empty_payload_frame_decodes_to_empty_vec() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode_frame(&[]).unwrap());
        assert_eq!(decoder.next_frame().unwrap(), Some(Vec::new()));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_header_yields_nothing() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0, 0]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.buffered(), 2, "partial bytes must stay buffered");
    }

    #[test]
    fn test_partial_payload_yields_nothing_until_complete() {
        // Arrange
        let frame = encode_frame(&[7u8; 100]).unwrap();
        let mut decoder = FrameDecoder::new();

        // Act – deliver everything except the final byte
        decoder.extend(&frame[..frame.len() - 1]);
        let premature = decoder.next_frame().unwrap();
        decoder.extend(&frame[frame.len() - 1..]);
        let complete = decoder.next_frame().unwrap();

        // Assert
        assert_eq!(premature, None);
        assert_eq!(complete, Some(vec![7u8; 100]));
    }

    #[test]
    fn test_coalesced_frames_are_emitted_one_at_a_time() {
        // Arrange
        let mut bytes = encode_frame(b"one").unwrap();
        bytes.extend(encode_frame(b"two").unwrap());
        bytes.extend_from_slice(&[0, 0, 0, 5, b't']); // start of a third frame
        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);

        // Act / Assert
        assert_eq!(decoder.next_frame().unwrap(), Some(b"one".to_vec()));
        assert_eq!(decoder.next_frame().unwrap(), Some(b"two".to_vec()));
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.buffered(), 5);
    }

    #[test]
    fn test_oversized_header_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_datagram_carries_receiver_id_prefix() {
        // Arrange
        let id = ConnectionId::new(0x0102_0304);

        // Act
        let datagram = encode_datagram(id, b"xy").unwrap();
        let (decoded_id, payload) = decode_datagram(&datagram).unwrap();

        // Assert
        assert_eq!(&datagram[..4], &[1, 2, 3, 4]);
        assert_eq!(decoded_id, id);
        assert_eq!(payload, b"xy");
    }

    #[test]
    fn test_short_datagram_is_rejected() {
        assert!(matches!(
            decode_datagram(&[1, 2, 3]),
            Err(ProtocolError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_oversized_datagram_is_rejected() {
        let payload = vec![0u8; MAX_DATAGRAM_PAYLOAD + 1];
        assert!(encode_datagram(ConnectionId::new(1), &payload).is_err());
    }
}
