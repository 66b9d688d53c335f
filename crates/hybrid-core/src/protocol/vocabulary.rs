//! Application message vocabularies and the combined decode step.
//!
//! Each handler type owns a closed set of messages, modelled as a Rust enum
//! implementing [`MessageVocabulary`].  Decoding a payload never involves
//! reflection: [`decode_payload`] first tries the three reserved
//! [`ControlMessage`]s, then the vocabulary's own `decode_fields`, and reports
//! anything else as [`Decoded::Unrecognized`].

use std::fmt;

use crate::protocol::codec::{read_identifier, write_identifier, ProtocolError};
use crate::protocol::control::{is_reserved_identifier, ControlMessage};

/// A closed set of application messages sharing one decode path.
///
/// Implementors provide the identifier of each variant plus field
/// packing/unpacking; the provided [`encode`](MessageVocabulary::encode) and
/// [`decode`](MessageVocabulary::decode) take care of the identifier prefix
/// and keep applications out of the reserved control namespace.
pub trait MessageVocabulary: Sized + Send + fmt::Debug + 'static {
    /// Short ASCII identifier of this message's variant.
    fn identifier(&self) -> &'static str;

    /// Appends the variant's packed fields to `buf`.
    fn encode_fields(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError>;

    /// Rebuilds a message from its identifier and packed fields.
    ///
    /// Return [`ProtocolError::UnknownIdentifier`] for identifiers outside the
    /// vocabulary.
    fn decode_fields(ident: &str, fields: &[u8]) -> Result<Self, ProtocolError>;

    /// Encodes the message as a payload (identifier + packed fields).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ReservedIdentifier`] if the variant's
    /// identifier starts with the control sentinel, or whatever
    /// `encode_fields` reports.
    fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let ident = self.identifier();
        if is_reserved_identifier(ident) {
            return Err(ProtocolError::ReservedIdentifier(ident.to_string()));
        }
        let mut buf = Vec::new();
        write_identifier(&mut buf, ident)?;
        self.encode_fields(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a payload produced by [`encode`](MessageVocabulary::encode).
    fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (ident, fields) = read_identifier(payload)?;
        if is_reserved_identifier(ident) {
            return Err(ProtocolError::ReservedIdentifier(ident.to_string()));
        }
        Self::decode_fields(ident, fields)
    }
}

/// Result of running a payload through the shared decode path.
#[derive(Debug, PartialEq)]
pub enum Decoded<M> {
    /// One of the manager's reserved control messages.
    Control(ControlMessage),
    /// A message from the handler's vocabulary.
    Application(M),
    /// Neither decoder accepted the payload; carries the vocabulary's error.
    Unrecognized(ProtocolError),
}

impl<M> Decoded<M> {
    /// Maps the application variant, leaving the others untouched.
    pub fn map_application<N>(self, f: impl FnOnce(M) -> N) -> Decoded<N> {
        match self {
            Decoded::Control(c) => Decoded::Control(c),
            Decoded::Application(m) => Decoded::Application(f(m)),
            Decoded::Unrecognized(e) => Decoded::Unrecognized(e),
        }
    }
}

/// Decodes `payload`: control messages first, then the vocabulary `M`.
pub fn decode_payload<M: MessageVocabulary>(payload: &[u8]) -> Decoded<M> {
    if let Ok(control) = ControlMessage::decode(payload) {
        return Decoded::Control(control);
    }
    match M::decode(payload) {
        Ok(msg) => Decoded::Application(msg),
        Err(e) => Decoded::Unrecognized(e),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
