//! Protocol module containing framing, the reserved control messages and the
//! application vocabulary contract.

pub mod codec;
pub mod control;
pub mod framing;
pub mod vocabulary;

pub use codec::ProtocolError;
pub use control::{ControlMessage, CONTROL_SENTINEL};
pub use framing::{decode_datagram, encode_datagram, encode_frame, FrameDecoder};
pub use vocabulary::{decode_payload, Decoded, MessageVocabulary};
