//! Datagram codec
//!
//! Every datagram carries exactly one protobuf [`Envelope`]; the datagram
//! boundary is the message boundary, so no length prefix is needed:
//! ```text
//! [ N bytes: protobuf Envelope ]          N <= MAX_DATAGRAM_SIZE
//! ```
//!
//! Command text sent by debug tools may also arrive bare (without an
//! envelope), recognised by its start-of-frame tag. See [`classify`].

use bytes::{Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

use crate::{Envelope, SOF_DEBUG, SOF_UNIVERSAL};

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Datagram too large: {0} bytes (max: {MAX_DATAGRAM_SIZE})")]
    DatagramTooLarge(usize),

    #[error("Empty datagram")]
    Empty,

    #[error("Envelope has no header")]
    MissingHeader,

    #[error("Protobuf decode error: {0}")]
    DecodeError(#[from] prost::DecodeError),

    #[error("Protobuf encode error: {0}")]
    EncodeError(#[from] prost::EncodeError),
}

/// Encode an Envelope into a datagram
pub fn encode(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let msg_len = envelope.encoded_len();

    if msg_len > MAX_DATAGRAM_SIZE {
        return Err(CodecError::DatagramTooLarge(msg_len));
    }

    let mut buf = BytesMut::with_capacity(msg_len);
    envelope.encode(&mut buf)?;

    Ok(buf.freeze())
}

/// Decode a datagram into an Envelope
///
/// Envelopes without a header are rejected: every consumer keys on it.
pub fn decode(datagram: &[u8]) -> Result<Envelope, CodecError> {
    if datagram.is_empty() {
        return Err(CodecError::Empty);
    }
    if datagram.len() > MAX_DATAGRAM_SIZE {
        return Err(CodecError::DatagramTooLarge(datagram.len()));
    }

    let envelope = Envelope::decode(datagram)?;
    if envelope.header.is_none() {
        return Err(CodecError::MissingHeader);
    }

    Ok(envelope)
}

/// An inbound datagram after envelope-level inspection
#[derive(Debug, Clone, PartialEq)]
pub enum Datagram {
    /// Bare command text starting with a known SOF
    Text(Bytes),
    /// Protobuf envelope
    Envelope(Envelope),
}

/// Classify and decode an inbound datagram
pub fn classify(datagram: &[u8]) -> Result<Datagram, CodecError> {
    if datagram.len() >= 4 && (&datagram[..4] == SOF_DEBUG || &datagram[..4] == SOF_UNIVERSAL) {
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(CodecError::DatagramTooLarge(datagram.len()));
        }
        return Ok(Datagram::Text(Bytes::copy_from_slice(datagram)));
    }

    decode(datagram).map(Datagram::Envelope)
}
