//! CBOR framing.
//!
//! Every message travels inside an envelope that carries the protocol
//! version, so a peer can reject an incompatible message before trying to
//! interpret its body.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::{Request, Response};
use ciborium::value::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Version written into every envelope.
pub const PROTOCOL_VERSION: u16 = 1;

#[derive(Serialize)]
struct Envelope<'a, T> {
    version: u16,
    body: &'a T,
}

#[derive(Deserialize)]
struct RawEnvelope {
    version: u16,
    body: Value,
}

fn encode<T: Serialize>(body: &T) -> ProtocolResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(
        &Envelope {
            version: PROTOCOL_VERSION,
            body,
        },
        &mut bytes,
    )
    .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    let envelope: RawEnvelope =
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: envelope.version,
        });
    }
    envelope
        .body
        .deserialized()
        .map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Encodes a request.
pub fn encode_request(request: &Request) -> ProtocolResult<Vec<u8>> {
    encode(request)
}

/// Decodes a request.
pub fn decode_request(bytes: &[u8]) -> ProtocolResult<Request> {
    decode(bytes)
}

/// Encodes a response.
pub fn encode_response(response: &Response) -> ProtocolResult<Vec<u8>> {
    encode(response)
}

/// Decodes a response.
pub fn decode_response(bytes: &[u8]) -> ProtocolResult<Response> {
    decode(bytes)
}

/// Size of the plain CBOR encoding of `value`, without an envelope.
pub fn encoded_len<T: Serialize>(value: &T) -> ProtocolResult<usize> {
    let mut counter = ByteCounter(0);
    ciborium::into_writer(value, &mut counter).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(counter.0)
}

struct ByteCounter(usize);

impl std::io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
