//! # logship protocol
//!
//! Messages exchanged between a replica and a replication source, the
//! collection filter both sides apply, and the CBOR framing used on the wire.
//!
//! This crate provides:
//! - [`FilterConfig`] and the [`in_scope`] rule
//! - Login, inventory, dump, release and follow messages
//! - [`Chunk`], a bounded batch of log entries, with its validation
//! - Versioned CBOR encoding and decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod filter;
mod messages;

pub use codec::{
    decode_request, decode_response, encode_request, encode_response, encoded_len,
    PROTOCOL_VERSION,
};
pub use error::{ProtocolError, ProtocolResult};
pub use filter::{in_scope, FilterConfig, RestrictType};
pub use messages::{
    Chunk, CollectionInventory, DumpRequest, DumpResponse, ErrorResponse, FollowRequest,
    InventoryRequest, InventoryResponse, LoginRequest, LoginResponse, Request, RequestBody,
    Response, SnapshotId,
};
