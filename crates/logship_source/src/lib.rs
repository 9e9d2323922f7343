//! # logship source
//!
//! The source side of log-based replication.
//!
//! This crate provides:
//! - Session authentication (salted password digests, HMAC-SHA256 tokens)
//! - Snapshot capture with a registry of parked consistent views
//! - Chunked log tailing bounded by encoded size
//! - A request handler and a server facade that speaks CBOR frames
//!
//! # Architecture
//!
//! The source wraps a [`logship_core::Database`]; it keeps no state of its
//! own besides sessions and parked snapshots. Any number of replicas can
//! tail the same log concurrently, each with its own cursor.
//!
//! # Protocol
//!
//! 1. Replica logs in and receives a token
//! 2. Replica asks for an inventory; the source captures a view and a
//!    boundary tick
//! 3. Replica dumps each collection page by page, then releases the snapshot
//! 4. Replica follows the log from the boundary tick, chunk by chunk

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod server;
mod snapshot;
mod tailer;

pub use auth::{SessionTokens, UserStore};
pub use config::{SourceConfig, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
pub use error::{SourceError, SourceResult};
pub use handler::{HandlerContext, RequestHandler};
pub use server::ReplicationServer;
pub use snapshot::{SnapshotProvider, SnapshotRegistry};
pub use tailer::LogTailer;
