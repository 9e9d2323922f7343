//! # logship applier
//!
//! The replica side of log-based replication.
//!
//! This crate provides:
//! - Initial sync from a consistent source snapshot
//! - A continuous applier with a stopped / running / errored state machine
//! - Transaction assembly (buffer until commit, discard on abort)
//! - Collection filtering, retries with backoff and idle polling
//! - Durable applier state for resuming after a restart
//! - Transport abstraction with an in-process loopback and a scripted mock
//!
//! ## Architecture
//!
//! A replica first runs [`sync`] to copy every in-scope collection, keeping
//! collection and index ids, and obtains the snapshot's boundary tick. The
//! [`Applier`] then follows the source's log from that tick on a worker
//! thread and replays each entry through an [`ApplyTarget`], which is
//! implemented for [`logship_core::Database`].
//!
//! ## Key Invariants
//!
//! - `lastAppliedTick <= lastProcessedTick <= lastAvailableTick`
//! - The applied tick never moves inside an open transaction
//! - A committed transaction is applied atomically or not at all
//! - `resume` never applies an entry a second time, and replaying document
//!   writes that were already applied leaves the replica unchanged

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod applier;
mod assembler;
mod client;
mod config;
mod error;
mod persistence;
mod state;
mod sync;
mod target;
mod transport;

pub use applier::Applier;
pub use assembler::{Assembled, TransactionAssembler};
pub use client::ReplicationClient;
pub use config::{
    ApplierConfig, IdleBackoff, RetryConfig, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_OPEN_TRANSACTION_ENTRIES,
};
pub use error::{ApplierError, ApplierResult};
pub use persistence::{FileStateStore, MemoryStateStore, PersistedState, StateStore};
pub use state::{ApplierPhase, ApplierState, LastError, Progress};
pub use sync::{sync, InitialSyncer, SnapshotResult, SyncedCollection};
pub use target::{apply_entries, ApplyTarget};
pub use transport::{
    Connector, FrameHandler, LoopbackConnector, LoopbackTransport, MockTransport, ReplicationTransport,
};
