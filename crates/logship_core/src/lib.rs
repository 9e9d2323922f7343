//! # logship core
//!
//! The storage model and replication log shared by replication sources and
//! replicas.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │                  Database                   │
//! │  collections ─ indexes ─ documents          │
//! │       │                                     │
//! │       ▼ every mutation appends one entry    │
//! │  ReplicationLog  (tick-ordered, immutable)  │
//! └────────────────────────────────────────────┘
//! ```
//!
//! - [`Tick`] orders log positions as arbitrary-precision decimal strings.
//! - [`Database`] is both the source (name-addressed writes, transactions)
//!   and the replica (id-addressed, idempotent apply operations).
//! - [`ReplicationLog`] is the append-only log tailed by replicas.
//! - [`ChecksumVerifier`] compares collections across databases.
//!
//! ## Key Invariants
//!
//! - Ticks issued by one log strictly increase.
//! - A write and its log entry become visible together.
//! - A captured [`DatabaseView`] reflects exactly the entries up to its
//!   boundary tick, and no transaction is open at that tick.
//! - Replica operations are idempotent: replaying an entry changes nothing.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checksum;
mod collection;
mod config;
mod database;
mod document;
mod error;
mod index;
mod log;
mod tick;
mod transaction;
mod types;

pub use checksum::{
    ChecksumMismatch, ChecksumOptions, ChecksumVerifier, CollectionChecksum, Digest,
};
pub use collection::{
    is_system_name, validate_collection_name, CollectionInfo, CollectionProperties,
    CollectionType, KeyGeneratorType, KeyOptions, PropertiesUpdate, DEFAULT_JOURNAL_SIZE,
    MAX_NAME_LENGTH,
};
pub use config::{DatabaseConfig, DEFAULT_MAX_DOCUMENT_SIZE};
pub use database::{CollectionView, Database, DatabaseView, WriteOp};
pub use document::{split_body, validate_key, Document, DocumentMeta, MAX_KEY_LENGTH};
pub use error::{CoreError, CoreResult, ErrorCode};
pub use index::{IndexDefinition, IndexKind};
pub use log::{CollectionRef, EntryKind, LogEntry, LogOperation, LoggerState, ReplicationLog};
pub use tick::{compare_ticks, Tick};
pub use transaction::Transaction;
pub use types::{CollectionId, IndexId, ServerId, TransactionId};
