//! Append-only replication log.
//!
//! Every mutating operation on a database appends exactly one entry. Entries
//! are immutable once appended and are ordered by their [`Tick`]. Readers
//! take a shared lock and scan a range, so any number of tailers can follow
//! the log concurrently while writers append.

use crate::collection::{is_system_name, CollectionProperties};
use crate::document::Document;
use crate::error::CoreResult;
use crate::index::IndexDefinition;
use crate::tick::Tick;
use crate::types::{CollectionId, IndexId, TransactionId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Collection an entry refers to, by id and by the name it had when the
/// entry was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRef {
    /// Stable collection id.
    pub id: CollectionId,
    /// Name at the time of the entry.
    pub name: String,
}

impl CollectionRef {
    /// Creates a collection reference.
    pub fn new(id: CollectionId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Returns true if the referenced collection is a system collection.
    #[must_use]
    pub fn is_system(&self) -> bool {
        is_system_name(&self.name)
    }
}

/// The operation recorded by a log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LogOperation {
    /// A collection was created with these properties and indexes.
    CreateCollection {
        /// Properties at creation.
        properties: CollectionProperties,
        /// Indexes at creation, including the primary index.
        indexes: Vec<IndexDefinition>,
    },
    /// The collection was dropped.
    DropCollection,
    /// The collection was renamed.
    RenameCollection {
        /// Name after the rename.
        new_name: String,
    },
    /// Mutable properties changed.
    ChangeProperties {
        /// Full properties after the change.
        properties: CollectionProperties,
    },
    /// An index was created.
    CreateIndex {
        /// The new index.
        index: IndexDefinition,
    },
    /// An index was dropped.
    DropIndex {
        /// The dropped index.
        index_id: IndexId,
    },
    /// A document was inserted.
    Insert {
        /// Full document.
        document: Document,
    },
    /// A document was updated or replaced.
    Update {
        /// Full document after the change.
        document: Document,
    },
    /// A document was removed.
    Remove {
        /// Removed key.
        key: String,
        /// Revision that was removed.
        rev: Tick,
    },
    /// A transaction wrote its first operation.
    TransactionBegin,
    /// A transaction committed.
    TransactionCommit,
    /// A transaction rolled back.
    TransactionAbort,
}

/// Kind of a log entry, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Document insert.
    Insert,
    /// Document update or replace.
    Update,
    /// Document removal.
    Remove,
    /// Collection creation.
    CreateCollection,
    /// Collection drop.
    DropCollection,
    /// Collection rename.
    RenameCollection,
    /// Property change.
    ChangeProperties,
    /// Index creation.
    CreateIndex,
    /// Index drop.
    DropIndex,
    /// Transaction begin marker.
    TransactionBegin,
    /// Transaction commit marker.
    TransactionCommit,
    /// Transaction abort marker.
    TransactionAbort,
}

impl EntryKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::CreateCollection => "create-collection",
            Self::DropCollection => "drop-collection",
            Self::RenameCollection => "rename-collection",
            Self::ChangeProperties => "change-properties",
            Self::CreateIndex => "create-index",
            Self::DropIndex => "drop-index",
            Self::TransactionBegin => "transaction-begin",
            Self::TransactionCommit => "transaction-commit",
            Self::TransactionAbort => "transaction-abort",
        }
    }

    /// True for begin, commit and abort markers.
    #[must_use]
    pub const fn is_marker(self) -> bool {
        matches!(
            self,
            Self::TransactionBegin | Self::TransactionCommit | Self::TransactionAbort
        )
    }

    /// True for insert, update and remove.
    #[must_use]
    pub const fn is_document_operation(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Remove)
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the replication log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log.
    pub tick: Tick,
    /// Collection the entry applies to; absent for transaction markers.
    pub collection: Option<CollectionRef>,
    /// Enclosing transaction, if any.
    pub transaction_id: Option<TransactionId>,
    /// What happened.
    pub operation: LogOperation,
}

impl LogEntry {
    /// Returns the kind of the entry.
    #[must_use]
    pub fn kind(&self) -> EntryKind {
        match &self.operation {
            LogOperation::CreateCollection { .. } => EntryKind::CreateCollection,
            LogOperation::DropCollection => EntryKind::DropCollection,
            LogOperation::RenameCollection { .. } => EntryKind::RenameCollection,
            LogOperation::ChangeProperties { .. } => EntryKind::ChangeProperties,
            LogOperation::CreateIndex { .. } => EntryKind::CreateIndex,
            LogOperation::DropIndex { .. } => EntryKind::DropIndex,
            LogOperation::Insert { .. } => EntryKind::Insert,
            LogOperation::Update { .. } => EntryKind::Update,
            LogOperation::Remove { .. } => EntryKind::Remove,
            LogOperation::TransactionBegin => EntryKind::TransactionBegin,
            LogOperation::TransactionCommit => EntryKind::TransactionCommit,
            LogOperation::TransactionAbort => EntryKind::TransactionAbort,
        }
    }

    /// Returns the collection id, if the entry refers to one.
    #[must_use]
    pub fn collection_id(&self) -> Option<CollectionId> {
        self.collection.as_ref().map(|c| c.id)
    }
}

/// Snapshot of the logger's position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggerState {
    /// Highest tick appended so far.
    pub last_log_tick: Tick,
    /// Lowest tick still retained, `None` if the log holds nothing.
    pub first_tick: Option<Tick>,
    /// Number of entries appended since the log was created.
    pub total_events: u64,
}

#[derive(Debug, Default)]
struct LogInner {
    entries: Vec<LogEntry>,
    last_tick: u64,
    pruned_up_to: u64,
    total_events: u64,
}

impl LogInner {
    fn next_tick(&self) -> Tick {
        Tick::from(self.last_tick + 1)
    }

    fn position_after(&self, after: &Tick) -> usize {
        self.entries.partition_point(|e| &e.tick <= after)
    }
}

/// The append-only replication log.
#[derive(Debug, Default)]
pub struct ReplicationLog {
    inner: RwLock<LogInner>,
}

impl ReplicationLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry whose content depends on its tick.
    ///
    /// `build` runs under the log's write lock and receives the tick the
    /// entry will carry. If `build` fails, nothing is appended and the tick is
    /// not consumed.
    pub fn append_with<F>(&self, build: F) -> CoreResult<Tick>
    where
        F: FnOnce(&Tick) -> CoreResult<LogEntry>,
    {
        let mut inner = self.inner.write();
        let tick = inner.next_tick();
        let mut entry = build(&tick)?;
        entry.tick = tick.clone();
        inner.last_tick += 1;
        inner.total_events += 1;
        inner.entries.push(entry);
        Ok(tick)
    }

    /// Appends an entry.
    pub fn append(
        &self,
        collection: Option<CollectionRef>,
        transaction_id: Option<TransactionId>,
        operation: LogOperation,
    ) -> Tick {
        let mut inner = self.inner.write();
        let tick = inner.next_tick();
        inner.last_tick += 1;
        inner.total_events += 1;
        inner.entries.push(LogEntry {
            tick: tick.clone(),
            collection,
            transaction_id,
            operation,
        });
        tick
    }

    /// Highest tick appended so far, zero for a fresh log.
    #[must_use]
    pub fn last_tick(&self) -> Tick {
        Tick::from(self.inner.read().last_tick)
    }

    /// Lowest retained tick.
    #[must_use]
    pub fn first_tick(&self) -> Option<Tick> {
        self.inner.read().entries.first().map(|e| e.tick.clone())
    }

    /// Returns the logger position.
    #[must_use]
    pub fn state(&self) -> LoggerState {
        let inner = self.inner.read();
        LoggerState {
            last_log_tick: Tick::from(inner.last_tick),
            first_tick: inner.entries.first().map(|e| e.tick.clone()),
            total_events: inner.total_events,
        }
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Returns true if no entries are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if every entry after `after` is still retained.
    #[must_use]
    pub fn is_present(&self, after: &Tick) -> bool {
        let pruned = Tick::from(self.inner.read().pruned_up_to);
        after >= &pruned
    }

    /// Visits entries with a tick greater than `after`, in order, until
    /// `visit` returns false.
    pub fn scan_after<F>(&self, after: &Tick, mut visit: F)
    where
        F: FnMut(&LogEntry) -> bool,
    {
        let inner = self.inner.read();
        let start = inner.position_after(after);
        for entry in &inner.entries[start..] {
            if !visit(entry) {
                break;
            }
        }
    }

    /// Returns up to `limit` entries with a tick greater than `after`.
    #[must_use]
    pub fn read_after(&self, after: &Tick, limit: usize) -> Vec<LogEntry> {
        let inner = self.inner.read();
        let start = inner.position_after(after);
        inner.entries[start..].iter().take(limit).cloned().collect()
    }

    /// Drops entries with a tick up to and including `tick`. Returns how many
    /// were removed.
    pub fn prune_up_to(&self, tick: &Tick) -> usize {
        let mut inner = self.inner.write();
        let end = inner.position_after(tick);
        if end == 0 {
            return 0;
        }
        let boundary = inner.entries[end - 1].tick.to_u64().unwrap_or(inner.last_tick);
        inner.entries.drain(..end);
        inner.pruned_up_to = inner.pruned_up_to.max(boundary);
        tracing::debug!(removed = end, up_to = %tick, "pruned replication log");
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(log: &ReplicationLog, txn: u64) -> Tick {
        log.append(None, Some(TransactionId::new(txn)), LogOperation::TransactionBegin)
    }

    #[test]
    fn ticks_increase() {
        let log = ReplicationLog::new();
        assert!(log.last_tick().is_zero());
        let a = marker(&log, 1);
        let b = marker(&log, 2);
        assert!(a < b);
        assert_eq!(log.last_tick(), b);
        assert_eq!(log.state().total_events, 2);
    }

    #[test]
    fn read_after_is_exclusive() {
        let log = ReplicationLog::new();
        for i in 0..12 {
            marker(&log, i);
        }
        let entries = log.read_after(&Tick::from(9), 100);
        let ticks: Vec<&str> = entries.iter().map(|e| e.tick.as_str()).collect();
        assert_eq!(ticks, vec!["10", "11", "12"]);
        assert_eq!(log.read_after(&Tick::zero(), 2).len(), 2);
        assert!(log.read_after(&Tick::from(12), 10).is_empty());
    }

    #[test]
    fn failed_build_consumes_nothing() {
        let log = ReplicationLog::new();
        let result = log.append_with(|_| Err(crate::error::CoreError::invalid_operation("no")));
        assert!(result.is_err());
        assert!(log.is_empty());
        assert!(log.last_tick().is_zero());
    }

    #[test]
    fn pruning_moves_first_tick() {
        let log = ReplicationLog::new();
        for i in 0..5 {
            marker(&log, i);
        }
        assert_eq!(log.prune_up_to(&Tick::from(3)), 3);
        assert_eq!(log.first_tick(), Some(Tick::from(4)));
        assert!(log.is_present(&Tick::from(3)));
        assert!(!log.is_present(&Tick::from(2)));
        assert_eq!(log.last_tick(), Tick::from(5));
    }

    #[test]
    fn kinds_round_out_markers() {
        let log = ReplicationLog::new();
        marker(&log, 1);
        let entry = &log.read_after(&Tick::zero(), 1)[0];
        assert_eq!(entry.kind(), EntryKind::TransactionBegin);
        assert!(entry.kind().is_marker());
        assert_eq!(entry.kind().to_string(), "transaction-begin");
    }
}
