//! Transaction assembly.
//!
//! Entries of a source transaction are interleaved with other writes in the
//! log. The assembler buffers them per transaction id until the commit
//! marker arrives and then releases them as one unit; an abort marker
//! discards them. Entries outside transactions pass straight through.

use crate::error::{ApplierError, ApplierResult};
use logship_core::{LogEntry, LogOperation, TransactionId};
use std::collections::HashMap;

/// What happened to an entry pushed into the assembler.
#[derive(Debug, PartialEq)]
pub enum Assembled {
    /// A standalone entry, ready to apply.
    Standalone(LogEntry),
    /// A transaction committed; its entries in log order.
    Committed {
        /// The committed transaction.
        transaction: TransactionId,
        /// Its data entries.
        entries: Vec<LogEntry>,
    },
    /// The entry was buffered.
    Buffered,
    /// A transaction aborted and its entries were dropped.
    Aborted {
        /// The aborted transaction.
        transaction: TransactionId,
        /// Number of dropped entries.
        discarded: usize,
    },
    /// The entry needed no action.
    Ignored,
}

/// Buffers open transactions.
#[derive(Debug)]
pub struct TransactionAssembler {
    open: HashMap<TransactionId, Vec<LogEntry>>,
    buffered: usize,
    limit: usize,
}

impl TransactionAssembler {
    /// Creates an assembler that buffers at most `limit` entries across all
    /// open transactions.
    pub fn new(limit: usize) -> Self {
        Self {
            open: HashMap::new(),
            buffered: 0,
            limit,
        }
    }

    /// Feeds the next entry.
    ///
    /// Fails on a begin for an already open transaction, on data or commit
    /// entries for an unknown transaction, and when the buffer bound is hit.
    /// Aborts of unknown transactions are ignored.
    pub fn push(&mut self, entry: LogEntry) -> ApplierResult<Assembled> {
        let Some(transaction) = entry.transaction_id else {
            return Ok(Assembled::Standalone(entry));
        };

        match entry.operation {
            LogOperation::TransactionBegin => {
                if self.open.contains_key(&transaction) {
                    return Err(ApplierError::UnexpectedMarker {
                        marker: "begin",
                        transaction,
                        tick: entry.tick,
                    });
                }
                self.open.insert(transaction, Vec::new());
                Ok(Assembled::Buffered)
            }
            LogOperation::TransactionCommit => {
                let entries = self.open.remove(&transaction).ok_or_else(|| {
                    ApplierError::UnexpectedTransaction {
                        transaction,
                        tick: entry.tick.clone(),
                    }
                })?;
                self.buffered -= entries.len();
                Ok(Assembled::Committed {
                    transaction,
                    entries,
                })
            }
            LogOperation::TransactionAbort => match self.open.remove(&transaction) {
                Some(entries) => {
                    self.buffered -= entries.len();
                    Ok(Assembled::Aborted {
                        transaction,
                        discarded: entries.len(),
                    })
                }
                None => {
                    tracing::debug!(%transaction, tick = %entry.tick, "abort for unknown transaction");
                    Ok(Assembled::Ignored)
                }
            },
            _ => {
                if self.buffered >= self.limit {
                    return Err(ApplierError::TransactionTooLarge { limit: self.limit });
                }
                let buffer = self.open.get_mut(&transaction).ok_or_else(|| {
                    ApplierError::UnexpectedTransaction {
                        transaction,
                        tick: entry.tick.clone(),
                    }
                })?;
                buffer.push(entry);
                self.buffered += 1;
                Ok(Assembled::Buffered)
            }
        }
    }

    /// Returns true if `transaction` has begun and not ended.
    pub fn is_open(&self, transaction: TransactionId) -> bool {
        self.open.contains_key(&transaction)
    }

    /// Number of open transactions.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Entries buffered across open transactions.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Drops every open transaction.
    pub fn clear(&mut self) {
        self.open.clear();
        self.buffered = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logship_core::{CollectionId, CollectionRef, Document, ErrorCode, Tick};
    use serde_json::Map;

    fn marker(tick: u64, txn: u64, operation: LogOperation) -> LogEntry {
        LogEntry {
            tick: Tick::from(tick),
            collection: None,
            transaction_id: Some(TransactionId::new(txn)),
            operation,
        }
    }

    fn insert(tick: u64, txn: Option<u64>) -> LogEntry {
        LogEntry {
            tick: Tick::from(tick),
            collection: Some(CollectionRef::new(CollectionId::new(1), "c")),
            transaction_id: txn.map(TransactionId::new),
            operation: LogOperation::Insert {
                document: Document::new(format!("k{tick}"), Tick::from(tick), Map::new()),
            },
        }
    }

    #[test]
    fn standalone_passes_through() {
        let mut assembler = TransactionAssembler::new(10);
        let entry = insert(1, None);
        assert_eq!(assembler.push(entry.clone()).unwrap(), Assembled::Standalone(entry));
    }

    #[test]
    fn interleaved_transactions_commit_separately() {
        let mut assembler = TransactionAssembler::new(10);
        assembler.push(marker(1, 1, LogOperation::TransactionBegin)).unwrap();
        assembler.push(marker(2, 2, LogOperation::TransactionBegin)).unwrap();
        assembler.push(insert(3, Some(1))).unwrap();
        assembler.push(insert(4, Some(2))).unwrap();
        assembler.push(insert(5, Some(1))).unwrap();
        assert_eq!(assembler.open_count(), 2);
        assert_eq!(assembler.buffered(), 3);

        match assembler.push(marker(6, 1, LogOperation::TransactionCommit)).unwrap() {
            Assembled::Committed { transaction, entries } => {
                assert_eq!(transaction, TransactionId::new(1));
                let ticks: Vec<_> = entries.iter().map(|e| e.tick.to_u64().unwrap()).collect();
                assert_eq!(ticks, vec![3, 5]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            assembler.push(marker(7, 2, LogOperation::TransactionAbort)).unwrap(),
            Assembled::Aborted {
                transaction: TransactionId::new(2),
                discarded: 1
            }
        );
        assert_eq!(assembler.open_count(), 0);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn unknown_transactions() {
        let mut assembler = TransactionAssembler::new(10);
        let err = assembler.push(insert(1, Some(9))).unwrap_err();
        assert_eq!(err.code(), ErrorCode::REPLICATION_UNEXPECTED_TRANSACTION);

        let err = assembler
            .push(marker(2, 9, LogOperation::TransactionCommit))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::REPLICATION_UNEXPECTED_TRANSACTION);

        assert_eq!(
            assembler.push(marker(3, 9, LogOperation::TransactionAbort)).unwrap(),
            Assembled::Ignored
        );
    }

    #[test]
    fn duplicate_begin_is_rejected() {
        let mut assembler = TransactionAssembler::new(10);
        assembler.push(marker(1, 4, LogOperation::TransactionBegin)).unwrap();
        let err = assembler
            .push(marker(2, 4, LogOperation::TransactionBegin))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::REPLICATION_UNEXPECTED_MARKER);
        assert!(assembler.is_open(TransactionId::new(4)));
    }

    #[test]
    fn buffer_bound_spans_transactions() {
        let mut assembler = TransactionAssembler::new(2);
        assembler.push(marker(1, 1, LogOperation::TransactionBegin)).unwrap();
        assembler.push(marker(2, 2, LogOperation::TransactionBegin)).unwrap();
        assembler.push(insert(3, Some(1))).unwrap();
        assembler.push(insert(4, Some(2))).unwrap();
        let err = assembler.push(insert(5, Some(1))).unwrap_err();
        assert_eq!(err.code(), ErrorCode::REPLICATION_TRANSACTION_TOO_LARGE);

        assembler.clear();
        assert_eq!(assembler.open_count(), 0);
    }
}
