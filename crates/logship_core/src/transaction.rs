//! Source-side transactions.

use crate::collection::Collection;
use crate::database::{apply_writes, Database, DatabaseState, UndoLog, WriteOp};
use crate::document::{split_body, Document, DocumentMeta};
use crate::error::{CoreError, CoreResult};
use crate::log::{CollectionRef, LogEntry, LogOperation};
use crate::tick::Tick;
use crate::types::{CollectionId, IndexId, TransactionId};
use serde_json::{Map, Value};
use std::collections::HashMap;

type Slot = (CollectionId, String);

/// A write transaction, created by [`Database::transaction`].
///
/// Each write is appended to the log immediately, tagged with the
/// transaction id, but only staged in memory. The staged writes become
/// visible together at commit. Reads through the transaction see its own
/// staged writes.
///
/// Commit fails, and the transaction aborts, if a document the transaction
/// touched was changed by someone else in the meantime or if a staged write
/// violates a unique index.
pub struct Transaction<'db> {
    db: &'db Database,
    id: TransactionId,
    began: bool,
    writes: Vec<WriteOp>,
    overlay: HashMap<Slot, Option<Document>>,
    observed: HashMap<Slot, Option<Tick>>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db Database, id: TransactionId) -> Self {
        Self {
            db,
            id,
            began: false,
            writes: Vec::new(),
            overlay: HashMap::new(),
            observed: HashMap::new(),
        }
    }

    /// Returns the transaction id.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Number of writes staged so far.
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Reads a document as this transaction sees it.
    pub fn document(&self, collection: &str, key: &str) -> CoreResult<Option<Document>> {
        let db = self.db;
        let state = db.state.read();
        let target = state.by_name(collection)?;
        Ok(self.visible(target, key))
    }

    /// Inserts a document.
    pub fn insert(&mut self, collection: &str, body: Value) -> CoreResult<DocumentMeta> {
        let (user_key, data) = split_body(body)?;
        self.db.check_body(&data)?;
        let db = self.db;
        let state = db.state.read();
        let target = state.by_name(collection)?;
        Database::validate_type(target, &data)?;
        let key = self.db.resolve_key(target, user_key)?;
        if self.visible(target, &key).is_some() {
            return Err(CoreError::UniqueConstraintViolated {
                collection: collection.to_string(),
                index: IndexId::PRIMARY,
                key,
            });
        }
        self.stage_put(target, key, data, true)
    }

    /// Merges `patch` into a document.
    pub fn update(&mut self, collection: &str, key: &str, patch: Value) -> CoreResult<DocumentMeta> {
        let (_, patch) = split_body(patch)?;
        let db = self.db;
        let state = db.state.read();
        let target = state.by_name(collection)?;
        let current = self
            .visible(target, key)
            .ok_or_else(|| CoreError::document_not_found(collection, key))?;
        let data = current.merged(patch);
        self.db.check_body(&data)?;
        Database::validate_type(target, &data)?;
        self.stage_put(target, key.to_string(), data, false)
    }

    /// Replaces the body of a document.
    pub fn replace(&mut self, collection: &str, key: &str, body: Value) -> CoreResult<DocumentMeta> {
        let (_, data) = split_body(body)?;
        self.db.check_body(&data)?;
        let db = self.db;
        let state = db.state.read();
        let target = state.by_name(collection)?;
        if self.visible(target, key).is_none() {
            return Err(CoreError::document_not_found(collection, key));
        }
        Database::validate_type(target, &data)?;
        self.stage_put(target, key.to_string(), data, false)
    }

    /// Removes a document.
    pub fn remove(&mut self, collection: &str, key: &str) -> CoreResult<DocumentMeta> {
        let db = self.db;
        let state = db.state.read();
        let target = state.by_name(collection)?;
        let current = self
            .visible(target, key)
            .ok_or_else(|| CoreError::document_not_found(collection, key))?;
        self.observe(target, key);
        let reference = CollectionRef::new(target.id(), target.name());
        self.log_write(
            reference,
            LogOperation::Remove {
                key: key.to_string(),
                rev: current.rev.clone(),
            },
        );
        self.overlay.insert((target.id(), key.to_string()), None);
        self.writes.push(WriteOp::Delete {
            collection: target.id(),
            key: key.to_string(),
        });
        Ok(current.meta())
    }

    fn visible(&self, target: &Collection, key: &str) -> Option<Document> {
        match self.overlay.get(&(target.id(), key.to_string())) {
            Some(staged) => staged.clone(),
            None => target.get(key).cloned(),
        }
    }

    fn observe(&mut self, target: &Collection, key: &str) {
        self.observed
            .entry((target.id(), key.to_string()))
            .or_insert_with(|| target.get(key).map(|d| d.rev.clone()));
    }

    fn stage_put(
        &mut self,
        target: &Collection,
        key: String,
        data: Map<String, Value>,
        insert: bool,
    ) -> CoreResult<DocumentMeta> {
        self.observe(target, &key);
        if !self.began {
            self.db
                .log
                .append(None, Some(self.id), LogOperation::TransactionBegin);
            self.began = true;
        }
        let reference = CollectionRef::new(target.id(), target.name());
        let id = self.id;
        let tick = self.db.log.append_with(|tick| {
            let document = Document::new(key.clone(), tick.clone(), data.clone());
            let operation = if insert {
                LogOperation::Insert { document }
            } else {
                LogOperation::Update { document }
            };
            Ok(LogEntry {
                tick: tick.clone(),
                collection: Some(reference),
                transaction_id: Some(id),
                operation,
            })
        })?;
        let document = Document::new(key.clone(), tick.clone(), data);
        self.overlay
            .insert((target.id(), key.clone()), Some(document.clone()));
        self.writes.push(WriteOp::Upsert {
            collection: target.id(),
            document,
        });
        Ok(DocumentMeta { key, rev: tick })
    }

    fn log_write(&mut self, reference: CollectionRef, operation: LogOperation) {
        if !self.began {
            self.db
                .log
                .append(None, Some(self.id), LogOperation::TransactionBegin);
            self.began = true;
        }
        self.db.log.append(Some(reference), Some(self.id), operation);
    }

    fn validate(&self, state: &DatabaseState) -> CoreResult<()> {
        for ((collection, key), seen) in &self.observed {
            let target = state.by_id(*collection)?;
            let current = target.get(key).map(|d| &d.rev);
            if current != seen.as_ref() {
                return Err(CoreError::Conflict {
                    collection: target.name().to_string(),
                    key: key.clone(),
                    message: "document changed by a concurrent write".to_string(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn commit(self) -> CoreResult<()> {
        if !self.began {
            return Ok(());
        }
        let mut state = self.db.state.write();
        let mut result = self.validate(&state);
        if result.is_ok() {
            let mut undo = UndoLog::default();
            if let Err(err) = apply_writes(&mut state, &self.writes, &mut undo) {
                undo.rollback(&mut state);
                result = Err(err);
            }
        }
        match result {
            Ok(()) => {
                self.db
                    .log
                    .append(None, Some(self.id), LogOperation::TransactionCommit);
                Ok(())
            }
            Err(err) => {
                self.db
                    .log
                    .append(None, Some(self.id), LogOperation::TransactionAbort);
                tracing::debug!(txn = %self.id, error = %err, "transaction aborted at commit");
                Err(err)
            }
        }
    }

    pub(crate) fn abort(self) {
        if self.began {
            self.db
                .log
                .append(None, Some(self.id), LogOperation::TransactionAbort);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::collection::CollectionProperties;
    use crate::database::Database;
    use crate::error::CoreError;
    use crate::index::IndexDefinition;
    use crate::log::EntryKind;
    use crate::tick::Tick;
    use serde_json::json;

    fn db() -> Database {
        let db = Database::open_in_memory();
        db.create_collection("c", CollectionProperties::default()).unwrap();
        db
    }

    fn kinds_after(db: &Database, after: &Tick) -> Vec<EntryKind> {
        db.log()
            .read_after(after, usize::MAX)
            .iter()
            .map(|e| e.kind())
            .collect()
    }

    #[test]
    fn commit_brackets_writes() {
        let db = db();
        let start = db.last_tick();
        db.transaction(|txn| {
            txn.insert("c", json!({"_key": "a"}))?;
            txn.update("c", "a", json!({"v": 1}))?;
            Ok(())
        })
        .unwrap();
        assert_eq!(
            kinds_after(&db, &start),
            vec![
                EntryKind::TransactionBegin,
                EntryKind::Insert,
                EntryKind::Update,
                EntryKind::TransactionCommit
            ]
        );
        let doc = db.document("c", "a").unwrap().unwrap();
        assert_eq!(doc.data["v"], json!(1));
    }

    #[test]
    fn failure_aborts_without_visible_writes() {
        let db = db();
        db.insert("c", json!({"_key": "keep"})).unwrap();
        let start = db.last_tick();
        let result: Result<(), CoreError> = db.transaction(|txn| {
            txn.insert("c", json!({"_key": "a"}))?;
            txn.remove("c", "keep")?;
            Err(CoreError::transaction_aborted("fail"))
        });
        assert!(result.is_err());
        assert_eq!(db.count("c").unwrap(), 1);
        assert!(db.document("c", "keep").unwrap().is_some());
        let kinds = kinds_after(&db, &start);
        assert_eq!(kinds.first(), Some(&EntryKind::TransactionBegin));
        assert_eq!(kinds.last(), Some(&EntryKind::TransactionAbort));
    }

    #[test]
    fn empty_transaction_logs_nothing() {
        let db = db();
        let start = db.last_tick();
        db.transaction(|_| Ok(())).unwrap();
        assert_eq!(db.last_tick(), start);
    }

    #[test]
    fn reads_see_own_writes() {
        let db = db();
        db.transaction(|txn| {
            txn.insert("c", json!({"_key": "a", "v": 1}))?;
            assert!(txn.document("c", "a")?.is_some());
            txn.remove("c", "a")?;
            assert!(txn.document("c", "a")?.is_none());
            txn.insert("c", json!({"_key": "a", "v": 2}))?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.document("c", "a").unwrap().unwrap().data["v"], json!(2));
    }

    #[test]
    fn unique_violation_at_commit_aborts() {
        let db = db();
        db.ensure_index("c", IndexDefinition::hash(["u"]).unique()).unwrap();
        db.insert("c", json!({"_key": "x", "u": 1})).unwrap();
        let result = db.transaction(|txn| {
            txn.insert("c", json!({"_key": "y", "u": 2}))?;
            txn.insert("c", json!({"_key": "z", "u": 1}))?;
            Ok(())
        });
        assert!(matches!(result, Err(CoreError::UniqueConstraintViolated { .. })));
        assert_eq!(db.count("c").unwrap(), 1);
        let entries = db.log().read_after(&Tick::zero(), usize::MAX);
        assert_eq!(entries.last().unwrap().kind(), EntryKind::TransactionAbort);
    }

    #[test]
    fn concurrent_change_conflicts() {
        let db = db();
        db.insert("c", json!({"_key": "a", "v": 0})).unwrap();
        let result = db.transaction(|txn| {
            txn.update("c", "a", json!({"v": 1}))?;
            db.update("c", "a", json!({"v": 99}))?;
            Ok(())
        });
        assert!(matches!(result, Err(CoreError::Conflict { .. })));
        assert_eq!(db.document("c", "a").unwrap().unwrap().data["v"], json!(99));
    }
}
