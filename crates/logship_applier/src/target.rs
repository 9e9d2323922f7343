//! Replica-side application of log entries.

use crate::error::{ApplierError, ApplierResult};
use logship_core::{
    CollectionId, CollectionInfo, CollectionProperties, CoreResult, Database, Document,
    IndexDefinition, IndexId, LogEntry, LogOperation, Tick, WriteOp,
};
use logship_protocol::FilterConfig;

/// The database a replica writes into.
///
/// Every operation addresses collections by the id they carry on the source
/// and must be idempotent, so that entries replayed after a restart leave the
/// replica unchanged.
pub trait ApplyTarget: Send + Sync {
    /// Recreates a collection from a snapshot, replacing any collection
    /// holding the same name or id.
    fn restore_collection(&self, info: &CollectionInfo, indexes: &[IndexDefinition])
        -> CoreResult<()>;

    /// Stores snapshot documents.
    fn restore_documents(&self, collection: CollectionId, documents: Vec<Document>)
        -> CoreResult<()>;

    /// Replays a collection creation.
    fn create_collection(&self, info: &CollectionInfo, indexes: &[IndexDefinition])
        -> CoreResult<()>;

    /// Drops a collection. Returns false if it did not exist.
    fn drop_collection(&self, collection: CollectionId) -> CoreResult<bool>;

    /// Renames a collection.
    fn rename_collection(&self, collection: CollectionId, new_name: &str) -> CoreResult<()>;

    /// Replaces the properties of a collection.
    fn change_properties(
        &self,
        collection: CollectionId,
        properties: &CollectionProperties,
    ) -> CoreResult<()>;

    /// Creates an index with the id it has on the source.
    fn create_index(&self, collection: CollectionId, index: &IndexDefinition) -> CoreResult<()>;

    /// Drops an index. Returns false if it did not exist.
    fn drop_index(&self, collection: CollectionId, index: IndexId) -> CoreResult<bool>;

    /// Applies document writes atomically.
    fn apply_writes(&self, writes: &[WriteOp]) -> CoreResult<()>;
}

impl ApplyTarget for Database {
    fn restore_collection(
        &self,
        info: &CollectionInfo,
        indexes: &[IndexDefinition],
    ) -> CoreResult<()> {
        Database::restore_collection(self, info, indexes)
    }

    fn restore_documents(&self, collection: CollectionId, documents: Vec<Document>) -> CoreResult<()> {
        Database::restore_documents(self, collection, documents)
    }

    fn create_collection(
        &self,
        info: &CollectionInfo,
        indexes: &[IndexDefinition],
    ) -> CoreResult<()> {
        self.apply_create_collection(info, indexes)
    }

    fn drop_collection(&self, collection: CollectionId) -> CoreResult<bool> {
        Ok(self.apply_drop_collection(collection))
    }

    fn rename_collection(&self, collection: CollectionId, new_name: &str) -> CoreResult<()> {
        self.apply_rename_collection(collection, new_name)
    }

    fn change_properties(
        &self,
        collection: CollectionId,
        properties: &CollectionProperties,
    ) -> CoreResult<()> {
        self.apply_properties(collection, properties)
    }

    fn create_index(&self, collection: CollectionId, index: &IndexDefinition) -> CoreResult<()> {
        self.apply_create_index(collection, index)
    }

    fn drop_index(&self, collection: CollectionId, index: IndexId) -> CoreResult<bool> {
        self.apply_drop_index(collection, index)
    }

    fn apply_writes(&self, writes: &[WriteOp]) -> CoreResult<()> {
        self.apply_batch(writes)
    }
}

/// Applies entries in order.
///
/// Runs of document entries are applied as one atomic batch, so the entries
/// of a committed transaction become visible together. Collection and index
/// entries are applied one by one between the runs. A rename whose new name
/// falls outside `filter` drops the collection instead.
pub fn apply_entries(
    target: &dyn ApplyTarget,
    filter: &FilterConfig,
    entries: &[LogEntry],
) -> ApplierResult<()> {
    let mut batch = WriteBatch::default();
    for entry in entries {
        match write_op(entry)? {
            Some(op) => batch.push(op, entry),
            None => {
                batch.flush(target)?;
                apply_definition(target, filter, entry)?;
            }
        }
    }
    batch.flush(target)
}

#[derive(Default)]
struct WriteBatch {
    writes: Vec<WriteOp>,
    last_tick: Option<Tick>,
    operation: &'static str,
}

impl WriteBatch {
    fn push(&mut self, op: WriteOp, entry: &LogEntry) {
        self.operation = if self.writes.is_empty() {
            entry.kind().as_str()
        } else {
            "transaction"
        };
        self.writes.push(op);
        self.last_tick = Some(entry.tick.clone());
    }

    fn flush(&mut self, target: &dyn ApplyTarget) -> ApplierResult<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let result = target.apply_writes(&self.writes);
        self.writes.clear();
        let tick = self.last_tick.take().unwrap_or_else(Tick::zero);
        result.map_err(|source| ApplierError::Apply {
            tick,
            operation: self.operation,
            source,
        })
    }
}

fn write_op(entry: &LogEntry) -> ApplierResult<Option<WriteOp>> {
    let document_op = entry.kind().is_document_operation();
    let collection = match entry.collection_id() {
        Some(id) => id,
        None if document_op => {
            return Err(ApplierError::InvalidResponse(format!(
                "{} at tick {} has no collection",
                entry.kind().as_str(),
                entry.tick
            )))
        }
        None => return Ok(None),
    };
    Ok(match &entry.operation {
        LogOperation::Insert { document } | LogOperation::Update { document } => {
            Some(WriteOp::Upsert {
                collection,
                document: document.clone(),
            })
        }
        LogOperation::Remove { key, .. } => Some(WriteOp::Delete {
            collection,
            key: key.clone(),
        }),
        _ => None,
    })
}

fn apply_definition(
    target: &dyn ApplyTarget,
    filter: &FilterConfig,
    entry: &LogEntry,
) -> ApplierResult<()> {
    let Some(collection) = &entry.collection else {
        return Ok(());
    };
    let id = collection.id;
    let result = match &entry.operation {
        LogOperation::CreateCollection {
            properties,
            indexes,
        } => {
            let info = CollectionInfo {
                id,
                name: collection.name.clone(),
                properties: properties.clone(),
            };
            target.create_collection(&info, indexes)
        }
        LogOperation::DropCollection => target.drop_collection(id).map(|_| ()),
        LogOperation::RenameCollection { new_name } => {
            if filter.in_scope(new_name, collection.is_system()) {
                target.rename_collection(id, new_name)
            } else {
                tracing::info!(
                    collection = %collection.name,
                    new_name = %new_name,
                    "collection renamed out of scope, dropping it"
                );
                target.drop_collection(id).map(|_| ())
            }
        }
        LogOperation::ChangeProperties { properties } => target.change_properties(id, properties),
        LogOperation::CreateIndex { index } => target.create_index(id, index),
        LogOperation::DropIndex { index_id } => target.drop_index(id, *index_id).map(|_| ()),
        _ => Ok(()),
    };
    result.map_err(|source| ApplierError::Apply {
        tick: entry.tick.clone(),
        operation: entry.kind().as_str(),
        source,
    })
}
