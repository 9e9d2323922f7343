//! Database facade.
//!
//! A [`Database`] holds collections, their indexes and documents, and the
//! replication log that records every change. The same type plays both
//! roles in a replication setup:
//!
//! - as a **source**, callers mutate it through the name-based operations
//!   ([`Database::insert`], [`Database::create_collection`], transactions)
//!   and each mutation appends one entry to [`Database::log`];
//! - as a **replica**, an applier drives the id-based operations
//!   ([`Database::apply_batch`], [`Database::apply_create_collection`], ...)
//!   which keep the source's ids and revisions and are idempotent, so a
//!   replayed entry leaves the replica unchanged.
//!
//! ## Locking
//!
//! Collection state sits behind one `parking_lot::RwLock`. A write takes the
//! state lock, then the log lock, and applies its change and appends its
//! entry before releasing either, so the log and the data never disagree
//! about which ticks are reflected. Source transactions additionally hold a
//! shared *gate* for their whole lifetime; [`Database::capture`] takes the
//! gate exclusively, which guarantees no transaction is open at the captured
//! boundary tick.

use crate::collection::{
    is_system_name, validate_collection_name, Collection, CollectionInfo, CollectionProperties,
    CollectionType, KeyGeneratorType, PropertiesUpdate, PutOutcome,
};
use crate::config::DatabaseConfig;
use crate::document::{split_body, validate_edge, Document, DocumentMeta};
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexDefinition, IndexKind};
use crate::log::{CollectionRef, LogEntry, LogOperation, ReplicationLog};
use crate::tick::Tick;
use crate::transaction::Transaction;
use crate::types::{CollectionId, IndexId, ServerId, TransactionId};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// A single document write addressed by collection id.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Store the document, replacing any document with the same key.
    Upsert {
        /// Target collection.
        collection: CollectionId,
        /// Document to store, with its revision.
        document: Document,
    },
    /// Remove the document if it exists.
    Delete {
        /// Target collection.
        collection: CollectionId,
        /// Key to remove.
        key: String,
    },
}

impl WriteOp {
    /// The collection the write targets.
    #[must_use]
    pub fn collection(&self) -> CollectionId {
        match self {
            Self::Upsert { collection, .. } | Self::Delete { collection, .. } => *collection,
        }
    }
}

/// A consistent copy of part of a database at a boundary tick.
#[derive(Debug, Clone)]
pub struct DatabaseView {
    /// Every entry up to and including this tick is reflected in the view.
    pub last_tick: Tick,
    /// Captured collections, in id order.
    pub collections: Vec<CollectionView>,
}

/// One collection inside a [`DatabaseView`].
#[derive(Debug, Clone)]
pub struct CollectionView {
    /// Identity and properties.
    pub info: CollectionInfo,
    /// All indexes including the primary one.
    pub indexes: Vec<IndexDefinition>,
    /// Documents in insertion order.
    pub documents: Vec<Document>,
}

#[derive(Debug, Default)]
pub(crate) struct DatabaseState {
    collections: BTreeMap<CollectionId, Collection>,
    names: HashMap<String, CollectionId>,
    next_collection_id: u64,
}

impl DatabaseState {
    pub(crate) fn by_name(&self, name: &str) -> CoreResult<&Collection> {
        self.names
            .get(name)
            .and_then(|id| self.collections.get(id))
            .ok_or_else(|| CoreError::collection_not_found(name))
    }

    fn by_name_mut(&mut self, name: &str) -> CoreResult<&mut Collection> {
        let id = *self
            .names
            .get(name)
            .ok_or_else(|| CoreError::collection_not_found(name))?;
        self.collections
            .get_mut(&id)
            .ok_or_else(|| CoreError::collection_not_found(name))
    }

    pub(crate) fn by_id(&self, id: CollectionId) -> CoreResult<&Collection> {
        self.collections
            .get(&id)
            .ok_or_else(|| CoreError::collection_not_found(id.to_string()))
    }

    fn by_id_mut(&mut self, id: CollectionId) -> CoreResult<&mut Collection> {
        self.collections
            .get_mut(&id)
            .ok_or_else(|| CoreError::collection_not_found(id.to_string()))
    }

    fn insert(&mut self, collection: Collection) {
        let id = collection.id();
        self.next_collection_id = self.next_collection_id.max(id.as_u64() + 1);
        self.names.insert(collection.name().to_string(), id);
        self.collections.insert(id, collection);
    }

    fn remove(&mut self, id: CollectionId) -> Option<Collection> {
        let collection = self.collections.remove(&id)?;
        self.names.remove(collection.name());
        Some(collection)
    }

    fn allocate_id(&mut self) -> CollectionId {
        self.next_collection_id = self.next_collection_id.max(1);
        let id = CollectionId::new(self.next_collection_id);
        self.next_collection_id += 1;
        id
    }
}

enum Undo {
    Put {
        collection: CollectionId,
        key: String,
        outcome: PutOutcome,
    },
    Delete {
        collection: CollectionId,
        seq: u64,
        document: Document,
    },
}

/// Reverse record of document writes, used to make a batch all-or-nothing.
#[derive(Default)]
pub(crate) struct UndoLog(Vec<Undo>);

impl UndoLog {
    pub(crate) fn rollback(self, state: &mut DatabaseState) {
        for undo in self.0.into_iter().rev() {
            match undo {
                Undo::Put {
                    collection,
                    key,
                    outcome,
                } => {
                    if let Some(c) = state.collections.get_mut(&collection) {
                        c.undo_put(&key, outcome);
                    }
                }
                Undo::Delete {
                    collection,
                    seq,
                    document,
                } => {
                    if let Some(c) = state.collections.get_mut(&collection) {
                        c.reinsert(seq, document);
                    }
                }
            }
        }
    }
}

/// Applies writes in order, recording how to undo them. Returns the log
/// records of the writes that changed something.
pub(crate) fn apply_writes(
    state: &mut DatabaseState,
    ops: &[WriteOp],
    undo: &mut UndoLog,
) -> CoreResult<Vec<(CollectionRef, LogOperation)>> {
    let mut applied = Vec::with_capacity(ops.len());
    for op in ops {
        let collection = state.by_id_mut(op.collection())?;
        let target = CollectionRef::new(collection.id(), collection.name());
        match op {
            WriteOp::Upsert { document, .. } => {
                let outcome = collection.put(document.clone())?;
                let operation = if outcome.previous.is_some() {
                    LogOperation::Update {
                        document: document.clone(),
                    }
                } else {
                    LogOperation::Insert {
                        document: document.clone(),
                    }
                };
                undo.0.push(Undo::Put {
                    collection: target.id,
                    key: document.key.clone(),
                    outcome,
                });
                applied.push((target, operation));
            }
            WriteOp::Delete { key, .. } => {
                if let Some((seq, document)) = collection.delete(key) {
                    let rev = document.rev.clone();
                    undo.0.push(Undo::Delete {
                        collection: target.id,
                        seq,
                        document,
                    });
                    applied.push((
                        target,
                        LogOperation::Remove {
                            key: key.clone(),
                            rev,
                        },
                    ));
                }
            }
        }
    }
    Ok(applied)
}

/// The database.
///
/// # Example
///
/// ```rust
/// use logship_core::{CollectionProperties, Database};
/// use serde_json::json;
///
/// let db = Database::open_in_memory();
/// db.create_collection("users", CollectionProperties::default())?;
/// db.insert("users", json!({"_key": "alice", "age": 30}))?;
///
/// db.transaction(|txn| {
///     txn.update("users", "alice", json!({"age": 31}))?;
///     txn.insert("users", json!({"_key": "bob"}))?;
///     Ok(())
/// })?;
///
/// assert_eq!(db.count("users")?, 2);
/// # Ok::<(), logship_core::CoreError>(())
/// ```
pub struct Database {
    config: DatabaseConfig,
    pub(crate) state: RwLock<DatabaseState>,
    pub(crate) log: ReplicationLog,
    gate: RwLock<()>,
    next_transaction_id: AtomicU64,
    key_counter: AtomicU64,
}

impl Database {
    /// Creates an empty database.
    #[must_use]
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            config,
            state: RwLock::new(DatabaseState::default()),
            log: ReplicationLog::new(),
            gate: RwLock::new(()),
            next_transaction_id: AtomicU64::new(1),
            key_counter: AtomicU64::new(0),
        }
    }

    /// Creates an empty database with the default configuration.
    #[must_use]
    pub fn open_in_memory() -> Self {
        Self::new(DatabaseConfig::default())
    }

    /// Returns the configuration.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Returns the server id.
    pub fn server_id(&self) -> ServerId {
        self.config.server_id
    }

    /// Returns the replication log.
    pub fn log(&self) -> &ReplicationLog {
        &self.log
    }

    /// Highest tick written so far.
    pub fn last_tick(&self) -> Tick {
        self.log.last_tick()
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Looks up a collection by name.
    pub fn collection(&self, name: &str) -> Option<CollectionInfo> {
        self.state.read().by_name(name).ok().map(|c| c.info().clone())
    }

    /// Looks up a collection by id.
    pub fn collection_by_id(&self, id: CollectionId) -> Option<CollectionInfo> {
        self.state.read().by_id(id).ok().map(|c| c.info().clone())
    }

    /// All collections, sorted by name.
    pub fn collections(&self) -> Vec<CollectionInfo> {
        let state = self.state.read();
        let mut infos: Vec<_> = state.collections.values().map(|c| c.info().clone()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Properties of a collection.
    pub fn properties(&self, name: &str) -> CoreResult<CollectionProperties> {
        Ok(self.state.read().by_name(name)?.info().properties.clone())
    }

    /// Indexes of a collection, primary index first.
    pub fn indexes(&self, name: &str) -> CoreResult<Vec<IndexDefinition>> {
        Ok(self.state.read().by_name(name)?.indexes().to_vec())
    }

    /// Reads a document.
    pub fn document(&self, collection: &str, key: &str) -> CoreResult<Option<Document>> {
        Ok(self.state.read().by_name(collection)?.get(key).cloned())
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> CoreResult<usize> {
        Ok(self.state.read().by_name(collection)?.count())
    }

    /// All documents of a collection in insertion order.
    pub fn all(&self, collection: &str) -> CoreResult<Vec<Document>> {
        Ok(self.state.read().by_name(collection)?.iter().cloned().collect())
    }

    /// The newest `n` documents, newest first.
    pub fn last(&self, collection: &str, n: usize) -> CoreResult<Vec<Document>> {
        Ok(self.state.read().by_name(collection)?.last(n))
    }

    /// Runs `f` against a collection under the read lock.
    pub(crate) fn with_collection<T>(
        &self,
        name: &str,
        f: impl FnOnce(&Collection) -> T,
    ) -> CoreResult<T> {
        let state = self.state.read();
        Ok(f(state.by_name(name)?))
    }

    // ------------------------------------------------------------------
    // Source operations
    // ------------------------------------------------------------------

    /// Creates a collection. Names with a leading underscore create system
    /// collections.
    pub fn create_collection(
        &self,
        name: &str,
        mut properties: CollectionProperties,
    ) -> CoreResult<CollectionInfo> {
        validate_collection_name(name)?;
        properties.is_system = is_system_name(name);
        if properties.key_options.increment == 0 {
            return Err(CoreError::invalid_operation("key increment must be positive"));
        }

        let mut state = self.state.write();
        if state.names.contains_key(name) {
            return Err(CoreError::DuplicateName {
                name: name.to_string(),
            });
        }
        let info = CollectionInfo {
            id: state.allocate_id(),
            name: name.to_string(),
            properties,
        };
        self.create_locked(&mut state, info.clone(), &[]);
        tracing::debug!(collection = %info.name, id = %info.id, "created collection");
        Ok(info)
    }

    /// Drops a collection and its documents.
    pub fn drop_collection(&self, name: &str) -> CoreResult<()> {
        let mut state = self.state.write();
        let id = state.by_name(name)?.id();
        self.drop_locked(&mut state, id);
        Ok(())
    }

    /// Renames a collection. A collection cannot change between system and
    /// non-system by renaming.
    pub fn rename_collection(&self, name: &str, new_name: &str) -> CoreResult<CollectionInfo> {
        validate_collection_name(new_name)?;
        let mut state = self.state.write();
        let collection = state.by_name(name)?;
        if is_system_name(new_name) != collection.info().is_system() {
            return Err(CoreError::IllegalName {
                name: new_name.to_string(),
            });
        }
        let id = collection.id();
        if name != new_name {
            if state.names.contains_key(new_name) {
                return Err(CoreError::DuplicateName {
                    name: new_name.to_string(),
                });
            }
            self.rename_locked(&mut state, id, new_name)?;
        }
        Ok(state.by_id(id)?.info().clone())
    }

    /// Changes the mutable properties of a collection.
    pub fn change_properties(
        &self,
        name: &str,
        update: &PropertiesUpdate,
    ) -> CoreResult<CollectionProperties> {
        let mut state = self.state.write();
        let collection = state.by_name_mut(name)?;
        let properties = update.apply_to(&collection.info().properties);
        collection.set_properties(properties.clone());
        self.log.append(
            Some(CollectionRef::new(collection.id(), collection.name())),
            None,
            LogOperation::ChangeProperties {
                properties: properties.clone(),
            },
        );
        Ok(properties)
    }

    /// Creates an index unless an identical one exists, returning the
    /// definition with its id.
    pub fn ensure_index(&self, name: &str, def: IndexDefinition) -> CoreResult<IndexDefinition> {
        def.validate()?;
        let mut state = self.state.write();
        let collection = state.by_name_mut(name)?;
        if let Some(existing) = collection.find_index(&def) {
            return Ok(existing.clone());
        }
        let def = def.with_id(collection.allocate_index_id());
        collection.add_index(def.clone())?;
        self.log.append(
            Some(CollectionRef::new(collection.id(), collection.name())),
            None,
            LogOperation::CreateIndex { index: def.clone() },
        );
        Ok(def)
    }

    /// Drops an index. Returns false if it did not exist.
    pub fn drop_index(&self, name: &str, index: IndexId) -> CoreResult<bool> {
        if index == IndexId::PRIMARY {
            return Err(CoreError::invalid_operation("cannot drop the primary index"));
        }
        let mut state = self.state.write();
        let collection = state.by_name_mut(name)?;
        if !collection.drop_index(index) {
            return Ok(false);
        }
        self.log.append(
            Some(CollectionRef::new(collection.id(), collection.name())),
            None,
            LogOperation::DropIndex { index_id: index },
        );
        Ok(true)
    }

    /// Inserts a document. A `_key` attribute in `body` sets the key,
    /// otherwise the collection's key generator picks one.
    pub fn insert(&self, collection: &str, body: Value) -> CoreResult<DocumentMeta> {
        let (user_key, data) = split_body(body)?;
        self.check_body(&data)?;
        let mut state = self.state.write();
        let target = state.by_name_mut(collection)?;
        let key = self.resolve_key(target, user_key)?;
        if target.get(&key).is_some() {
            return Err(CoreError::UniqueConstraintViolated {
                collection: collection.to_string(),
                index: IndexId::PRIMARY,
                key,
            });
        }
        self.put_logged(target, key, data, true)
    }

    /// Merges `patch` into an existing document.
    pub fn update(&self, collection: &str, key: &str, patch: Value) -> CoreResult<DocumentMeta> {
        let (_, patch) = split_body(patch)?;
        let mut state = self.state.write();
        let target = state.by_name_mut(collection)?;
        let existing = target
            .get(key)
            .ok_or_else(|| CoreError::document_not_found(collection, key))?;
        let data = existing.merged(patch);
        self.check_body(&data)?;
        self.put_logged(target, key.to_string(), data, false)
    }

    /// Replaces the body of an existing document.
    pub fn replace(&self, collection: &str, key: &str, body: Value) -> CoreResult<DocumentMeta> {
        let (_, data) = split_body(body)?;
        self.check_body(&data)?;
        let mut state = self.state.write();
        let target = state.by_name_mut(collection)?;
        if target.get(key).is_none() {
            return Err(CoreError::document_not_found(collection, key));
        }
        self.put_logged(target, key.to_string(), data, false)
    }

    /// Removes a document, returning the removed revision.
    pub fn remove(&self, collection: &str, key: &str) -> CoreResult<DocumentMeta> {
        let mut state = self.state.write();
        let target = state.by_name_mut(collection)?;
        let rev = target
            .get(key)
            .map(|d| d.rev.clone())
            .ok_or_else(|| CoreError::document_not_found(collection, key))?;
        let reference = CollectionRef::new(target.id(), target.name());
        self.log.append_with(|tick| {
            target.delete(key);
            Ok(LogEntry {
                tick: tick.clone(),
                collection: Some(reference),
                transaction_id: None,
                operation: LogOperation::Remove {
                    key: key.to_string(),
                    rev: rev.clone(),
                },
            })
        })?;
        Ok(DocumentMeta {
            key: key.to_string(),
            rev,
        })
    }

    /// Runs `f` as one atomic transaction.
    ///
    /// Writes are logged as they happen, bracketed by begin and commit
    /// markers, and become visible to readers only when `f` returns `Ok`
    /// and the commit succeeds. If `f` fails, nothing becomes visible and an
    /// abort marker closes the transaction in the log. Transactions cannot
    /// be nested.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> CoreResult<T>,
    {
        let _gate = self.gate.read();
        let id = TransactionId::new(self.next_transaction_id.fetch_add(1, Ordering::SeqCst));
        let mut txn = Transaction::new(self, id);
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }

    /// Captures a consistent copy of the collections selected by `include`.
    ///
    /// Waits until no transaction is open and blocks new ones while copying.
    /// Every log entry with a tick up to [`DatabaseView::last_tick`] is
    /// reflected in the copy, and every later entry is not.
    pub fn capture<F>(&self, include: F) -> DatabaseView
    where
        F: Fn(&CollectionInfo) -> bool,
    {
        let _gate = self.gate.write();
        let state = self.state.read();
        let last_tick = self.log.last_tick();
        let collections = state
            .collections
            .values()
            .filter(|c| include(c.info()))
            .map(|c| CollectionView {
                info: c.info().clone(),
                indexes: c.indexes().to_vec(),
                documents: c.iter().cloned().collect(),
            })
            .collect();
        DatabaseView {
            last_tick,
            collections,
        }
    }

    // ------------------------------------------------------------------
    // Replica operations
    // ------------------------------------------------------------------

    /// Recreates a collection with the given id, properties and indexes,
    /// dropping any collection that holds the name or the id.
    pub fn restore_collection(
        &self,
        info: &CollectionInfo,
        indexes: &[IndexDefinition],
    ) -> CoreResult<()> {
        validate_collection_name(&info.name)?;
        let mut state = self.state.write();
        if let Some(&existing) = state.names.get(&info.name) {
            self.drop_locked(&mut state, existing);
        }
        if state.collections.contains_key(&info.id) {
            self.drop_locked(&mut state, info.id);
        }
        self.create_locked(&mut state, info.clone(), indexes);
        Ok(())
    }

    /// Replays a collection creation.
    ///
    /// If the id already exists under the same name only the properties and
    /// missing indexes are brought in line; existing documents stay.
    pub fn apply_create_collection(
        &self,
        info: &CollectionInfo,
        indexes: &[IndexDefinition],
    ) -> CoreResult<()> {
        {
            let mut state = self.state.write();
            if let Ok(existing) = state.by_id_mut(info.id) {
                if existing.name() == info.name {
                    existing.set_properties(info.properties.clone());
                    for def in indexes {
                        if def.kind != IndexKind::Primary && existing.index(def.id).is_none() {
                            existing.add_index(def.clone())?;
                        }
                    }
                    return Ok(());
                }
            }
        }
        self.restore_collection(info, indexes)
    }

    /// Drops a collection by id. Returns false if it did not exist.
    pub fn apply_drop_collection(&self, id: CollectionId) -> bool {
        let mut state = self.state.write();
        if !state.collections.contains_key(&id) {
            return false;
        }
        self.drop_locked(&mut state, id);
        true
    }

    /// Renames a collection by id. Renaming to the current name is a no-op.
    pub fn apply_rename_collection(&self, id: CollectionId, new_name: &str) -> CoreResult<()> {
        validate_collection_name(new_name)?;
        let mut state = self.state.write();
        if state.by_id(id)?.name() == new_name {
            return Ok(());
        }
        if state.names.contains_key(new_name) {
            return Err(CoreError::DuplicateName {
                name: new_name.to_string(),
            });
        }
        self.rename_locked(&mut state, id, new_name)
    }

    /// Replaces the properties of a collection by id.
    pub fn apply_properties(
        &self,
        id: CollectionId,
        properties: &CollectionProperties,
    ) -> CoreResult<()> {
        let mut state = self.state.write();
        let collection = state.by_id_mut(id)?;
        if &collection.info().properties == properties {
            return Ok(());
        }
        collection.set_properties(properties.clone());
        self.log.append(
            Some(CollectionRef::new(collection.id(), collection.name())),
            None,
            LogOperation::ChangeProperties {
                properties: properties.clone(),
            },
        );
        Ok(())
    }

    /// Creates an index with a given id. An identical index under that id is
    /// left alone; a different one is replaced.
    pub fn apply_create_index(&self, id: CollectionId, def: &IndexDefinition) -> CoreResult<()> {
        if def.kind == IndexKind::Primary {
            return Ok(());
        }
        let mut state = self.state.write();
        let collection = state.by_id_mut(id)?;
        match collection.index(def.id) {
            Some(existing) if existing.same_shape(def) => return Ok(()),
            Some(_) => {
                collection.drop_index(def.id);
            }
            None => {}
        }
        collection.add_index(def.clone())?;
        self.log.append(
            Some(CollectionRef::new(collection.id(), collection.name())),
            None,
            LogOperation::CreateIndex { index: def.clone() },
        );
        Ok(())
    }

    /// Drops an index by id. Returns false if it did not exist.
    pub fn apply_drop_index(&self, id: CollectionId, index: IndexId) -> CoreResult<bool> {
        let mut state = self.state.write();
        let collection = state.by_id_mut(id)?;
        if index == IndexId::PRIMARY || !collection.drop_index(index) {
            return Ok(false);
        }
        self.log.append(
            Some(CollectionRef::new(collection.id(), collection.name())),
            None,
            LogOperation::DropIndex { index_id: index },
        );
        Ok(true)
    }

    /// Applies document writes as one atomic unit.
    ///
    /// Upserts replace or create, deletes of missing keys are no-ops. If any
    /// write fails, every earlier write of the batch is undone and the error
    /// is returned. Writes that changed something are logged, bracketed as a
    /// transaction when there is more than one.
    pub fn apply_batch(&self, ops: &[WriteOp]) -> CoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write();
        let mut undo = UndoLog::default();
        let applied = match apply_writes(&mut state, ops, &mut undo) {
            Ok(applied) => applied,
            Err(err) => {
                undo.rollback(&mut state);
                return Err(err);
            }
        };
        match applied.len() {
            0 => {}
            1 => {
                for (reference, operation) in applied {
                    self.log.append(Some(reference), None, operation);
                }
            }
            _ => {
                let id = TransactionId::new(self.next_transaction_id.fetch_add(1, Ordering::SeqCst));
                self.log.append(None, Some(id), LogOperation::TransactionBegin);
                for (reference, operation) in applied {
                    self.log.append(Some(reference), Some(id), operation);
                }
                self.log.append(None, Some(id), LogOperation::TransactionCommit);
            }
        }
        Ok(())
    }

    /// Stores documents into a collection, keeping their keys and revisions.
    pub fn restore_documents(&self, id: CollectionId, documents: Vec<Document>) -> CoreResult<()> {
        let ops: Vec<WriteOp> = documents
            .into_iter()
            .map(|document| WriteOp::Upsert {
                collection: id,
                document,
            })
            .collect();
        self.apply_batch(&ops)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    pub(crate) fn check_body(&self, data: &Map<String, Value>) -> CoreResult<()> {
        let size = serde_json::to_vec(data)
            .map_err(|e| CoreError::invalid_document(e.to_string()))?
            .len();
        if size > self.config.max_document_size {
            return Err(CoreError::invalid_document(format!(
                "document of {size} bytes exceeds the limit of {}",
                self.config.max_document_size
            )));
        }
        Ok(())
    }

    pub(crate) fn resolve_key(
        &self,
        collection: &Collection,
        user_key: Option<String>,
    ) -> CoreResult<String> {
        let options = &collection.info().properties.key_options;
        if let Some(key) = user_key {
            if !options.allow_user_keys {
                return Err(CoreError::invalid_document(format!(
                    "collection {} does not allow user-defined keys",
                    collection.name()
                )));
            }
            return Ok(key);
        }
        Ok(match options.generator {
            KeyGeneratorType::Autoincrement => collection.next_autoincrement_key(),
            KeyGeneratorType::Traditional => loop {
                let key = (self.key_counter.fetch_add(1, Ordering::SeqCst) + 1).to_string();
                if collection.get(&key).is_none() {
                    break key;
                }
            },
        })
    }

    pub(crate) fn validate_type(
        collection: &Collection,
        data: &Map<String, Value>,
    ) -> CoreResult<()> {
        if collection.info().properties.collection_type == CollectionType::Edge {
            validate_edge(data)?;
        }
        Ok(())
    }

    fn put_logged(
        &self,
        target: &mut Collection,
        key: String,
        data: Map<String, Value>,
        insert: bool,
    ) -> CoreResult<DocumentMeta> {
        Self::validate_type(target, &data)?;
        let reference = CollectionRef::new(target.id(), target.name());
        let tick = self.log.append_with(|tick| {
            let document = Document::new(key.clone(), tick.clone(), data);
            target.put(document.clone())?;
            let operation = if insert {
                LogOperation::Insert { document }
            } else {
                LogOperation::Update { document }
            };
            Ok(LogEntry {
                tick: tick.clone(),
                collection: Some(reference),
                transaction_id: None,
                operation,
            })
        })?;
        Ok(DocumentMeta { key, rev: tick })
    }

    fn create_locked(
        &self,
        state: &mut DatabaseState,
        info: CollectionInfo,
        indexes: &[IndexDefinition],
    ) {
        let mut collection = Collection::new(info.clone());
        for def in indexes.iter().filter(|d| d.kind != IndexKind::Primary) {
            if let Err(err) = collection.add_index(def.clone()) {
                tracing::warn!(collection = %info.name, index = %def.id, error = %err, "skipped index");
            }
        }
        self.log.append(
            Some(CollectionRef::new(info.id, info.name.clone())),
            None,
            LogOperation::CreateCollection {
                properties: info.properties.clone(),
                indexes: collection.indexes().to_vec(),
            },
        );
        state.insert(collection);
    }

    fn drop_locked(&self, state: &mut DatabaseState, id: CollectionId) {
        if let Some(collection) = state.remove(id) {
            self.log.append(
                Some(CollectionRef::new(id, collection.name())),
                None,
                LogOperation::DropCollection,
            );
            tracing::debug!(collection = %collection.name(), %id, "dropped collection");
        }
    }

    fn rename_locked(
        &self,
        state: &mut DatabaseState,
        id: CollectionId,
        new_name: &str,
    ) -> CoreResult<()> {
        let collection = state.by_id_mut(id)?;
        let old_name = collection.name().to_string();
        collection.rename(new_name.to_string());
        state.names.remove(&old_name);
        state.names.insert(new_name.to_string(), id);
        self.log.append(
            Some(CollectionRef::new(id, old_name)),
            None,
            LogOperation::RenameCollection {
                new_name: new_name.to_string(),
            },
        );
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("server_id", &self.config.server_id)
            .field("last_tick", &self.log.last_tick())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::KeyOptions;
    use crate::log::EntryKind;
    use serde_json::json;

    fn db_with(name: &str) -> Database {
        let db = Database::open_in_memory();
        db.create_collection(name, CollectionProperties::default()).unwrap();
        db
    }

    fn kinds(db: &Database) -> Vec<EntryKind> {
        db.log()
            .read_after(&Tick::zero(), usize::MAX)
            .iter()
            .map(LogEntry::kind)
            .collect()
    }

    #[test]
    fn writes_are_logged_with_their_revision() {
        let db = db_with("c");
        let meta = db.insert("c", json!({"_key": "a", "v": 1})).unwrap();
        let doc = db.document("c", "a").unwrap().unwrap();
        assert_eq!(doc.rev, meta.rev);
        assert_eq!(db.last_tick(), meta.rev);

        db.update("c", "a", json!({"w": 2})).unwrap();
        db.remove("c", "a").unwrap();
        assert_eq!(
            kinds(&db),
            vec![
                EntryKind::CreateCollection,
                EntryKind::Insert,
                EntryKind::Update,
                EntryKind::Remove
            ]
        );
    }

    #[test]
    fn rejected_writes_leave_no_trace() {
        let db = db_with("c");
        db.ensure_index("c", IndexDefinition::hash(["u"]).unique()).unwrap();
        db.insert("c", json!({"u": 1})).unwrap();
        let before = db.last_tick();
        let err = db.insert("c", json!({"u": 1})).unwrap_err();
        assert!(matches!(err, CoreError::UniqueConstraintViolated { .. }));
        assert_eq!(db.last_tick(), before);
        assert_eq!(db.count("c").unwrap(), 1);
    }

    #[test]
    fn duplicate_key_is_a_unique_violation() {
        let db = db_with("c");
        db.insert("c", json!({"_key": "x"})).unwrap();
        let err = db.insert("c", json!({"_key": "x"})).unwrap_err();
        assert!(matches!(
            err,
            CoreError::UniqueConstraintViolated {
                index: IndexId::PRIMARY,
                ..
            }
        ));
    }

    #[test]
    fn system_flag_follows_name() {
        let db = Database::open_in_memory();
        let info = db
            .create_collection("_sys", CollectionProperties::default())
            .unwrap();
        assert!(info.is_system());
        assert!(matches!(
            db.rename_collection("_sys", "plain"),
            Err(CoreError::IllegalName { .. })
        ));
    }

    #[test]
    fn rename_and_back() {
        let db = db_with("a");
        db.insert("a", json!({"_key": "k"})).unwrap();
        let id = db.collection("a").unwrap().id;
        db.rename_collection("a", "b").unwrap();
        assert!(db.collection("a").is_none());
        db.rename_collection("b", "a").unwrap();
        assert_eq!(db.collection("a").unwrap().id, id);
        assert_eq!(db.count("a").unwrap(), 1);
    }

    #[test]
    fn user_keys_can_be_forbidden() {
        let db = Database::open_in_memory();
        db.create_collection(
            "c",
            CollectionProperties::default()
                .with_key_options(KeyOptions::default().with_user_keys(false)),
        )
        .unwrap();
        assert!(db.insert("c", json!({"_key": "mine"})).is_err());
        let meta = db.insert("c", json!({})).unwrap();
        assert!(meta.key.parse::<u64>().is_ok());
    }

    #[test]
    fn edges_are_validated() {
        let db = Database::open_in_memory();
        db.create_collection("e", CollectionProperties::edge()).unwrap();
        assert!(db.insert("e", json!({"_from": "v/1"})).is_err());
        db.insert("e", json!({"_from": "v/1", "_to": "v/2"})).unwrap();
    }

    #[test]
    fn ensure_index_is_idempotent() {
        let db = db_with("c");
        let first = db.ensure_index("c", IndexDefinition::skiplist(["a", "b"])).unwrap();
        let again = db.ensure_index("c", IndexDefinition::skiplist(["a", "b"])).unwrap();
        assert_eq!(first, again);
        assert_eq!(db.indexes("c").unwrap().len(), 2);
        assert!(db.drop_index("c", first.id).unwrap());
        assert!(!db.drop_index("c", first.id).unwrap());
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let db = db_with("c");
        let id = db.collection("c").unwrap().id;
        db.apply_create_index(id, &IndexDefinition::hash(["u"]).unique().with_id(IndexId::new(4)))
            .unwrap();
        let doc = |key: &str, u: i64| Document::new(key, Tick::from(1), json!({"u": u}).as_object().unwrap().clone());
        db.apply_batch(&[WriteOp::Upsert { collection: id, document: doc("a", 1) }])
            .unwrap();

        let before = db.last_tick();
        let result = db.apply_batch(&[
            WriteOp::Upsert { collection: id, document: doc("b", 2) },
            WriteOp::Delete { collection: id, key: "a".into() },
            WriteOp::Upsert { collection: id, document: doc("c", 2) },
        ]);
        assert!(matches!(result, Err(CoreError::UniqueConstraintViolated { .. })));
        assert_eq!(db.last_tick(), before);
        let keys: Vec<String> = db.all("c").unwrap().into_iter().map(|d| d.key).collect();
        assert_eq!(keys, vec!["a"]);
    }

    #[test]
    fn replayed_writes_are_idempotent() {
        let db = db_with("c");
        let id = db.collection("c").unwrap().id;
        let doc = Document::new("a", Tick::from(9), Map::new());
        let insert = [WriteOp::Upsert { collection: id, document: doc }];
        db.apply_batch(&insert).unwrap();
        db.apply_batch(&insert).unwrap();
        assert_eq!(db.count("c").unwrap(), 1);

        let remove = [WriteOp::Delete { collection: id, key: "a".into() }];
        db.apply_batch(&remove).unwrap();
        db.apply_batch(&remove).unwrap();
        assert_eq!(db.count("c").unwrap(), 0);
    }

    #[test]
    fn replayed_create_keeps_documents() {
        let db = db_with("c");
        let info = db.collection("c").unwrap();
        db.insert("c", json!({"_key": "k"})).unwrap();
        db.apply_create_collection(&info, &[IndexDefinition::primary()]).unwrap();
        assert_eq!(db.count("c").unwrap(), 1);
        assert!(!db.apply_drop_collection(CollectionId::new(999)));
    }

    #[test]
    fn restore_replaces_conflicting_collection() {
        let db = db_with("c");
        db.insert("c", json!({})).unwrap();
        let info = CollectionInfo {
            id: CollectionId::new(77),
            name: "c".into(),
            properties: CollectionProperties::default(),
        };
        db.restore_collection(&info, &[IndexDefinition::cap(5).with_id(IndexId::new(3))])
            .unwrap();
        let restored = db.collection("c").unwrap();
        assert_eq!(restored.id, CollectionId::new(77));
        assert_eq!(db.count("c").unwrap(), 0);
        assert_eq!(db.indexes("c").unwrap()[1].id, IndexId::new(3));

        // new collections never reuse a restored id
        let next = db.create_collection("d", CollectionProperties::default()).unwrap();
        assert!(next.id > CollectionId::new(77));
    }

    #[test]
    fn capture_reflects_boundary() {
        let db = db_with("c");
        db.insert("c", json!({"_key": "a"})).unwrap();
        let view = db.capture(|_| true);
        db.insert("c", json!({"_key": "b"})).unwrap();
        assert_eq!(view.last_tick, Tick::from(2));
        assert_eq!(view.collections[0].documents.len(), 1);
    }
}
