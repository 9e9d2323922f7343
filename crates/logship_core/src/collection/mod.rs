//! Collection storage.

mod properties;

pub use properties::{
    is_system_name, validate_collection_name, CollectionInfo, CollectionProperties,
    CollectionType, KeyGeneratorType, KeyOptions, PropertiesUpdate, DEFAULT_JOURNAL_SIZE,
    MAX_NAME_LENGTH,
};

use crate::document::Document;
use crate::error::CoreResult;
use crate::index::{IndexDefinition, IndexSet};
use crate::types::{CollectionId, IndexId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// A stored document and its insertion sequence.
#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    doc: Document,
}

/// What a put displaced, kept so the write can be undone.
#[derive(Debug, Clone, Default)]
pub(crate) struct PutOutcome {
    pub(crate) previous: Option<(u64, Document)>,
    pub(crate) evicted: Vec<(u64, Document)>,
}

/// Documents of one collection, kept in insertion order.
///
/// Updates keep a document's position; only inserts append. Cap constraints
/// evict from the front, so a replica that receives the same inserts in the
/// same order evicts the same documents.
#[derive(Debug)]
pub(crate) struct Collection {
    info: CollectionInfo,
    indexes: IndexSet,
    documents: HashMap<String, Slot>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
    autoincrement: AtomicU64,
}

impl Collection {
    pub(crate) fn new(info: CollectionInfo) -> Self {
        Self {
            info,
            indexes: IndexSet::new(),
            documents: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 1,
            autoincrement: AtomicU64::new(0),
        }
    }

    pub(crate) fn info(&self) -> &CollectionInfo {
        &self.info
    }

    pub(crate) fn id(&self) -> CollectionId {
        self.info.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.info.name
    }

    pub(crate) fn rename(&mut self, name: String) {
        self.info.name = name;
    }

    pub(crate) fn set_properties(&mut self, properties: CollectionProperties) {
        self.info.properties = properties;
    }

    pub(crate) fn count(&self) -> usize {
        self.documents.len()
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Document> {
        self.documents.get(key).map(|slot| &slot.doc)
    }

    /// Documents in insertion order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Document> + '_ {
        self.order
            .values()
            .filter_map(move |key| self.documents.get(key).map(|slot| &slot.doc))
    }

    /// The newest `n` documents, newest first.
    pub(crate) fn last(&self, n: usize) -> Vec<Document> {
        self.order
            .values()
            .rev()
            .take(n)
            .filter_map(|key| self.documents.get(key).map(|slot| slot.doc.clone()))
            .collect()
    }

    pub(crate) fn indexes(&self) -> &[IndexDefinition] {
        self.indexes.definitions()
    }

    /// Next key of an autoincrement generator, skipping keys already taken.
    pub(crate) fn next_autoincrement_key(&self) -> String {
        let options = &self.info.properties.key_options;
        loop {
            let n = self.autoincrement.fetch_add(1, Ordering::SeqCst) + 1;
            let key = (options.offset + n * options.increment.max(1)).to_string();
            if !self.documents.contains_key(&key) {
                return key;
            }
        }
    }

    /// Checks whether `doc` could be stored without violating an index.
    pub(crate) fn check_put(&self, doc: &Document) -> CoreResult<()> {
        self.indexes.check(&self.info.name, doc)
    }

    /// Stores `doc`, replacing any document with the same key, then applies
    /// cap constraints.
    pub(crate) fn put(&mut self, doc: Document) -> CoreResult<PutOutcome> {
        self.check_put(&doc)?;
        let mut outcome = PutOutcome::default();
        match self.documents.get_mut(&doc.key) {
            Some(slot) => {
                self.indexes.remove(&slot.doc);
                self.indexes.insert(&doc);
                let previous = std::mem::replace(&mut slot.doc, doc);
                outcome.previous = Some((slot.seq, previous));
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.indexes.insert(&doc);
                self.order.insert(seq, doc.key.clone());
                self.documents.insert(doc.key.clone(), Slot { seq, doc });
            }
        }
        outcome.evicted = self.enforce_cap();
        Ok(outcome)
    }

    /// Removes a document if present.
    pub(crate) fn delete(&mut self, key: &str) -> Option<(u64, Document)> {
        let slot = self.documents.remove(key)?;
        self.order.remove(&slot.seq);
        self.indexes.remove(&slot.doc);
        Some((slot.seq, slot.doc))
    }

    /// Puts a document back at its original position. Only used to undo.
    pub(crate) fn reinsert(&mut self, seq: u64, doc: Document) {
        self.delete(&doc.key);
        self.indexes.insert(&doc);
        self.order.insert(seq, doc.key.clone());
        self.documents.insert(doc.key.clone(), Slot { seq, doc });
    }

    /// Reverts a put using the outcome it returned.
    pub(crate) fn undo_put(&mut self, key: &str, outcome: PutOutcome) {
        self.delete(key);
        if let Some((seq, previous)) = outcome.previous {
            self.reinsert(seq, previous);
        }
        for (seq, doc) in outcome.evicted {
            self.reinsert(seq, doc);
        }
    }

    pub(crate) fn find_index(&self, def: &IndexDefinition) -> Option<&IndexDefinition> {
        self.indexes.find_same_shape(def)
    }

    pub(crate) fn index(&self, id: IndexId) -> Option<&IndexDefinition> {
        self.indexes.get(id)
    }

    pub(crate) fn allocate_index_id(&mut self) -> IndexId {
        self.indexes.allocate_id()
    }

    /// Adds an index with the id already set on `def`, evicting documents if
    /// it is a cap constraint smaller than the collection.
    pub(crate) fn add_index(&mut self, def: IndexDefinition) -> CoreResult<()> {
        let documents: Vec<&Document> = self.iter().collect();
        let mut indexes = self.indexes.clone();
        indexes.add(&self.info.name, def, documents)?;
        self.indexes = indexes;
        self.enforce_cap();
        Ok(())
    }

    pub(crate) fn drop_index(&mut self, id: IndexId) -> bool {
        self.indexes.remove_index(id)
    }

    fn enforce_cap(&mut self) -> Vec<(u64, Document)> {
        let mut evicted = Vec::new();
        let Some(cap) = self.indexes.cap() else {
            return evicted;
        };
        while self.documents.len() > cap {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            if let Some(slot) = self.documents.remove(&key) {
                self.indexes.remove(&slot.doc);
                evicted.push((slot.seq, slot.doc));
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::tick::Tick;
    use serde_json::{json, Value};

    fn collection() -> Collection {
        Collection::new(CollectionInfo {
            id: CollectionId::new(1),
            name: "c".into(),
            properties: CollectionProperties::default(),
        })
    }

    fn doc(key: &str, body: Value) -> Document {
        Document::new(key, Tick::from(1), body.as_object().unwrap().clone())
    }

    fn keys(c: &Collection) -> Vec<String> {
        c.iter().map(|d| d.key.clone()).collect()
    }

    #[test]
    fn updates_keep_position() {
        let mut c = collection();
        c.put(doc("a", json!({"v": 1}))).unwrap();
        c.put(doc("b", json!({"v": 1}))).unwrap();
        c.put(doc("a", json!({"v": 2}))).unwrap();
        assert_eq!(keys(&c), vec!["a", "b"]);
        assert_eq!(c.get("a").unwrap().data["v"], json!(2));
    }

    #[test]
    fn cap_keeps_newest() {
        let mut c = collection();
        c.add_index(IndexDefinition::cap(3).with_id(IndexId::new(1))).unwrap();
        for i in 0..10 {
            c.put(doc(&format!("k{i}"), json!({"i": i}))).unwrap();
        }
        assert_eq!(c.count(), 3);
        let last: Vec<String> = c.last(3).into_iter().map(|d| d.key).collect();
        assert_eq!(last, vec!["k9", "k8", "k7"]);
    }

    #[test]
    fn cap_added_later_trims_oldest() {
        let mut c = collection();
        for i in 0..5 {
            c.put(doc(&format!("k{i}"), json!({}))).unwrap();
        }
        c.add_index(IndexDefinition::cap(2).with_id(IndexId::new(1))).unwrap();
        assert_eq!(keys(&c), vec!["k3", "k4"]);
    }

    #[test]
    fn undo_restores_previous_state() {
        let mut c = collection();
        c.add_index(IndexDefinition::cap(2).with_id(IndexId::new(1))).unwrap();
        c.put(doc("a", json!({"v": 1}))).unwrap();
        c.put(doc("b", json!({"v": 1}))).unwrap();

        let outcome = c.put(doc("c", json!({"v": 1}))).unwrap();
        assert_eq!(keys(&c), vec!["b", "c"]);
        c.undo_put("c", outcome);
        assert_eq!(keys(&c), vec!["a", "b"]);

        let outcome = c.put(doc("a", json!({"v": 9}))).unwrap();
        c.undo_put("a", outcome);
        assert_eq!(c.get("a").unwrap().data["v"], json!(1));
        assert_eq!(keys(&c), vec!["a", "b"]);
    }

    #[test]
    fn unique_index_blocks_put() {
        let mut c = collection();
        c.add_index(IndexDefinition::hash(["u"]).unique().with_id(IndexId::new(1)))
            .unwrap();
        c.put(doc("a", json!({"u": "x"}))).unwrap();
        let err = c.put(doc("b", json!({"u": "x"}))).unwrap_err();
        assert!(matches!(err, CoreError::UniqueConstraintViolated { .. }));
        assert_eq!(c.count(), 1);
        c.delete("a").unwrap();
        c.put(doc("b", json!({"u": "x"}))).unwrap();
    }

    #[test]
    fn autoincrement_keys() {
        let mut c = Collection::new(CollectionInfo {
            id: CollectionId::new(1),
            name: "c".into(),
            properties: CollectionProperties::default()
                .with_key_options(KeyOptions::autoincrement(10, 100)),
        });
        assert_eq!(c.next_autoincrement_key(), "110");
        c.put(doc("120", json!({}))).unwrap();
        assert_eq!(c.next_autoincrement_key(), "130");
    }
}
