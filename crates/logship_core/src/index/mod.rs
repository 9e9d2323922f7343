//! Secondary index definitions and unique-constraint bookkeeping.
//!
//! Indexes in logship exist to constrain writes, not to answer queries:
//! unique hash and skiplist indexes reject duplicate values, and a cap
//! constraint bounds the number of documents a collection keeps.

use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::types::IndexId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Index type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// The key index every collection has.
    Primary,
    /// Equality index.
    Hash,
    /// Sorted index.
    Skiplist,
    /// Keeps only the newest `size` documents.
    Cap,
}

/// An index definition as created on the source and replayed on replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Id within the collection.
    pub id: IndexId,
    /// Index type.
    #[serde(rename = "type")]
    pub kind: IndexKind,
    /// Indexed attribute paths.
    pub fields: Vec<String>,
    /// Whether the index rejects duplicate values.
    pub unique: bool,
    /// Whether documents with missing or null values are skipped.
    pub sparse: bool,
    /// Document limit of a cap constraint.
    pub size: Option<u64>,
}

impl IndexDefinition {
    /// The primary index.
    #[must_use]
    pub fn primary() -> Self {
        Self {
            id: IndexId::PRIMARY,
            kind: IndexKind::Primary,
            fields: vec!["_key".to_string()],
            unique: true,
            sparse: false,
            size: None,
        }
    }

    /// A hash index over `fields`.
    pub fn hash<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::over(IndexKind::Hash, fields)
    }

    /// A skiplist index over `fields`.
    pub fn skiplist<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::over(IndexKind::Skiplist, fields)
    }

    /// A cap constraint keeping at most `size` documents.
    #[must_use]
    pub fn cap(size: u64) -> Self {
        Self {
            id: IndexId::PRIMARY,
            kind: IndexKind::Cap,
            fields: Vec::new(),
            unique: false,
            sparse: false,
            size: Some(size),
        }
    }

    fn over<I, S>(kind: IndexKind, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: IndexId::PRIMARY,
            kind,
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
            sparse: false,
            size: None,
        }
    }

    /// Marks the index unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Marks the index sparse.
    #[must_use]
    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    /// Returns the definition with a specific id.
    #[must_use]
    pub fn with_id(mut self, id: IndexId) -> Self {
        self.id = id;
        self
    }

    /// Compares everything except the id.
    #[must_use]
    pub fn same_shape(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.fields == other.fields
            && self.unique == other.unique
            && self.sparse == other.sparse
            && self.size == other.size
    }

    /// Checks that the definition can be created by a caller.
    pub fn validate(&self) -> CoreResult<()> {
        match self.kind {
            IndexKind::Primary => Err(CoreError::invalid_index(
                "the primary index cannot be created explicitly",
            )),
            IndexKind::Hash | IndexKind::Skiplist => {
                if self.fields.is_empty() {
                    return Err(CoreError::invalid_index("at least one field is required"));
                }
                if self.fields.iter().any(|f| f.is_empty()) {
                    return Err(CoreError::invalid_index("empty field name"));
                }
                Ok(())
            }
            IndexKind::Cap => match self.size {
                Some(size) if size > 0 => Ok(()),
                _ => Err(CoreError::invalid_index("cap constraint requires size > 0")),
            },
        }
    }

    fn value_key(&self, doc: &Document) -> Option<String> {
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = doc.attribute(field).cloned().unwrap_or(Value::Null);
            if self.sparse && value.is_null() {
                return None;
            }
            values.push(value);
        }
        Some(Value::Array(values).to_string())
    }
}

/// The indexes of one collection.
#[derive(Debug, Clone)]
pub(crate) struct IndexSet {
    definitions: Vec<IndexDefinition>,
    unique_values: HashMap<IndexId, HashMap<String, String>>,
    next_id: u64,
}

impl IndexSet {
    pub(crate) fn new() -> Self {
        Self {
            definitions: vec![IndexDefinition::primary()],
            unique_values: HashMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn definitions(&self) -> &[IndexDefinition] {
        &self.definitions
    }

    pub(crate) fn find_same_shape(&self, def: &IndexDefinition) -> Option<&IndexDefinition> {
        self.definitions.iter().find(|d| d.same_shape(def))
    }

    pub(crate) fn get(&self, id: IndexId) -> Option<&IndexDefinition> {
        self.definitions.iter().find(|d| d.id == id)
    }

    pub(crate) fn allocate_id(&mut self) -> IndexId {
        let id = IndexId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Smallest cap of all cap constraints.
    pub(crate) fn cap(&self) -> Option<usize> {
        self.definitions
            .iter()
            .filter(|d| d.kind == IndexKind::Cap)
            .filter_map(|d| d.size)
            .min()
            .map(|s| usize::try_from(s).unwrap_or(usize::MAX))
    }

    /// Adds an index and fills it from `documents`. Nothing changes on error.
    pub(crate) fn add<'a, I>(&mut self, collection: &str, def: IndexDefinition, documents: I) -> CoreResult<()>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        if def.unique && def.kind != IndexKind::Cap {
            let mut values = HashMap::new();
            for doc in documents {
                if let Some(value) = def.value_key(doc) {
                    if values.insert(value, doc.key.clone()).is_some() {
                        return Err(CoreError::UniqueConstraintViolated {
                            collection: collection.to_string(),
                            index: def.id,
                            key: doc.key.clone(),
                        });
                    }
                }
            }
            self.unique_values.insert(def.id, values);
        }
        self.next_id = self.next_id.max(def.id.as_u64() + 1);
        self.definitions.push(def);
        Ok(())
    }

    pub(crate) fn remove_index(&mut self, id: IndexId) -> bool {
        let before = self.definitions.len();
        self.definitions
            .retain(|d| d.id != id || d.kind == IndexKind::Primary);
        self.unique_values.remove(&id);
        self.definitions.len() != before
    }

    /// Fails if storing `doc` would violate a unique index.
    pub(crate) fn check(&self, collection: &str, doc: &Document) -> CoreResult<()> {
        for def in &self.definitions {
            let Some(values) = self.unique_values.get(&def.id) else {
                continue;
            };
            if let Some(value) = def.value_key(doc) {
                if let Some(owner) = values.get(&value) {
                    if owner != &doc.key {
                        return Err(CoreError::UniqueConstraintViolated {
                            collection: collection.to_string(),
                            index: def.id,
                            key: doc.key.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn insert(&mut self, doc: &Document) {
        for def in &self.definitions {
            if let Some(values) = self.unique_values.get_mut(&def.id) {
                if let Some(value) = def.value_key(doc) {
                    values.insert(value, doc.key.clone());
                }
            }
        }
    }

    pub(crate) fn remove(&mut self, doc: &Document) {
        for def in &self.definitions {
            if let Some(values) = self.unique_values.get_mut(&def.id) {
                if let Some(value) = def.value_key(doc) {
                    if values.get(&value) == Some(&doc.key) {
                        values.remove(&value);
                    }
                }
            }
        }
    }
}
