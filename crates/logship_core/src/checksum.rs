//! Order-independent collection checksums.
//!
//! Each document is hashed on its own with SHA-256 and the per-document
//! digests are folded together with XOR, so two collections with the same
//! documents produce the same checksum no matter in which order the
//! documents were written. JSON objects are hashed with their keys sorted,
//! which keeps the digest independent of attribute order as well.

use crate::database::Database;
use crate::document::Document;
use crate::error::CoreResult;
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use std::fmt;

/// What goes into a document's hash besides its key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChecksumOptions {
    /// Include the `_rev` attribute.
    pub with_revisions: bool,
    /// Include the document body.
    pub with_data: bool,
}

impl ChecksumOptions {
    /// Keys and bodies, without revisions.
    #[must_use]
    pub const fn with_data() -> Self {
        Self {
            with_revisions: false,
            with_data: true,
        }
    }

    /// Keys, revisions and bodies.
    #[must_use]
    pub const fn full() -> Self {
        Self {
            with_revisions: true,
            with_data: true,
        }
    }
}

/// A 256-bit digest.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn fold(&mut self, other: &[u8]) {
        for (a, b) in self.0.iter_mut().zip(other) {
            *a ^= b;
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

/// Count and digest of one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionChecksum {
    /// Number of documents.
    pub count: usize,
    /// XOR of per-document hashes.
    pub digest: Digest,
}

/// A collection whose checksum differs between two databases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumMismatch {
    /// Collection name.
    pub collection: String,
    /// Checksum on the source, `None` if the collection is missing there.
    pub source: Option<CollectionChecksum>,
    /// Checksum on the replica, `None` if the collection is missing there.
    pub replica: Option<CollectionChecksum>,
}

/// Computes and compares collection checksums.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumVerifier {
    options: ChecksumOptions,
}

impl ChecksumVerifier {
    /// Creates a verifier.
    #[must_use]
    pub const fn new(options: ChecksumOptions) -> Self {
        Self { options }
    }

    /// Checksum of one collection.
    pub fn checksum(&self, db: &Database, collection: &str) -> CoreResult<CollectionChecksum> {
        db.with_collection(collection, |c| {
            let mut digest = Digest::default();
            for doc in c.iter() {
                digest.fold(&self.document_hash(doc));
            }
            CollectionChecksum {
                count: c.count(),
                digest,
            }
        })
    }

    /// Compares the named collections and returns every mismatch.
    pub fn verify(&self, source: &Database, replica: &Database, collections: &[&str]) -> Vec<ChecksumMismatch> {
        collections
            .iter()
            .filter_map(|name| {
                let on_source = self.checksum(source, name).ok();
                let on_replica = self.checksum(replica, name).ok();
                (on_source != on_replica).then(|| ChecksumMismatch {
                    collection: (*name).to_string(),
                    source: on_source,
                    replica: on_replica,
                })
            })
            .collect()
    }

    fn document_hash(&self, doc: &Document) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(doc.key.as_bytes());
        hasher.update([0]);
        if self.options.with_revisions {
            hasher.update(doc.rev.as_str().as_bytes());
            hasher.update([0]);
        }
        if self.options.with_data {
            for (name, value) in sorted(&doc.data) {
                hash_str(&mut hasher, name);
                hash_value(&mut hasher, value);
            }
        }
        hasher.finalize().into()
    }
}

fn sorted(map: &serde_json::Map<String, Value>) -> Vec<(&String, &Value)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

fn hash_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn hash_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([0]),
        Value::Bool(b) => hasher.update([1, u8::from(*b)]),
        Value::Number(n) => {
            hasher.update([2]);
            hash_str(hasher, &n.to_string());
        }
        Value::String(s) => {
            hasher.update([3]);
            hash_str(hasher, s);
        }
        Value::Array(items) => {
            hasher.update([4]);
            hasher.update((items.len() as u64).to_le_bytes());
            for item in items {
                hash_value(hasher, item);
            }
        }
        Value::Object(map) => {
            hasher.update([5]);
            hasher.update((map.len() as u64).to_le_bytes());
            for (name, item) in sorted(map) {
                hash_str(hasher, name);
                hash_value(hasher, item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionProperties;
    use serde_json::json;

    fn db_with(docs: &[Value]) -> Database {
        let db = Database::open_in_memory();
        db.create_collection("c", CollectionProperties::default()).unwrap();
        for doc in docs {
            db.insert("c", doc.clone()).unwrap();
        }
        db
    }

    #[test]
    fn independent_of_write_order() {
        let a = db_with(&[json!({"_key": "1", "v": 1}), json!({"_key": "2", "v": 2})]);
        let b = db_with(&[json!({"_key": "2", "v": 2}), json!({"_key": "1", "v": 1})]);
        let verifier = ChecksumVerifier::new(ChecksumOptions::with_data());
        assert_eq!(verifier.checksum(&a, "c").unwrap(), verifier.checksum(&b, "c").unwrap());
        assert!(verifier.verify(&a, &b, &["c"]).is_empty());
    }

    #[test]
    fn revisions_are_optional() {
        let a = db_with(&[json!({"_key": "1"}), json!({"_key": "2"})]);
        let b = db_with(&[json!({"_key": "2"}), json!({"_key": "1"})]);
        let keys_only = ChecksumVerifier::default();
        assert_eq!(keys_only.checksum(&a, "c").unwrap(), keys_only.checksum(&b, "c").unwrap());
        let full = ChecksumVerifier::new(ChecksumOptions::full());
        assert_ne!(full.checksum(&a, "c").unwrap(), full.checksum(&b, "c").unwrap());
    }

    #[test]
    fn data_changes_digest() {
        let a = db_with(&[json!({"_key": "1", "v": {"x": 1, "y": [1, 2]}})]);
        let b = db_with(&[json!({"_key": "1", "v": {"y": [1, 2], "x": 1}})]);
        let c = db_with(&[json!({"_key": "1", "v": {"x": 1, "y": [2, 1]}})]);
        let verifier = ChecksumVerifier::new(ChecksumOptions::with_data());
        assert_eq!(verifier.checksum(&a, "c").unwrap(), verifier.checksum(&b, "c").unwrap());
        assert_ne!(verifier.checksum(&a, "c").unwrap(), verifier.checksum(&c, "c").unwrap());
    }

    #[test]
    fn missing_collection_is_a_mismatch() {
        let a = db_with(&[]);
        let b = Database::open_in_memory();
        let mismatches = ChecksumVerifier::default().verify(&a, &b, &["c"]);
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches[0].replica.is_none());
        assert_eq!(mismatches[0].source.as_ref().unwrap().count, 0);
    }

    #[test]
    fn empty_digest_renders_as_zeros() {
        assert_eq!(Digest::default().to_string(), "0".repeat(64));
    }
}
