//! Collection metadata.

use crate::error::{CoreError, CoreResult};
use crate::types::CollectionId;
use serde::{Deserialize, Serialize};

/// Longest allowed collection name.
pub const MAX_NAME_LENGTH: usize = 64;

/// Default journal size (32 MiB).
pub const DEFAULT_JOURNAL_SIZE: u64 = 32 * 1024 * 1024;

/// Kind of documents a collection holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionType {
    /// Plain documents.
    #[default]
    Document,
    /// Edges with `_from` and `_to`.
    Edge,
}

/// How keys are generated when the caller does not supply one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyGeneratorType {
    /// Increasing numeric keys shared across the database.
    #[default]
    Traditional,
    /// Per-collection `offset + n * increment` keys.
    Autoincrement,
}

/// Key generation options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyOptions {
    /// Generator type.
    #[serde(rename = "type")]
    pub generator: KeyGeneratorType,
    /// Whether callers may supply their own `_key`.
    pub allow_user_keys: bool,
    /// Step for the autoincrement generator.
    pub increment: u64,
    /// Start for the autoincrement generator.
    pub offset: u64,
}

impl Default for KeyOptions {
    fn default() -> Self {
        Self {
            generator: KeyGeneratorType::Traditional,
            allow_user_keys: true,
            increment: 1,
            offset: 0,
        }
    }
}

impl KeyOptions {
    /// Autoincrement keys with the given step and start.
    #[must_use]
    pub fn autoincrement(increment: u64, offset: u64) -> Self {
        Self {
            generator: KeyGeneratorType::Autoincrement,
            allow_user_keys: true,
            increment: increment.max(1),
            offset,
        }
    }

    /// Sets whether callers may supply keys.
    #[must_use]
    pub fn with_user_keys(mut self, allow: bool) -> Self {
        self.allow_user_keys = allow;
        self
    }
}

/// Collection properties.
///
/// Only `wait_for_sync`, `do_compact` and `journal_size` may change after
/// creation; see [`PropertiesUpdate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionProperties {
    /// Document or edge collection.
    #[serde(rename = "type")]
    pub collection_type: CollectionType,
    /// System collections are named with a leading underscore.
    pub is_system: bool,
    /// Volatile collections are not persisted by the storage engine.
    pub is_volatile: bool,
    /// Whether writes wait for a disk sync.
    pub wait_for_sync: bool,
    /// Whether the storage engine compacts the collection.
    pub do_compact: bool,
    /// Journal size in bytes.
    pub journal_size: u64,
    /// Key generation options.
    pub key_options: KeyOptions,
}

impl Default for CollectionProperties {
    fn default() -> Self {
        Self {
            collection_type: CollectionType::Document,
            is_system: false,
            is_volatile: false,
            wait_for_sync: false,
            do_compact: true,
            journal_size: DEFAULT_JOURNAL_SIZE,
            key_options: KeyOptions::default(),
        }
    }
}

impl CollectionProperties {
    /// Properties of an edge collection.
    #[must_use]
    pub fn edge() -> Self {
        Self {
            collection_type: CollectionType::Edge,
            ..Self::default()
        }
    }

    /// Sets the volatile flag.
    #[must_use]
    pub const fn with_volatile(mut self, volatile: bool) -> Self {
        self.is_volatile = volatile;
        self
    }

    /// Sets the wait-for-sync flag.
    #[must_use]
    pub const fn with_wait_for_sync(mut self, wait: bool) -> Self {
        self.wait_for_sync = wait;
        self
    }

    /// Sets the compaction flag.
    #[must_use]
    pub const fn with_do_compact(mut self, compact: bool) -> Self {
        self.do_compact = compact;
        self
    }

    /// Sets the journal size.
    #[must_use]
    pub const fn with_journal_size(mut self, size: u64) -> Self {
        self.journal_size = size;
        self
    }

    /// Sets the key options.
    #[must_use]
    pub fn with_key_options(mut self, options: KeyOptions) -> Self {
        self.key_options = options;
        self
    }
}

/// A change to the mutable collection properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertiesUpdate {
    /// New wait-for-sync flag.
    pub wait_for_sync: Option<bool>,
    /// New compaction flag.
    pub do_compact: Option<bool>,
    /// New journal size.
    pub journal_size: Option<u64>,
}

impl PropertiesUpdate {
    /// Applies the update, returning the changed properties.
    #[must_use]
    pub fn apply_to(&self, properties: &CollectionProperties) -> CollectionProperties {
        let mut updated = properties.clone();
        if let Some(wait) = self.wait_for_sync {
            updated.wait_for_sync = wait;
        }
        if let Some(compact) = self.do_compact {
            updated.do_compact = compact;
        }
        if let Some(size) = self.journal_size {
            updated.journal_size = size;
        }
        updated
    }
}

/// Identity and properties of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    /// Stable id.
    pub id: CollectionId,
    /// Current name.
    pub name: String,
    /// Properties.
    pub properties: CollectionProperties,
}

impl CollectionInfo {
    /// Returns true for system collections.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.properties.is_system
    }
}

/// System collections are exactly those named with a leading underscore.
#[must_use]
pub fn is_system_name(name: &str) -> bool {
    name.starts_with('_')
}

/// Checks a collection name: a letter or underscore followed by letters,
/// digits, `_` or `-`.
pub fn validate_collection_name(name: &str) -> CoreResult<()> {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid_start || !valid_rest || name.len() > MAX_NAME_LENGTH || name == "_" {
        return Err(CoreError::IllegalName {
            name: name.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert!(validate_collection_name("UnitTestsReplication").is_ok());
        assert!(validate_collection_name("_system_like").is_ok());
        assert!(validate_collection_name("a-b_c9").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("9lives").is_err());
        assert!(validate_collection_name("has space").is_err());
        assert!(validate_collection_name("_").is_err());
        assert!(validate_collection_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn system_prefix() {
        assert!(is_system_name("_users"));
        assert!(!is_system_name("users"));
    }

    #[test]
    fn update_touches_only_mutable_fields() {
        let props = CollectionProperties::default().with_volatile(true);
        let update = PropertiesUpdate {
            wait_for_sync: Some(true),
            journal_size: Some(1024 * 1024),
            ..PropertiesUpdate::default()
        };
        let changed = update.apply_to(&props);
        assert!(changed.wait_for_sync);
        assert!(changed.do_compact);
        assert!(changed.is_volatile);
        assert_eq!(changed.journal_size, 1024 * 1024);
    }

    #[test]
    fn serde_uses_wire_names() {
        let props = CollectionProperties::edge()
            .with_key_options(KeyOptions::autoincrement(5, 100).with_user_keys(false));
        let json = serde_json::to_value(&props).unwrap();
        assert_eq!(json["type"], "edge");
        assert_eq!(json["keyOptions"]["type"], "autoincrement");
        assert_eq!(json["keyOptions"]["allowUserKeys"], false);
        assert_eq!(json["waitForSync"], false);
    }
}
