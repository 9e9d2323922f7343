//! Documents stored in collections.

use crate::error::{CoreError, CoreResult};
use crate::tick::Tick;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum length of a document key.
pub const MAX_KEY_LENGTH: usize = 254;

/// A stored document.
///
/// `key` identifies the document within its collection. `rev` is the tick of
/// the write that produced this version on the source; replicas keep the
/// source's revision verbatim. `data` holds every user attribute, without the
/// `_key` and `_rev` system attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document key.
    #[serde(rename = "_key")]
    pub key: String,
    /// Revision of this version.
    #[serde(rename = "_rev")]
    pub rev: Tick,
    /// User attributes.
    pub data: Map<String, Value>,
}

impl Document {
    /// Creates a document from its parts.
    pub fn new(key: impl Into<String>, rev: Tick, data: Map<String, Value>) -> Self {
        Self {
            key: key.into(),
            rev,
            data,
        }
    }

    /// Looks up an attribute by a dotted path such as `"a.b"`.
    #[must_use]
    pub fn attribute(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.data.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Renders the document as a JSON object including `_key` and `_rev`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = self.data.clone();
        object.insert("_key".to_string(), Value::String(self.key.clone()));
        object.insert("_rev".to_string(), Value::String(self.rev.to_string()));
        Value::Object(object)
    }

    /// Returns the key and revision.
    #[must_use]
    pub fn meta(&self) -> DocumentMeta {
        DocumentMeta {
            key: self.key.clone(),
            rev: self.rev.clone(),
        }
    }

    /// Returns `data` with `patch` merged in at the top level.
    #[must_use]
    pub fn merged(&self, patch: Map<String, Value>) -> Map<String, Value> {
        let mut data = self.data.clone();
        for (name, value) in patch {
            data.insert(name, value);
        }
        data
    }
}

/// Key and revision of a written document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// Document key.
    pub key: String,
    /// Revision assigned by the write.
    pub rev: Tick,
}

/// Splits a JSON object into an optional user key and the remaining
/// attributes. `_rev` and `_id` are dropped, they are always assigned by the
/// database.
pub fn split_body(value: Value) -> CoreResult<(Option<String>, Map<String, Value>)> {
    let Value::Object(mut object) = value else {
        return Err(CoreError::invalid_document("document body must be an object"));
    };
    object.remove("_rev");
    object.remove("_id");
    let key = match object.remove("_key") {
        None => None,
        Some(Value::String(key)) => {
            validate_key(&key)?;
            Some(key)
        }
        Some(_) => return Err(CoreError::invalid_document("_key must be a string")),
    };
    Ok((key, object))
}

/// Checks a document key against the allowed alphabet and length.
pub fn validate_key(key: &str) -> CoreResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(CoreError::invalid_document(format!(
            "illegal document key length: {}",
            key.len()
        )));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || "_-:.@()+,=;$!*'%".contains(c);
    if !key.chars().all(allowed) {
        return Err(CoreError::invalid_document(format!(
            "illegal document key '{key}'"
        )));
    }
    Ok(())
}

/// Checks that an edge body carries string `_from` and `_to` attributes.
pub fn validate_edge(data: &Map<String, Value>) -> CoreResult<()> {
    for attribute in ["_from", "_to"] {
        match data.get(attribute) {
            Some(Value::String(handle)) if !handle.is_empty() => {}
            _ => {
                return Err(CoreError::invalid_document(format!(
                    "edge requires a string {attribute} attribute"
                )))
            }
        }
    }
    Ok(())
}
