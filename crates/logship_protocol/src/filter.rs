//! Collection scope filtering.
//!
//! The same rule decides which collections a snapshot transfers and which
//! log entries a replica applies:
//!
//! ```text
//! in_scope = (include_system || !is_system) && scope_rule(name)
//!
//! scope_rule: none    -> true
//!             include -> name ∈ restrict_collections
//!             exclude -> name ∉ restrict_collections
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use logship_core::{CollectionInfo, CollectionRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// How `restrict_collections` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestrictType {
    /// Every collection is in scope.
    #[default]
    #[serde(alias = "")]
    None,
    /// Only the listed collections are in scope.
    Include,
    /// Every collection except the listed ones is in scope.
    Exclude,
}

impl RestrictType {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Include => "include",
            Self::Exclude => "exclude",
        }
    }
}

impl FromStr for RestrictType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        match s {
            "" | "none" => Ok(Self::None),
            "include" => Ok(Self::Include),
            "exclude" => Ok(Self::Exclude),
            other => Err(ProtocolError::InvalidValue {
                field: "restrictType",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for RestrictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which collections take part in replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilterConfig {
    /// Whether system collections are replicated.
    pub include_system: bool,
    /// How `restrict_collections` is interpreted.
    pub restrict_type: RestrictType,
    /// Collection names the restriction refers to.
    pub restrict_collections: BTreeSet<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            include_system: true,
            restrict_type: RestrictType::None,
            restrict_collections: BTreeSet::new(),
        }
    }
}

impl FilterConfig {
    /// Only the named collections.
    pub fn include<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            restrict_type: RestrictType::Include,
            restrict_collections: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Everything except the named collections.
    pub fn exclude<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            restrict_type: RestrictType::Exclude,
            restrict_collections: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Sets whether system collections are replicated.
    #[must_use]
    pub fn with_system(mut self, include: bool) -> Self {
        self.include_system = include;
        self
    }

    /// Decides whether a collection is replicated.
    #[must_use]
    pub fn in_scope(&self, name: &str, is_system: bool) -> bool {
        in_scope(name, is_system, self)
    }

    /// [`FilterConfig::in_scope`] for collection metadata.
    #[must_use]
    pub fn includes(&self, info: &CollectionInfo) -> bool {
        self.in_scope(&info.name, info.is_system())
    }

    /// [`FilterConfig::in_scope`] for the collection a log entry names.
    #[must_use]
    pub fn includes_ref(&self, collection: &CollectionRef) -> bool {
        self.in_scope(&collection.name, collection.is_system())
    }
}

/// Decides whether a collection is replicated under `cfg`.
#[must_use]
pub fn in_scope(name: &str, is_system: bool, cfg: &FilterConfig) -> bool {
    if is_system && !cfg.include_system {
        return false;
    }
    match cfg.restrict_type {
        RestrictType::None => true,
        RestrictType::Include => cfg.restrict_collections.contains(name),
        RestrictType::Exclude => !cfg.restrict_collections.contains(name),
    }
}
