use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Schemaless attribute payload of a cached entity. Insertion order is preserved.
pub type Attributes = serde_json::Map<String, Value>;

/// Related type name to the set of related entity ids.
pub type Relationships = BTreeMap<String, BTreeSet<String>>;

/// A single cached entity.
///
/// Values are immutable once constructed; agents re-derive them from the external API on every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheData {
    id:            String,
    #[serde(default)]
    attributes:    Attributes,
    #[serde(default)]
    relationships: Relationships,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl_seconds:   Option<u64>,
}

impl CacheData {
    pub fn new<S: Into<String>>(id: S, attributes: Attributes, relationships: Relationships) -> Self {
        Self {
            id: id.into(),
            attributes,
            relationships,
            ttl_seconds: None,
        }
    }

    /// Entity with no attributes, carrying relationships only.
    pub fn relationships_only<S: Into<String>>(id: S, relationships: Relationships) -> Self {
        Self::new(id, Attributes::new(), relationships)
    }

    pub fn with_ttl_seconds(mut self, ttl_seconds: Option<u64>) -> Self {
        self.ttl_seconds = ttl_seconds.filter(|ttl| *ttl > 0);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn relationships(&self) -> &Relationships {
        &self.relationships
    }

    pub fn ttl_seconds(&self) -> Option<u64> {
        self.ttl_seconds
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_seconds.map(Duration::from_secs)
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn related(&self, data_type: &str) -> Option<&BTreeSet<String>> {
        self.relationships.get(data_type)
    }

    /// Copy of this entity without its attributes, as written by an informative source.
    pub fn without_attributes(&self) -> Self {
        Self {
            id:            self.id.clone(),
            attributes:    Attributes::new(),
            relationships: self.relationships.clone(),
            ttl_seconds:   self.ttl_seconds,
        }
    }

    /// Keeps only the relationship types accepted by `keep`.
    pub fn retain_relationships<F: FnMut(&str) -> bool>(mut self, mut keep: F) -> Self {
        self.relationships.retain(|name, _| keep(name));
        self
    }

    pub fn into_parts(self) -> (String, Attributes, Relationships, Option<u64>) {
        (self.id, self.attributes, self.relationships, self.ttl_seconds)
    }
}

/// Unions relationship sets of `from` into `into`. Empty incoming sets are ignored.
pub fn union_relationships(into: &mut Relationships, from: &Relationships) {
    for (name, ids) in from {
        if ids.is_empty() {
            continue;
        }
        into.entry(name.clone()).or_default().extend(ids.iter().cloned());
    }
}

/// Replaces every relationship type present in `from`, leaving other types of `into` as they are.
pub fn replace_relationships(into: &mut Relationships, from: &Relationships) {
    for (name, ids) in from {
        if ids.is_empty() {
            into.remove(name);
        }
        else {
            into.insert(name.clone(), ids.clone());
        }
    }
}
