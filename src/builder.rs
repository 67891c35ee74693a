//! Staging area for assembling a [`CacheResult`] during one agent run.
//!
//! ```
//! use cats_cache::builder::CacheResultBuilder;
//! use serde_json::json;
//!
//! let mut builder = CacheResultBuilder::new();
//! builder
//!     .namespace("applications")
//!     .keep("appKey")
//!     .set_attribute("name", json!("app"))
//!     .add_relationship("clusters", "clusterKey");
//! builder.namespace("clusters").keep("clusterKey").set_attribute("name", json!("app-main"));
//!
//! let result = builder.build();
//! assert_eq!(result.items("applications").len(), 1);
//! assert_eq!(result.items("clusters").len(), 1);
//! ```

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde_json::Value;

use crate::cache_data::Attributes;
use crate::cache_data::CacheData;
use crate::cache_data::Relationships;
use crate::result::CacheResult;

/// Namespace holding on-demand entries pending reconciliation with the next scheduled run.
pub const ON_DEMAND_NAMESPACE: &str = "onDemand";

#[derive(Debug, Default)]
pub struct CacheResultBuilder {
    namespaces: BTreeMap<String, NamespaceCache>,
    on_demand:  OnDemandNamespace,
}

impl CacheResultBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Staging area of a namespace, created on first use.
    pub fn namespace(&mut self, namespace: &str) -> &mut NamespaceCache {
        self.namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| NamespaceCache::new(namespace))
    }

    pub fn on_demand(&mut self) -> &mut OnDemandNamespace {
        &mut self.on_demand
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    pub fn build(self) -> CacheResult {
        let mut cache_results = BTreeMap::new();
        let mut evictions = BTreeMap::new();

        for (name, namespace) in self.namespaces {
            let (items, evicted) = namespace.build();
            cache_results.insert(name.clone(), items);
            if !evicted.is_empty() {
                evictions.insert(name, evicted);
            }
        }

        let (kept, evicted) = self.on_demand.build();
        if !kept.is_empty() {
            cache_results.insert(ON_DEMAND_NAMESPACE.to_string(), kept);
        }
        if !evicted.is_empty() {
            evictions.insert(ON_DEMAND_NAMESPACE.to_string(), evicted);
        }

        CacheResult::new(cache_results, evictions)
    }
}

/// Per-namespace buckets: entities kept (written) this run, previously cached entities refreshed unchanged, and
/// explicit evictions. Whatever is neither kept nor refreshed is left to the merge engine's authoritative diff.
#[derive(Debug)]
pub struct NamespaceCache {
    name:       String,
    to_keep:    BTreeMap<String, CacheDataBuilder>,
    to_refresh: BTreeMap<String, CacheData>,
    to_evict:   BTreeSet<String>,
}

impl NamespaceCache {
    fn new(name: &str) -> Self {
        Self {
            name:       name.to_string(),
            to_keep:    BTreeMap::new(),
            to_refresh: BTreeMap::new(),
            to_evict:   BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Builder of the entity to write under `id`; repeated calls return the same builder.
    pub fn keep(&mut self, id: &str) -> &mut CacheDataBuilder {
        self.to_evict.remove(id);
        self.to_keep
            .entry(id.to_string())
            .or_insert_with(|| CacheDataBuilder::new(id))
    }

    /// Retains a previously cached entity as is. Ignored if the id is also kept.
    pub fn refresh(&mut self, existing: CacheData) {
        self.to_evict.remove(existing.id());
        self.to_refresh.insert(existing.id().to_string(), existing);
    }

    /// Schedules an explicit eviction. Ignored if the id is kept or refreshed.
    pub fn evict(&mut self, id: &str) {
        if !self.to_keep.contains_key(id) && !self.to_refresh.contains_key(id) {
            self.to_evict.insert(id.to_string());
        }
    }

    pub fn is_kept(&self, id: &str) -> bool {
        self.to_keep.contains_key(id)
    }

    pub fn keep_size(&self) -> usize {
        self.to_keep.len()
    }

    pub fn refresh_size(&self) -> usize {
        self.to_refresh.len()
    }

    fn build(self) -> (Vec<CacheData>, Vec<String>) {
        let mut items: BTreeMap<String, CacheData> = self.to_refresh;
        for (id, builder) in self.to_keep {
            items.insert(id, builder.build());
        }
        (items.into_values().collect(), self.to_evict.into_iter().collect())
    }
}

/// Mutable, not yet committed [`CacheData`].
#[derive(Debug, Clone)]
pub struct CacheDataBuilder {
    id:            String,
    attributes:    Attributes,
    relationships: Relationships,
    ttl_seconds:   Option<u64>,
}

impl CacheDataBuilder {
    fn new(id: &str) -> Self {
        Self {
            id:            id.to_string(),
            attributes:    Attributes::new(),
            relationships: Relationships::new(),
            ttl_seconds:   None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_attributes(&mut self, attributes: Attributes) -> &mut Self {
        self.attributes = attributes;
        self
    }

    pub fn set_attribute<K: Into<String>, V: Into<Value>>(&mut self, name: K, value: V) -> &mut Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    pub fn set_relationships(&mut self, relationships: Relationships) -> &mut Self {
        self.relationships = relationships;
        self
    }

    pub fn add_relationship<T: Into<String>, I: Into<String>>(&mut self, data_type: T, id: I) -> &mut Self {
        self.relationships
            .entry(data_type.into())
            .or_default()
            .insert(id.into());
        self
    }

    pub fn add_relationships<T, I, S>(&mut self, data_type: T, ids: I) -> &mut Self
    where
        T: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relationships
            .entry(data_type.into())
            .or_default()
            .extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn relationships_mut(&mut self) -> &mut Relationships {
        &mut self.relationships
    }

    pub fn set_ttl_seconds(&mut self, ttl_seconds: u64) -> &mut Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn build(self) -> CacheData {
        CacheData::new(self.id, self.attributes, self.relationships).with_ttl_seconds(self.ttl_seconds)
    }
}

#[derive(Debug, Default)]
pub struct OnDemandNamespace {
    to_keep:  BTreeMap<String, CacheData>,
    to_evict: BTreeSet<String>,
}

impl OnDemandNamespace {
    pub fn keep(&mut self, data: CacheData) {
        self.to_evict.remove(data.id());
        self.to_keep.insert(data.id().to_string(), data);
    }

    pub fn evict(&mut self, id: &str) {
        self.to_keep.remove(id);
        self.to_evict.insert(id.to_string());
    }

    fn build(self) -> (Vec<CacheData>, Vec<String>) {
        (self.to_keep.into_values().collect(), self.to_evict.into_iter().collect())
    }
}
