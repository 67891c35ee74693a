//! Single-process backend for tests and small deployments.
//!
//! Each type lives in its own [moka](https://crates.io/crates/moka) cache without a capacity bound, so nothing is ever
//! evicted by size. Per-entry expiration honours [`CacheData::ttl_seconds`]. Updates to one entity are serialized by
//! moka's per-key `and_compute_with`, which is what makes relationship union merges safe under concurrent writers.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use moka::ops::compute::Op;
use moka::Expiry;
use parking_lot::RwLock;
use tracing::debug;

use crate::cache_data::replace_relationships;
use crate::cache_data::union_relationships;
use crate::cache_data::Attributes;
use crate::cache_data::CacheData;
use crate::cache_data::Relationships;
use crate::error::CacheError;
use crate::error::Result;
use crate::filter::compile_glob;
use crate::filter::relationship_names;
use crate::filter::CacheFilter;
use crate::traits::Cache;
use crate::traits::WriteableCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Union,
    Replace,
}

#[derive(Debug, Clone, Default)]
struct StoredItem {
    attributes:    Arc<Attributes>,
    relationships: Relationships,
    ttl_seconds:   Option<u64>,
}

impl StoredItem {
    fn ttl(&self) -> Option<Duration> {
        self.ttl_seconds.map(Duration::from_secs)
    }

    fn to_cache_data(&self, id: &str, filter: Option<&dyn CacheFilter>) -> CacheData {
        let names = relationship_names(filter, self.relationships.keys().cloned().collect());
        let relationships = self
            .relationships
            .iter()
            .filter(|(name, _)| names.contains(name))
            .map(|(name, ids)| (name.clone(), ids.clone()))
            .collect();
        CacheData::new(id, (*self.attributes).clone(), relationships).with_ttl_seconds(self.ttl_seconds)
    }
}

struct TtlExpiry;

impl Expiry<String, StoredItem> for TtlExpiry {
    fn expire_after_create(&self, _key: &String, value: &StoredItem, _created_at: Instant) -> Option<Duration> {
        value.ttl()
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredItem,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl()
    }
}

type Namespace = MokaCache<String, StoredItem>;

pub struct InMemoryCache {
    name:       String,
    namespaces: RwLock<HashMap<String, Namespace>>,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl InMemoryCache {
    pub fn new<S: ToString>(name: S) -> Self {
        Self {
            name:       name.to_string(),
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    pub fn types(&self) -> BTreeSet<String> {
        self.namespaces.read().keys().cloned().collect()
    }

    fn existing_namespace(&self, data_type: &str) -> Option<Namespace> {
        self.namespaces.read().get(data_type).cloned()
    }

    fn namespace(&self, data_type: &str) -> Namespace {
        if let Some(namespace) = self.existing_namespace(data_type) {
            return namespace;
        }

        self.namespaces
            .write()
            .entry(data_type.to_string())
            .or_insert_with(|| {
                debug!("[{}] creating namespace '{data_type}'", self.name);
                MokaCache::builder()
                    .name(data_type)
                    .expire_after(TtlExpiry)
                    .build()
            })
            .clone()
    }

    async fn write(&self, data_type: &str, items: Vec<CacheData>, mode: WriteMode) -> Result<()> {
        let namespace = self.namespace(data_type);

        for item in items {
            if item.id().is_empty() {
                return Err(CacheError::key_format("", format!("empty id in type '{data_type}'")));
            }

            let (id, attributes, relationships, ttl_seconds) = item.into_parts();
            namespace
                .entry(id)
                .and_compute_with(move |existing| async move {
                    let mut stored = existing.map(|entry| entry.into_value()).unwrap_or_default();
                    if !attributes.is_empty() {
                        stored.attributes = Arc::new(attributes);
                    }
                    match mode {
                        WriteMode::Union => union_relationships(&mut stored.relationships, &relationships),
                        WriteMode::Replace => replace_relationships(&mut stored.relationships, &relationships),
                    }
                    if ttl_seconds.is_some() {
                        stored.ttl_seconds = ttl_seconds;
                    }
                    Op::Put(stored)
                })
                .await;
        }

        Ok(())
    }

    fn sorted_ids(namespace: &Namespace) -> Vec<String> {
        let ids: BTreeSet<String> = namespace.iter().map(|(id, _)| id.as_ref().clone()).collect();
        ids.into_iter().collect()
    }
}

impl Debug for InMemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCache")
            .field("name", &self.name)
            .field("types", &self.types())
            .finish()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get_all(
        &self,
        data_type: &str,
        ids: Option<&[String]>,
        filter: Option<&dyn CacheFilter>,
    ) -> Result<Vec<CacheData>> {
        let Some(namespace) = self.existing_namespace(data_type)
        else {
            return Ok(Vec::new());
        };

        let ids: Vec<String> = match ids {
            Some(ids) => {
                let mut seen = BTreeSet::new();
                ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect()
            }
            None => Self::sorted_ids(&namespace),
        };

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(stored) = namespace.get(&id).await {
                items.push(stored.to_cache_data(&id, filter));
            }
        }
        Ok(items)
    }

    async fn get_identifiers(&self, data_type: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .existing_namespace(data_type)
            .map(|namespace| Self::sorted_ids(&namespace).into_iter().collect())
            .unwrap_or_default())
    }

    async fn filter_identifiers(&self, data_type: &str, glob: &str) -> Result<BTreeSet<String>> {
        let matcher = compile_glob(glob)?;
        Ok(self
            .get_identifiers(data_type)
            .await?
            .into_iter()
            .filter(|id| matcher.is_match(id))
            .collect())
    }

    async fn existing_identifiers(&self, data_type: &str, ids: &[String]) -> Result<BTreeSet<String>> {
        let Some(namespace) = self.existing_namespace(data_type)
        else {
            return Ok(BTreeSet::new());
        };
        Ok(ids.iter().filter(|id| namespace.contains_key(*id)).cloned().collect())
    }
}

#[async_trait]
impl WriteableCache for InMemoryCache {
    async fn merge_all(&self, data_type: &str, items: Vec<CacheData>) -> Result<()> {
        self.write(data_type, items, WriteMode::Union).await
    }

    async fn replace_all(&self, data_type: &str, items: Vec<CacheData>) -> Result<()> {
        self.write(data_type, items, WriteMode::Replace).await
    }

    async fn evict_all(&self, data_type: &str, ids: &[String]) -> Result<()> {
        if let Some(namespace) = self.existing_namespace(data_type) {
            for id in ids {
                namespace.invalidate(id).await;
            }
        }
        Ok(())
    }

    async fn unlink_all(&self, data_type: &str, ids: &[String], relationship: &str, targets: &[String]) -> Result<()> {
        let Some(namespace) = self.existing_namespace(data_type)
        else {
            return Ok(());
        };

        for id in ids {
            namespace
                .entry(id.clone())
                .and_compute_with(|existing| async move {
                    let Some(entry) = existing
                    else {
                        return Op::Nop;
                    };
                    let mut stored = entry.into_value();
                    let Some(related) = stored.relationships.get_mut(relationship)
                    else {
                        return Op::Nop;
                    };
                    let before = related.len();
                    for target in targets {
                        related.remove(target);
                    }
                    if related.len() == before {
                        return Op::Nop;
                    }
                    if related.is_empty() {
                        stored.relationships.remove(relationship);
                    }
                    Op::Put(stored)
                })
                .await;
        }
        Ok(())
    }

    fn backend_name(&self) -> &str {
        &self.name
    }
}
