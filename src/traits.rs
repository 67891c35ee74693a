use std::collections::BTreeMap;
use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::cache_data::CacheData;
use crate::error::Result;
use crate::filter::CacheFilter;

/// Read access to cached entities keyed by type and id.
///
/// Every view in the system reads through this trait; reads have no side effects.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetches the given ids of a type, or every entity of the type when `ids` is `None`. Missing ids are skipped.
    async fn get_all(
        &self,
        data_type: &str,
        ids: Option<&[String]>,
        filter: Option<&dyn CacheFilter>,
    ) -> Result<Vec<CacheData>>;

    async fn get_identifiers(&self, data_type: &str) -> Result<BTreeSet<String>>;

    /// Identifiers matching a glob. `*` matches any run of characters, `?` any single character.
    async fn filter_identifiers(&self, data_type: &str, glob: &str) -> Result<BTreeSet<String>>;

    /// Subset of `ids` present in the cache, checked without hydrating attributes.
    async fn existing_identifiers(&self, data_type: &str, ids: &[String]) -> Result<BTreeSet<String>>;

    async fn get(&self, data_type: &str, id: &str, filter: Option<&dyn CacheFilter>) -> Result<Option<CacheData>> {
        let ids = [id.to_string()];
        Ok(self.get_all(data_type, Some(&ids), filter).await?.into_iter().next())
    }

    async fn exists(&self, data_type: &str, id: &str) -> Result<bool> {
        if id.is_empty() {
            return Ok(false);
        }
        let ids = [id.to_string()];
        Ok(!self.existing_identifiers(data_type, &ids).await?.is_empty())
    }
}

/// Read-write cache.
///
/// Attribute maps are replaced wholesale when they are not empty; an empty attribute map never overwrites stored
/// attributes.
#[async_trait]
pub trait WriteableCache: Cache {
    /// Upsert with relationship union: targets are added to each supplied relationship type.
    async fn merge_all(&self, data_type: &str, items: Vec<CacheData>) -> Result<()>;

    /// Authoritative upsert: each supplied relationship type is replaced, other relationship types are kept.
    async fn replace_all(&self, data_type: &str, items: Vec<CacheData>) -> Result<()>;

    /// Hard delete of entities, their attributes and their relationship sets.
    async fn evict_all(&self, data_type: &str, ids: &[String]) -> Result<()>;

    /// Removes `targets` from the `relationship` set of each of the `ids` of `data_type`.
    async fn unlink_all(&self, data_type: &str, ids: &[String], relationship: &str, targets: &[String]) -> Result<()>;

    /// Short backend name used in logs and errors.
    fn backend_name(&self) -> &str;

    async fn merge(&self, data_type: &str, item: CacheData) -> Result<()> {
        self.merge_all(data_type, vec![item]).await
    }

    async fn evict(&self, data_type: &str, id: &str) -> Result<()> {
        self.evict_all(data_type, &[id.to_string()]).await
    }

    async fn evict_all_types(&self, evictions: &BTreeMap<String, Vec<String>>) -> Result<()> {
        for (data_type, ids) in evictions {
            self.evict_all(data_type, ids).await?;
        }
        Ok(())
    }
}
