//! Merge engine between agent results and the shared cache.
//!
//! A [`CacheResult`] is applied in three ordered phases:
//!
//! 1. authoritative diff: for each type the source is authoritative for, the ids currently cached within the source's
//!    [`MergeScope`] that are absent from the fresh result are marked for eviction;
//! 2. writes: authoritative types are written with replace semantics, informative types contribute relationships only;
//! 3. evictions: relationship references held by other types are unlinked on a best-effort basis, then the entities
//!    themselves are deleted.
//!
//! Keys are validated before anything is written, so a malformed id rejects the whole result.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::builder::ON_DEMAND_NAMESPACE;
use crate::cache_data::CacheData;
use crate::error::CacheError;
use crate::error::Result;
use crate::filter::CacheFilter;
use crate::filter::RelationshipCacheFilter;
use crate::keys::KeyParsers;
use crate::metrics::CacheMetrics;
use crate::metrics::NoopMetrics;
use crate::result::CacheResult;
use crate::scope::CacheSource;
use crate::scope::MergeScope;
use crate::traits::Cache;
use crate::traits::WriteableCache;

/// Outcome of applying one cache result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Items written per type.
    pub written:          BTreeMap<String, usize>,
    /// Ids evicted per type, both diffed and explicitly requested.
    pub evicted:          BTreeMap<String, usize>,
    /// Reverse relationship references removed from entities that held them.
    pub unlinked:         usize,
    /// Cascade unlink calls that failed and were skipped.
    pub cascade_failures: usize,
}

impl MergeStats {
    pub fn written_items(&self) -> usize {
        self.written.values().sum()
    }

    pub fn evicted_items(&self) -> usize {
        self.evicted.values().sum()
    }

    pub fn combine(&mut self, other: MergeStats) {
        for (data_type, count) in other.written {
            *self.written.entry(data_type).or_default() += count;
        }
        for (data_type, count) in other.evicted {
            *self.evicted.entry(data_type).or_default() += count;
        }
        self.unlinked += other.unlinked;
        self.cascade_failures += other.cascade_failures;
    }
}

/// Cache view handed to agents: reads plus result submission.
#[async_trait]
pub trait ProviderCache: Cache {
    /// Applies a full snapshot of `source`'s scope, evicting ids of authoritative types the snapshot no longer holds.
    async fn put_cache_result(
        &self,
        source: &CacheSource,
        authoritative_types: &BTreeSet<String>,
        result: CacheResult,
    ) -> Result<MergeStats>;

    /// Applies a partial result: writes and explicit evictions only, no authoritative diff.
    async fn add_cache_result(
        &self,
        source: &CacheSource,
        authoritative_types: &BTreeSet<String>,
        result: CacheResult,
    ) -> Result<MergeStats>;

    /// Writes a single entity with attributes, bypassing authority checks. Used for on-demand bookkeeping entries.
    async fn put_cache_data(&self, data_type: &str, data: CacheData) -> Result<()>;

    /// Evicts ids the caller found to be deleted upstream, cascading to reverse relationships.
    async fn evict_deleted_items(&self, data_type: &str, ids: &[String]) -> Result<MergeStats>;
}

pub struct DefaultProviderCache<B: WriteableCache + ?Sized> {
    backend:       Arc<B>,
    parsers:       KeyParsers,
    validate_keys: bool,
    metrics:       Arc<dyn CacheMetrics>,
}

impl<B: WriteableCache + ?Sized> DefaultProviderCache<B> {
    pub fn new(backend: Arc<B>, parsers: KeyParsers) -> Self {
        Self {
            backend,
            parsers,
            validate_keys: true,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Receives a [`rejected_result`](CacheMetrics::rejected_result) call for every result failing key validation.
    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Disables key codec validation; only empty ids are rejected then. Useful for backends holding free-form ids.
    pub fn without_key_validation(mut self) -> Self {
        self.validate_keys = false;
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn parsers(&self) -> &KeyParsers {
        &self.parsers
    }

    fn validate_id(&self, data_type: &str, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(CacheError::key_format(id, format!("empty id in type '{data_type}'")));
        }
        if self.validate_keys {
            self.parsers.parse(id)?;
        }
        Ok(())
    }

    fn validate(&self, source: &CacheSource, result: &CacheResult) -> Result<()> {
        let written = result
            .cache_results()
            .iter()
            .flat_map(|(data_type, items)| items.iter().map(move |item| (data_type, item.id())));
        let evicted = result
            .evictions()
            .iter()
            .flat_map(|(data_type, ids)| ids.iter().map(move |id| (data_type, id.as_str())));

        for (data_type, id) in written.chain(evicted) {
            if let Err(err) = self.validate_id(data_type, id) {
                warn!("{source}: rejecting cache result: {err}");
                self.metrics.rejected_result(source.agent_type(), data_type, id);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Ids of `data_type` currently cached within `scope`.
    async fn scoped_identifiers(&self, data_type: &str, scope: &MergeScope) -> Result<BTreeSet<String>> {
        match scope {
            MergeScope::Ids(ids) => {
                let ids: Vec<String> = ids.iter().cloned().collect();
                self.backend.existing_identifiers(data_type, &ids).await
            }
            _ => Ok(self
                .backend
                .get_identifiers(data_type)
                .await?
                .into_iter()
                .filter(|id| scope.contains(&self.parsers, id))
                .collect()),
        }
    }

    /// Authoritative diff: cached ids in scope that the fresh result does not carry.
    async fn stale_identifiers(
        &self,
        source: &CacheSource,
        authoritative_types: &BTreeSet<String>,
        result: &CacheResult,
    ) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let mut stale = BTreeMap::new();
        for data_type in authoritative_types {
            let fresh = result.ids(data_type);
            let gone: BTreeSet<String> = self
                .scoped_identifiers(data_type, source.scope())
                .await?
                .into_iter()
                .filter(|id| !fresh.contains(id))
                .collect();
            if !gone.is_empty() {
                debug!("{source}: {} stale id(s) of '{data_type}'", gone.len());
                stale.insert(data_type.clone(), gone);
            }
        }
        Ok(stale)
    }

    async fn write(
        &self,
        authoritative_types: &BTreeSet<String>,
        cache_results: BTreeMap<String, Vec<CacheData>>,
        stats: &mut MergeStats,
    ) -> Result<()> {
        for (data_type, items) in cache_results {
            if items.is_empty() {
                continue;
            }
            let count = items.len();
            if authoritative_types.contains(&data_type) {
                self.backend.replace_all(&data_type, items).await?;
            }
            else if data_type == ON_DEMAND_NAMESPACE {
                self.backend.merge_all(&data_type, items).await?;
            }
            else {
                // Informative: never touch attributes owned by another source.
                let items = items.iter().map(CacheData::without_attributes).collect();
                self.backend.merge_all(&data_type, items).await?;
            }
            *stats.written.entry(data_type).or_default() += count;
        }
        Ok(())
    }

    /// Removes references to evicted ids from the reverse relationship sets of related entities.
    async fn cascade(&self, data_type: &str, ids: &[String], stats: &mut MergeStats) -> Result<()> {
        let evicted = self.backend.get_all(data_type, Some(ids), None).await?;

        // related type -> evicted id -> related ids it points at
        let mut reverse: BTreeMap<&str, BTreeMap<&str, Vec<String>>> = BTreeMap::new();
        for item in &evicted {
            for (related_type, targets) in item.relationships() {
                reverse
                    .entry(related_type.as_str())
                    .or_default()
                    .insert(item.id(), targets.iter().cloned().collect());
            }
        }

        let back_filter = RelationshipCacheFilter::include(&[data_type]);
        for (related_type, by_id) in reverse {
            let targets: Vec<String> = by_id
                .values()
                .flatten()
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            // Only related entities that still exist and point back need unlinking.
            let holders = match self
                .backend
                .get_all(related_type, Some(targets.as_slice()), Some(&back_filter))
                .await
            {
                Ok(holders) => holders,
                Err(err) => {
                    stats.cascade_failures += 1;
                    warn!("reading '{related_type}' entities related to evicted '{data_type}' ids failed: {err}");
                    continue;
                }
            };
            let back_refs: BTreeMap<&str, &BTreeSet<String>> = holders
                .iter()
                .filter_map(|holder| holder.related(data_type).map(|ids| (holder.id(), ids)))
                .collect();

            for (id, targets) in by_id {
                let referring: Vec<String> = targets
                    .into_iter()
                    .filter(|target| back_refs.get(target.as_str()).is_some_and(|ids| ids.contains(id)))
                    .collect();
                if referring.is_empty() {
                    continue;
                }
                match self
                    .backend
                    .unlink_all(related_type, &referring, data_type, &[id.to_string()])
                    .await
                {
                    Ok(()) => stats.unlinked += referring.len(),
                    Err(err) => {
                        stats.cascade_failures += 1;
                        warn!("cascade unlink of '{data_type}' id '{id}' from '{related_type}' failed: {err}");
                    }
                }
            }
        }
        Ok(())
    }

    async fn evict(&self, evictions: BTreeMap<String, BTreeSet<String>>, stats: &mut MergeStats) -> Result<()> {
        for (data_type, ids) in evictions {
            if ids.is_empty() {
                continue;
            }
            let ids: Vec<String> = ids.into_iter().collect();
            if let Err(err) = self.cascade(&data_type, &ids, stats).await {
                stats.cascade_failures += 1;
                warn!("reading relationships of evicted '{data_type}' ids failed: {err}");
            }
            self.backend.evict_all(&data_type, &ids).await?;
            *stats.evicted.entry(data_type).or_default() += ids.len();
        }
        Ok(())
    }

    async fn apply(
        &self,
        source: &CacheSource,
        authoritative_types: &BTreeSet<String>,
        result: CacheResult,
        diff: bool,
    ) -> Result<MergeStats> {
        self.validate(source, &result)?;

        let mut evictions = if diff {
            self.stale_identifiers(source, authoritative_types, &result).await?
        }
        else {
            BTreeMap::new()
        };

        let (cache_results, explicit) = result.into_parts();
        for (data_type, ids) in explicit {
            let written: BTreeSet<&str> = cache_results
                .get(&data_type)
                .map(|items| items.iter().map(CacheData::id).collect())
                .unwrap_or_default();
            evictions
                .entry(data_type)
                .or_default()
                .extend(ids.into_iter().filter(|id| !written.contains(id.as_str())));
        }

        let mut stats = MergeStats::default();
        self.write(authoritative_types, cache_results, &mut stats).await?;
        self.evict(evictions, &mut stats).await?;

        debug!(
            "{source}: wrote {} item(s), evicted {} item(s), unlinked {} reference(s)",
            stats.written_items(),
            stats.evicted_items(),
            stats.unlinked
        );
        Ok(stats)
    }
}

impl<B: WriteableCache + Debug + ?Sized> Debug for DefaultProviderCache<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultProviderCache")
            .field("backend", &self.backend)
            .field("validate_keys", &self.validate_keys)
            .finish()
    }
}

#[async_trait]
impl<B: WriteableCache + ?Sized> Cache for DefaultProviderCache<B> {
    async fn get_all(
        &self,
        data_type: &str,
        ids: Option<&[String]>,
        filter: Option<&dyn CacheFilter>,
    ) -> Result<Vec<CacheData>> {
        self.backend.get_all(data_type, ids, filter).await
    }

    async fn get_identifiers(&self, data_type: &str) -> Result<BTreeSet<String>> {
        self.backend.get_identifiers(data_type).await
    }

    async fn filter_identifiers(&self, data_type: &str, glob: &str) -> Result<BTreeSet<String>> {
        self.backend.filter_identifiers(data_type, glob).await
    }

    async fn existing_identifiers(&self, data_type: &str, ids: &[String]) -> Result<BTreeSet<String>> {
        self.backend.existing_identifiers(data_type, ids).await
    }
}

#[async_trait]
impl<B: WriteableCache + ?Sized> ProviderCache for DefaultProviderCache<B> {
    #[instrument(level = "debug", skip_all, fields(source = %source, items = result.item_count()))]
    async fn put_cache_result(
        &self,
        source: &CacheSource,
        authoritative_types: &BTreeSet<String>,
        result: CacheResult,
    ) -> Result<MergeStats> {
        self.apply(source, authoritative_types, result, true).await
    }

    #[instrument(level = "debug", skip_all, fields(source = %source, items = result.item_count()))]
    async fn add_cache_result(
        &self,
        source: &CacheSource,
        authoritative_types: &BTreeSet<String>,
        result: CacheResult,
    ) -> Result<MergeStats> {
        self.apply(source, authoritative_types, result, false).await
    }

    async fn put_cache_data(&self, data_type: &str, data: CacheData) -> Result<()> {
        self.validate_id(data_type, data.id())?;
        self.backend.merge(data_type, data).await
    }

    #[instrument(level = "debug", skip(self, ids), fields(ids = ids.len()))]
    async fn evict_deleted_items(&self, data_type: &str, ids: &[String]) -> Result<MergeStats> {
        for id in ids {
            self.validate_id(data_type, id)?;
        }
        let mut stats = MergeStats::default();
        let evictions: BTreeMap<String, BTreeSet<String>> =
            BTreeMap::from([(data_type.to_string(), ids.iter().cloned().collect())]);
        self.evict(evictions, &mut stats).await?;
        Ok(stats)
    }
}
