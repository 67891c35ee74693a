//! Redis-family data model over a [`StoreClient`].
//!
//! For a type `T` and a prefix `P` the following keys are maintained:
//!
//! | Key | Kind | Content |
//! | --- | --- | --- |
//! | `P:T:members` | set | every id of the type |
//! | `P:T:attributes:<id>` | string | JSON attribute blob, optionally gzip-compressed |
//! | `P:T:relationships:<id>:<rel>` | set | ids of related entities of type `rel` |
//! | `P:T:relationships` | set | every relationship type ever written for `T` |
//! | `P:T:hashes` | hash | id to SHA-256 digest of the last attribute blob written |
//!
//! The relationship-name index is what lets reads and evictions find the per-entity relationship sets without key
//! scans. Digests allow skipping writes of attribute blobs that did not change since the previous agent cycle.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt::Debug;
use std::io::Read;
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fieldx::fxstruct;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::instrument;

use crate::cache_data::Attributes;
use crate::cache_data::CacheData;
use crate::cache_data::Relationships;
use crate::error::CacheError;
use crate::error::Result;
use crate::filter::compile_glob;
use crate::filter::relationship_names;
use crate::filter::CacheFilter;
use crate::metrics::CacheMetrics;
use crate::metrics::EvictCounts;
use crate::metrics::GetCounts;
use crate::metrics::MergeCounts;
use crate::metrics::NoopMetrics;
use crate::store::StoreClient;
use crate::store::WriteBatch;
use crate::store::WriteOp;
use crate::traits::Cache;
use crate::traits::WriteableCache;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone)]
#[fxstruct(no_new, builder, get(copy))]
pub struct KeyValueCacheOptions {
    /// Namespace prepended to every key.
    #[fieldx(get(clone), builder(into), default(String::from("cats")))]
    prefix: String,

    /// Items per write pipeline.
    #[fieldx(default(100))]
    max_merge_batch_size: usize,

    /// Keys per read request.
    #[fieldx(default(500))]
    max_get_batch_size: usize,

    /// Items per eviction pipeline.
    #[fieldx(default(500))]
    max_evict_batch_size: usize,

    /// `COUNT` hint of set scans.
    #[fieldx(default(1000))]
    scan_size: usize,

    #[fieldx(default(false))]
    compression: bool,

    /// Skip rewriting attribute blobs whose digest did not change. Items carrying a TTL are always rewritten.
    #[fieldx(default(true))]
    hashing: bool,

    /// Bound of every single store request.
    #[fieldx(default(Duration::from_secs(30)))]
    store_timeout: Duration,
}

/// Attribute blob encoding.
#[derive(Debug, Clone, Copy)]
pub struct ValueCodec {
    compression: bool,
}

impl ValueCodec {
    pub fn new(compression: bool) -> Self {
        Self { compression }
    }

    pub fn encode(&self, json: &[u8]) -> Result<Vec<u8>> {
        if !self.compression {
            return Ok(json.to_vec());
        }
        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
        encoder.write_all(json)?;
        Ok(encoder.finish()?)
    }

    /// Decodes both compressed and plain blobs, so toggling compression keeps existing data readable.
    pub fn decode(&self, blob: &[u8]) -> Result<Attributes> {
        if blob.starts_with(&GZIP_MAGIC) {
            let mut json = Vec::with_capacity(blob.len() * 4);
            GzDecoder::new(blob).read_to_end(&mut json)?;
            Ok(serde_json::from_slice(&json)?)
        }
        else {
            Ok(serde_json::from_slice(blob)?)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Union,
    Replace,
}

pub struct KeyValueCache<S: StoreClient> {
    store:   Arc<S>,
    options: KeyValueCacheOptions,
    codec:   ValueCodec,
    metrics: Arc<dyn CacheMetrics>,
}

impl<S: StoreClient> KeyValueCache<S> {
    pub fn new(store: S, options: KeyValueCacheOptions) -> Self {
        Self::with_shared_store(Arc::new(store), options)
    }

    pub fn with_shared_store(store: Arc<S>, options: KeyValueCacheOptions) -> Self {
        Self {
            codec: ValueCodec::new(options.compression()),
            store,
            options,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn options(&self) -> &KeyValueCacheOptions {
        &self.options
    }

    fn type_key(&self, data_type: &str, suffix: &str) -> String {
        format!("{}:{data_type}:{suffix}", self.options.prefix)
    }

    pub fn members_key(&self, data_type: &str) -> String {
        self.type_key(data_type, "members")
    }

    pub fn attributes_key(&self, data_type: &str, id: &str) -> String {
        format!("{}:{data_type}:attributes:{id}", self.options.prefix)
    }

    pub fn relationship_key(&self, data_type: &str, id: &str, relationship: &str) -> String {
        format!("{}:{data_type}:relationships:{id}:{relationship}", self.options.prefix)
    }

    pub fn relationship_names_key(&self, data_type: &str) -> String {
        self.type_key(data_type, "relationships")
    }

    pub fn hashes_key(&self, data_type: &str) -> String {
        self.type_key(data_type, "hashes")
    }

    /// Runs a store request under `store_timeout`, reporting a stalled store as unavailable.
    async fn bounded<T, F>(&self, request: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        let timeout = self.options.store_timeout;
        tokio::time::timeout(timeout, request).await.map_err(|_| {
            CacheError::unavailable(self.store.name(), format!("no response within {timeout:?}"))
        })?
    }

    async fn relationship_names_of(&self, data_type: &str) -> Result<BTreeSet<String>> {
        self.bounded(
            self.store
                .scan_set(&self.relationship_names_key(data_type), None, self.options.scan_size),
        )
        .await
    }

    #[instrument(level = "debug", skip(self, items), fields(backend = %self.store.name(), items = items.len()))]
    async fn write(&self, data_type: &str, items: Vec<CacheData>, mode: WriteMode) -> Result<()> {
        if let Some(item) = items.iter().find(|item| item.id().is_empty()) {
            return Err(CacheError::key_format(item.id(), format!("empty id in type '{data_type}'")));
        }

        let batch_size = self.options.max_merge_batch_size.max(1);
        let members_key = self.members_key(data_type);
        let names_key = self.relationship_names_key(data_type);
        let hashes_key = self.hashes_key(data_type);
        let mut counts = MergeCounts {
            items: items.len(),
            ..Default::default()
        };

        let mut items = items.into_iter().peekable();
        while items.peek().is_some() {
            let chunk: Vec<CacheData> = items.by_ref().take(batch_size).collect();

            // Serialize first so digests of the whole chunk can be fetched in one request.
            let mut blobs = Vec::with_capacity(chunk.len());
            for item in &chunk {
                blobs.push(if item.attributes().is_empty() {
                    None
                }
                else {
                    let json = serde_json::to_vec(item.attributes())?;
                    let digest = Sha256::digest(&json).to_vec();
                    Some((json, digest))
                });
            }

            // An expiring blob may vanish while its digest stays, so only items without a TTL are compared.
            let stored_digests: HashMap<String, Option<Vec<u8>>> = if self.options.hashing {
                let ids: Vec<String> = chunk
                    .iter()
                    .zip(&blobs)
                    .filter(|(item, blob)| blob.is_some() && item.ttl_seconds().is_none())
                    .map(|(item, _)| item.id().to_string())
                    .collect();
                let digests = if ids.is_empty() {
                    Vec::new()
                }
                else {
                    self.bounded(self.store.hash_values(&hashes_key, &ids)).await?
                };
                ids.into_iter().zip(digests).collect()
            }
            else {
                HashMap::new()
            };

            let mut batch = WriteBatch::new();
            let mut names = BTreeSet::new();
            batch.push(WriteOp::SAdd {
                key:     members_key.clone(),
                members: chunk.iter().map(|item| item.id().to_string()).collect(),
            });

            for (item, blob) in chunk.into_iter().zip(blobs) {
                let (id, _, relationships, ttl_seconds) = item.into_parts();

                if let Some((json, digest)) = blob {
                    let key = self.attributes_key(data_type, &id);
                    let unchanged = stored_digests
                        .get(&id)
                        .and_then(|stored| stored.as_ref())
                        .is_some_and(|stored| *stored == digest);
                    if unchanged {
                        counts.skipped_writes += 1;
                    }
                    else {
                        batch.push(WriteOp::Set {
                            key:   key.clone(),
                            value: self.codec.encode(&json)?,
                        });
                        if self.options.hashing && ttl_seconds.is_none() {
                            batch.push(WriteOp::HSet {
                                key:   hashes_key.clone(),
                                field: id.clone(),
                                value: digest,
                            });
                        }
                        else if self.options.hashing {
                            batch.push(WriteOp::HDel {
                                key:    hashes_key.clone(),
                                fields: vec![id.clone()],
                            });
                        }
                    }
                    if let Some(seconds) = ttl_seconds {
                        batch.push(WriteOp::Expire { key, seconds });
                    }
                }

                self.relationship_ops(data_type, &id, relationships, ttl_seconds, mode, &mut batch, &mut names);
            }

            counts.relationship_names += names.len();
            batch.push(WriteOp::SAdd {
                key:     names_key.clone(),
                members: names.into_iter().collect(),
            });

            counts.operations += batch.len();
            counts.keys_written += batch
                .ops()
                .iter()
                .filter(|op| !matches!(op, WriteOp::Expire { .. }))
                .count();
            counts.batches += 1;
            self.bounded(self.store.write(batch)).await?;
        }

        debug!(
            "[{}] merged {} item(s) of '{data_type}' in {} batch(es), {} unchanged",
            self.store.name(),
            counts.items,
            counts.batches,
            counts.skipped_writes
        );
        self.metrics.merge(&self.options.prefix, data_type, &counts);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn relationship_ops(
        &self,
        data_type: &str,
        id: &str,
        relationships: Relationships,
        ttl_seconds: Option<u64>,
        mode: WriteMode,
        batch: &mut WriteBatch,
        names: &mut BTreeSet<String>,
    ) {
        for (name, targets) in relationships {
            let key = self.relationship_key(data_type, id, &name);
            if mode == WriteMode::Replace {
                batch.push(WriteOp::Del { key: key.clone() });
            }
            if targets.is_empty() {
                continue;
            }
            batch.push(WriteOp::SAdd {
                key:     key.clone(),
                members: targets.into_iter().collect(),
            });
            if let Some(seconds) = ttl_seconds {
                batch.push(WriteOp::Expire { key, seconds });
            }
            names.insert(name);
        }
    }

    /// Hydrates ids known to be members of the type.
    async fn hydrate(
        &self,
        data_type: &str,
        ids: Vec<String>,
        filter: Option<&dyn CacheFilter>,
        counts: &mut GetCounts,
    ) -> Result<Vec<CacheData>> {
        let names = relationship_names(filter, self.relationship_names_of(data_type).await?.into_iter().collect());
        counts.relationship_names = names.len();

        let batch_size = self.options.max_get_batch_size.max(1);
        let mut items = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(batch_size) {
            let attribute_keys: Vec<String> = chunk.iter().map(|id| self.attributes_key(data_type, id)).collect();
            let blobs = self.bounded(self.store.get_values(&attribute_keys)).await?;
            counts.keys_requested += attribute_keys.len();
            counts.batches += 1;

            let mut relationship_sets = Vec::with_capacity(chunk.len() * names.len());
            if !names.is_empty() {
                let relationship_keys: Vec<String> = chunk
                    .iter()
                    .flat_map(|id| names.iter().map(move |name| self.relationship_key(data_type, id, name)))
                    .collect();
                for keys in relationship_keys.chunks(batch_size) {
                    relationship_sets.extend(self.bounded(self.store.set_members(keys)).await?);
                    counts.keys_requested += keys.len();
                    counts.batches += 1;
                }
            }

            let mut sets = relationship_sets.into_iter();
            for (id, blob) in chunk.iter().zip(blobs) {
                let attributes = match blob {
                    Some(blob) => self.codec.decode(&blob)?,
                    None => Attributes::new(),
                };
                let mut relationships = Relationships::new();
                for (name, targets) in names.iter().zip(sets.by_ref().take(names.len())) {
                    if !targets.is_empty() {
                        relationships.insert(name.clone(), targets);
                    }
                }
                items.push(CacheData::new(id.clone(), attributes, relationships));
            }
        }
        Ok(items)
    }
}

impl<S: StoreClient> Debug for KeyValueCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueCache")
            .field("store", &self.store)
            .field("options", &self.options)
            .finish()
    }
}

#[async_trait]
impl<S: StoreClient> Cache for KeyValueCache<S> {
    async fn get_all(
        &self,
        data_type: &str,
        ids: Option<&[String]>,
        filter: Option<&dyn CacheFilter>,
    ) -> Result<Vec<CacheData>> {
        let mut counts = GetCounts::default();
        let ids: Vec<String> = match ids {
            Some(ids) => {
                let mut seen = BTreeSet::new();
                let requested: Vec<String> = ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect();
                counts.requested = requested.len();
                let present = self.existing_identifiers(data_type, &requested).await?;
                requested.into_iter().filter(|id| present.contains(id)).collect()
            }
            None => {
                let all = self.get_identifiers(data_type).await?;
                counts.requested = all.len();
                all.into_iter().collect()
            }
        };

        let items = if ids.is_empty() {
            Vec::new()
        }
        else {
            self.hydrate(data_type, ids, filter, &mut counts).await?
        };

        counts.items = items.len();
        self.metrics.get(&self.options.prefix, data_type, &counts);
        Ok(items)
    }

    async fn get_identifiers(&self, data_type: &str) -> Result<BTreeSet<String>> {
        self.bounded(
            self.store
                .scan_set(&self.members_key(data_type), None, self.options.scan_size),
        )
        .await
    }

    async fn filter_identifiers(&self, data_type: &str, glob: &str) -> Result<BTreeSet<String>> {
        let matcher = compile_glob(glob)?;
        // Server-side MATCH lacks brace alternation, so such globs are matched locally only.
        let hint = (!glob.contains('{')).then_some(glob);
        Ok(self
            .bounded(
                self.store
                    .scan_set(&self.members_key(data_type), hint, self.options.scan_size),
            )
            .await?
            .into_iter()
            .filter(|id| matcher.is_match(id))
            .collect())
    }

    async fn existing_identifiers(&self, data_type: &str, ids: &[String]) -> Result<BTreeSet<String>> {
        let members_key = self.members_key(data_type);
        let mut existing = BTreeSet::new();
        for chunk in ids.chunks(self.options.max_get_batch_size.max(1)) {
            let flags = self.bounded(self.store.set_contains(&members_key, chunk)).await?;
            existing.extend(chunk.iter().zip(flags).filter(|(_, present)| *present).map(|(id, _)| id.clone()));
        }
        Ok(existing)
    }
}

#[async_trait]
impl<S: StoreClient> WriteableCache for KeyValueCache<S> {
    async fn merge_all(&self, data_type: &str, items: Vec<CacheData>) -> Result<()> {
        self.write(data_type, items, WriteMode::Union).await
    }

    async fn replace_all(&self, data_type: &str, items: Vec<CacheData>) -> Result<()> {
        self.write(data_type, items, WriteMode::Replace).await
    }

    #[instrument(level = "debug", skip(self, ids), fields(backend = %self.store.name(), ids = ids.len()))]
    async fn evict_all(&self, data_type: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let names = self.relationship_names_of(data_type).await?;
        let members_key = self.members_key(data_type);
        let hashes_key = self.hashes_key(data_type);
        let mut counts = EvictCounts {
            items: ids.len(),
            ..Default::default()
        };

        for chunk in ids.chunks(self.options.max_evict_batch_size.max(1)) {
            let mut batch = WriteBatch::new();
            batch
                .push(WriteOp::SRem {
                    key:     members_key.clone(),
                    members: chunk.to_vec(),
                })
                .push(WriteOp::HDel {
                    key:    hashes_key.clone(),
                    fields: chunk.to_vec(),
                });
            for id in chunk {
                batch.push(WriteOp::Del {
                    key: self.attributes_key(data_type, id),
                });
                for name in &names {
                    batch.push(WriteOp::Del {
                        key: self.relationship_key(data_type, id, name),
                    });
                }
            }

            counts.operations += batch.len();
            counts.keys_deleted += chunk.len() * (1 + names.len());
            counts.batches += 1;
            self.bounded(self.store.write(batch)).await?;
        }

        self.metrics.evict(&self.options.prefix, data_type, &counts);
        Ok(())
    }

    async fn unlink_all(&self, data_type: &str, ids: &[String], relationship: &str, targets: &[String]) -> Result<()> {
        if ids.is_empty() || targets.is_empty() {
            return Ok(());
        }
        for chunk in ids.chunks(self.options.max_merge_batch_size.max(1)) {
            let batch: WriteBatch = chunk
                .iter()
                .map(|id| WriteOp::SRem {
                    key:     self.relationship_key(data_type, id, relationship),
                    members: targets.to_vec(),
                })
                .collect();
            self.bounded(self.store.write(batch)).await?;
        }
        Ok(())
    }

    fn backend_name(&self) -> &str {
        self.store.name()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::filter::RelationshipCacheFilter;
    use crate::metrics::CountingMetrics;
    use crate::store::BatchWriter;
    use crate::test::MemoryStore;

    fn options() -> KeyValueCacheOptions {
        KeyValueCacheOptions::builder()
            .prefix("test")
            .max_merge_batch_size(2)
            .max_get_batch_size(2)
            .build()
            .unwrap()
    }

    fn item(id: &str, attrs: serde_json::Value, rels: &[(&str, &[&str])]) -> CacheData {
        let relationships = rels
            .iter()
            .map(|(name, ids)| (name.to_string(), ids.iter().map(|s| s.to_string()).collect()))
            .collect();
        CacheData::new(id, attrs.as_object().cloned().unwrap_or_default(), relationships)
    }

    #[test]
    fn codec_reads_both_encodings() {
        let plain = ValueCodec::new(false);
        let gzip = ValueCodec::new(true);
        let json = serde_json::to_vec(&json!({"name": "web", "size": 3})).unwrap();

        let compressed = gzip.encode(&json).unwrap();
        assert!(compressed.starts_with(&GZIP_MAGIC));
        assert_eq!(plain.decode(&compressed).unwrap(), gzip.decode(&json).unwrap());
    }

    #[tokio::test]
    async fn layout_follows_key_scheme() {
        let cache = KeyValueCache::new(MemoryStore::new("kv"), options());
        cache
            .merge("instances", item("i-1", json!({"n": 1}), &[("serverGroups", &["sg-1"])]))
            .await
            .unwrap();

        let store = cache.store();
        assert_eq!(store.members("test:instances:members"), BTreeSet::from(["i-1".to_string()]));
        assert_eq!(
            store.members("test:instances:relationships"),
            BTreeSet::from(["serverGroups".to_string()])
        );
        assert_eq!(
            store.members("test:instances:relationships:i-1:serverGroups"),
            BTreeSet::from(["sg-1".to_string()])
        );
        assert!(store.value("test:instances:attributes:i-1").is_some());
    }

    #[tokio::test]
    async fn unchanged_attributes_are_not_rewritten() {
        let metrics = Arc::new(CountingMetrics::default());
        let cache = KeyValueCache::new(MemoryStore::new("kv"), options()).with_metrics(metrics.clone());

        let data = vec![item("a", json!({"n": 1}), &[]), item("b", json!({"n": 2}), &[]), item("c", json!({"n": 3}), &[])];
        cache.merge_all("images", data.clone()).await.unwrap();
        assert_eq!(metrics.skipped_writes(), 0);

        cache.merge_all("images", data).await.unwrap();
        assert_eq!(metrics.skipped_writes(), 3);
        assert_eq!(metrics.merged_items(), 6);

        cache.merge("images", item("a", json!({"n": 10}), &[])).await.unwrap();
        assert_eq!(metrics.skipped_writes(), 3);
        let a = cache.get("images", "a", None).await.unwrap().unwrap();
        assert_eq!(a.attribute("n"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn union_and_replace_modes() {
        let cache = KeyValueCache::new(MemoryStore::new("kv"), options());
        cache
            .merge("clusters", item("c", json!({"n": 1}), &[("instances", &["1"]), ("apps", &["a"])]))
            .await
            .unwrap();
        cache
            .merge("clusters", item("c", json!({}), &[("instances", &["2"])]))
            .await
            .unwrap();

        let c = cache.get("clusters", "c", None).await.unwrap().unwrap();
        assert_eq!(c.attribute("n"), Some(&json!(1)));
        assert_eq!(c.related("instances").unwrap().len(), 2);

        cache
            .replace_all("clusters", vec![item("c", json!({"n": 2}), &[("instances", &["3"])])])
            .await
            .unwrap();
        let c = cache.get("clusters", "c", None).await.unwrap().unwrap();
        assert_eq!(c.related("instances").unwrap().iter().collect::<Vec<_>>(), vec!["3"]);
        assert_eq!(c.related("apps").unwrap().iter().collect::<Vec<_>>(), vec!["a"]);
    }

    #[tokio::test]
    async fn reads_batch_and_filter() {
        let cache = KeyValueCache::new(MemoryStore::new("kv"), options());
        let items: Vec<CacheData> = (0..5)
            .map(|n| {
                item(
                    &format!("aws:instances:acct:us-east-1:i-{n}"),
                    json!({"n": n}),
                    &[("serverGroups", &["sg"]), ("loadBalancers", &["lb"])],
                )
            })
            .collect();
        cache.merge_all("instances", items).await.unwrap();

        let all = cache.get_all("instances", None, None).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.iter().all(|i| i.relationships().len() == 2));

        let filter = RelationshipCacheFilter::include(&["server"]);
        let ids = vec!["aws:instances:acct:us-east-1:i-3".to_string(), "missing".to_string()];
        let some = cache.get_all("instances", Some(&ids), Some(&filter)).await.unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].relationships().keys().collect::<Vec<_>>(), vec!["serverGroups"]);

        let matched = cache.filter_identifiers("instances", "*:i-{1,2}").await.unwrap();
        assert_eq!(matched.len(), 2);
    }

    #[tokio::test]
    async fn eviction_removes_every_key() {
        let cache = KeyValueCache::new(MemoryStore::new("kv"), options());
        cache
            .merge("images", item("a", json!({"n": 1}), &[("instances", &["i"])]))
            .await
            .unwrap();
        cache.evict("images", "a").await.unwrap();

        let store = cache.store();
        assert!(!cache.exists("images", "a").await.unwrap());
        assert!(store.value("test:images:attributes:a").is_none());
        assert!(store.members("test:images:relationships:a:instances").is_empty());
        assert!(store.hash_field("test:images:hashes", "a").is_none());
    }

    #[tokio::test]
    async fn compressed_store_round_trips() {
        let options = KeyValueCacheOptions::builder()
            .compression(true)
            .hashing(false)
            .build()
            .unwrap();
        let cache = KeyValueCache::new(MemoryStore::new("kv"), options);
        cache.merge("images", item("a", json!({"name": "ami"}), &[])).await.unwrap();

        let blob = cache.store().value("cats:images:attributes:a").unwrap();
        assert!(blob.starts_with(&GZIP_MAGIC));
        let a = cache.get("images", "a", None).await.unwrap().unwrap();
        assert_eq!(a.attribute("name"), Some(&json!("ami")));
    }

    #[tokio::test]
    async fn ttl_issues_expire() {
        let cache = KeyValueCache::new(MemoryStore::new("kv"), options());
        cache
            .merge("images", item("a", json!({"n": 1}), &[("x", &["1"])]).with_ttl_seconds(Some(60)))
            .await
            .unwrap();
        assert_eq!(cache.store().ttl("test:images:attributes:a"), Some(60));
        assert_eq!(cache.store().ttl("test:images:relationships:a:x"), Some(60));
        assert_eq!(cache.store().ttl("test:images:members"), None);
    }

    #[tokio::test]
    async fn expired_blob_is_rewritten_by_identical_merge() {
        let cache = KeyValueCache::new(MemoryStore::new("kv"), options());
        let data = item("a", json!({"name": "ami"}), &[]).with_ttl_seconds(Some(60));
        cache.merge("images", data.clone()).await.unwrap();
        assert!(cache.store().hash_field("test:images:hashes", "a").is_none());

        let expired: WriteBatch = [WriteOp::Del {
            key: "test:images:attributes:a".to_string(),
        }]
        .into_iter()
        .collect();
        cache.store().write(expired).await.unwrap();

        cache.merge("images", data).await.unwrap();
        let a = cache.get("images", "a", None).await.unwrap().unwrap();
        assert_eq!(a.attribute("name"), Some(&json!("ami")));
        assert_eq!(cache.store().ttl("test:images:attributes:a"), Some(60));
    }

    #[tokio::test]
    async fn digest_of_earlier_write_is_dropped_when_ttl_is_set() {
        let cache = KeyValueCache::new(MemoryStore::new("kv"), options());
        cache.merge("images", item("a", json!({"n": 1}), &[])).await.unwrap();
        assert!(cache.store().hash_field("test:images:hashes", "a").is_some());

        cache
            .merge("images", item("a", json!({"n": 1}), &[]).with_ttl_seconds(Some(60)))
            .await
            .unwrap();
        assert!(cache.store().hash_field("test:images:hashes", "a").is_none());
    }

    #[tokio::test]
    async fn stalled_store_is_reported_unavailable() {
        let options = KeyValueCacheOptions::builder()
            .prefix("test")
            .store_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let cache = KeyValueCache::new(MemoryStore::new("kv"), options);
        cache.store().set_stall_writes(true);

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            cache.merge("images", item("a", json!({"n": 1}), &[])),
        )
        .await
        .expect("merge returns once the store timeout elapses")
        .unwrap_err();
        assert!(matches!(err, CacheError::Unavailable { ref backend, .. } if backend == "kv"), "{err}");
        assert!(err.is_retryable());
    }
}
