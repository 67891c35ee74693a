//! Client-side sharding over independent stores.
//!
//! Keys are routed by a SHA-256 digest of the key, or of its `{hash tag}` when one is present, modulo the shard
//! count. Multi-key reads and batches are split per shard and executed concurrently. A batch spanning shards cannot
//! be atomic.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::Digest;
use sha2::Sha256;
use tokio::task::JoinSet;
use tracing::instrument;

use super::BatchWriter;
use super::StoreClient;
use super::StoreReader;
use super::WriteBatch;
use crate::error::CacheError;
use crate::error::Result;

type ShardRead<T> = Pin<Box<dyn Future<Output = Result<Vec<T>>> + Send>>;

pub struct ShardedStore<S: StoreClient> {
    name:   String,
    shards: Vec<Arc<S>>,
}

impl<S: StoreClient> ShardedStore<S> {
    pub fn new(shards: Vec<S>) -> Result<Self> {
        if shards.is_empty() {
            return Err(CacheError::config("sharded store needs at least one shard"));
        }
        let name = format!(
            "sharded[{}]",
            shards.iter().map(|s| s.name()).collect::<Vec<_>>().join(",")
        );
        Ok(Self {
            name,
            shards: shards.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shards(&self) -> &[Arc<S>] {
        &self.shards
    }

    /// Index of the shard owning `key`.
    pub fn shard_index(&self, key: &str) -> usize {
        if self.shards.len() == 1 {
            return 0;
        }
        let digest = Sha256::digest(hash_tag(key).as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(head) % self.shards.len() as u64) as usize
    }

    fn shard_for(&self, key: &str) -> &Arc<S> {
        &self.shards[self.shard_index(key)]
    }

    /// Groups positions of `keys` by owning shard.
    fn group(&self, keys: &[String]) -> BTreeMap<usize, Vec<usize>> {
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (pos, key) in keys.iter().enumerate() {
            groups.entry(self.shard_index(key)).or_default().push(pos);
        }
        groups
    }

    /// Runs a multi-key read per shard and reassembles results in the order of `keys`.
    async fn scatter<T, F>(&self, keys: &[String], read: F) -> Result<Vec<T>>
    where
        T: Default + Clone + Send + 'static,
        F: Fn(Arc<S>, Vec<String>) -> ShardRead<T> + Send + Sync,
    {
        let mut results = vec![T::default(); keys.len()];
        let mut tasks = JoinSet::new();
        for (shard, positions) in self.group(keys) {
            let shard_keys: Vec<String> = positions.iter().map(|p| keys[*p].clone()).collect();
            let fut = read(self.shards[shard].clone(), shard_keys);
            tasks.spawn(async move { (positions, fut.await) });
        }

        while let Some(joined) = tasks.join_next().await {
            let (positions, values) = joined?;
            for (pos, value) in positions.into_iter().zip(values?) {
                results[pos] = value;
            }
        }
        Ok(results)
    }
}

/// Part of the key used for routing: the content of the first non-empty `{...}`, or the whole key.
fn hash_tag(key: &str) -> &str {
    if let Some(open) = key.find('{') {
        if let Some(len) = key[open + 1..].find('}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

impl<S: StoreClient> Debug for ShardedStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedStore")
            .field("name", &self.name)
            .field("shards", &self.shards)
            .finish()
    }
}

#[async_trait]
impl<S: StoreClient> StoreReader for ShardedStore<S> {
    async fn get_values(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.scatter(keys, |shard, keys| {
            Box::pin(async move { shard.get_values(&keys).await })
        })
        .await
    }

    async fn hash_values(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.shard_for(key).hash_values(key, fields).await
    }

    async fn set_members(&self, keys: &[String]) -> Result<Vec<BTreeSet<String>>> {
        self.scatter(keys, |shard, keys| {
            Box::pin(async move { shard.set_members(&keys).await })
        })
        .await
    }

    async fn scan_set(&self, key: &str, pattern: Option<&str>, count: usize) -> Result<BTreeSet<String>> {
        self.shard_for(key).scan_set(key, pattern, count).await
    }

    async fn set_contains(&self, key: &str, members: &[String]) -> Result<Vec<bool>> {
        self.shard_for(key).set_contains(key, members).await
    }
}

#[async_trait]
impl<S: StoreClient> BatchWriter for ShardedStore<S> {
    fn supports_atomic_batches(&self) -> bool {
        false
    }

    #[instrument(level = "trace", skip_all, fields(store = %self.name, ops = batch.len()))]
    async fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut per_shard: BTreeMap<usize, WriteBatch> = BTreeMap::new();
        for op in batch.into_ops() {
            per_shard.entry(self.shard_index(op.key())).or_default().push(op);
        }

        let mut tasks = JoinSet::new();
        for (shard, batch) in per_shard {
            let shard = self.shards[shard].clone();
            tasks.spawn(async move { shard.write(batch).await });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined.map_err(CacheError::from).and_then(|r| r) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl<S: StoreClient> StoreClient for ShardedStore<S> {
    fn name(&self) -> &str {
        &self.name
    }
}
