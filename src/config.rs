//! Runtime configuration read from command line arguments or `CATS_*` environment variables.

use std::sync::Arc;
use std::time::Duration;

use fieldx::fxstruct;
use garde::Validate;
use tracing::info;

use crate::error::CacheError;
use crate::error::Result;
use crate::keys::KeyParsers;
use crate::kv::KeyValueCacheOptions;
use crate::memory::InMemoryCache;
use crate::provider_cache::DefaultProviderCache;
use crate::provider_cache::ProviderCache;
use crate::scheduler::SchedulerOptions;
use crate::traits::WriteableCache;

#[derive(Debug, Clone, clap::Parser, Validate)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, name = "cats")]
pub struct CatsConfig {
    /// Redis endpoint. Repeat for a sharded deployment; with none the in-memory backend is used.
    #[clap(long = "redis-url", env = "CATS_REDIS_URL", value_delimiter = ',')]
    #[fieldx(get(clone))]
    #[garde(inner(length(min = 1)))]
    redis_url: Vec<String>,

    /// Namespace prepended to every storage key.
    #[clap(long, env = "CATS_PREFIX", default_value = "cats")]
    #[fieldx(get(clone))]
    #[garde(length(min = 1))]
    prefix: String,

    /// Items per write pipeline.
    #[clap(long, env = "CATS_MAX_MERGE_BATCH_SIZE", default_value_t = 100)]
    #[garde(range(min = 1))]
    max_merge_batch_size: usize,

    /// Keys per read request.
    #[clap(long, env = "CATS_MAX_GET_BATCH_SIZE", default_value_t = 500)]
    #[garde(range(min = 1))]
    max_get_batch_size: usize,

    /// Items per eviction pipeline.
    #[clap(long, env = "CATS_MAX_EVICT_BATCH_SIZE", default_value_t = 500)]
    #[garde(range(min = 1))]
    max_evict_batch_size: usize,

    /// `COUNT` hint of set scans.
    #[clap(long, env = "CATS_SCAN_SIZE", default_value_t = 1000)]
    #[garde(range(min = 1))]
    scan_size: usize,

    /// Gzip attribute blobs.
    #[clap(long, env = "CATS_COMPRESSION", default_value_t = false, action = clap::ArgAction::Set)]
    #[garde(skip)]
    compression: bool,

    /// Skip rewriting attribute blobs that did not change.
    #[clap(long, env = "CATS_HASHING", default_value_t = true, action = clap::ArgAction::Set)]
    #[garde(skip)]
    hashing: bool,

    /// Apply every write pipeline as a transaction. Has no effect across shards.
    #[clap(long, env = "CATS_ATOMIC_BATCHES", default_value_t = true, action = clap::ArgAction::Set)]
    #[garde(skip)]
    atomic_batches: bool,

    /// Number of agents allowed to execute at the same time.
    #[clap(long, env = "CATS_MAX_CONCURRENT_AGENTS", default_value_t = 4)]
    #[garde(range(min = 1))]
    max_concurrent_agents: usize,

    /// Polling interval in seconds of agents that do not define their own.
    #[clap(long, env = "CATS_DEFAULT_INTERVAL", default_value_t = 60)]
    #[garde(range(min = 1))]
    default_interval: u64,

    /// Wall-clock limit in seconds of one agent data load.
    #[clap(long, env = "CATS_AGENT_TIMEOUT", default_value_t = 300)]
    #[garde(range(min = 1))]
    agent_timeout: u64,

    /// Limit in milliseconds of a single storage request before the backend counts as unavailable.
    #[clap(long, env = "CATS_STORE_TIMEOUT", default_value_t = 30_000)]
    #[garde(range(min = 1))]
    store_timeout: u64,

    /// Limit in seconds of merging one agent result.
    #[clap(long, env = "CATS_MERGE_TIMEOUT", default_value_t = 120)]
    #[garde(range(min = 1))]
    merge_timeout: u64,

    /// Seconds before a failed agent is retried.
    #[clap(long, env = "CATS_FAILURE_BACKOFF", default_value_t = 30)]
    #[garde(skip)]
    failure_backoff: u64,
}

impl CatsConfig {
    /// Parses the process arguments and environment.
    pub fn load() -> Result<Self> {
        <Self as clap::Parser>::try_parse()
            .map_err(CacheError::config)?
            .validated()
    }

    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        <Self as clap::Parser>::try_parse_from(args)
            .map_err(CacheError::config)?
            .validated()
    }

    fn validated(self) -> Result<Self> {
        self.validate().map_err(CacheError::config)?;
        Ok(self)
    }

    pub fn kv_options(&self) -> Result<KeyValueCacheOptions> {
        KeyValueCacheOptions::builder()
            .prefix(self.prefix())
            .max_merge_batch_size(self.max_merge_batch_size())
            .max_get_batch_size(self.max_get_batch_size())
            .max_evict_batch_size(self.max_evict_batch_size())
            .scan_size(self.scan_size())
            .compression(self.compression())
            .hashing(self.hashing())
            .store_timeout(Duration::from_millis(self.store_timeout()))
            .build()
            .map_err(CacheError::config)
    }

    pub fn scheduler_options(&self) -> Result<SchedulerOptions> {
        SchedulerOptions::builder()
            .max_concurrent_agents(self.max_concurrent_agents())
            .default_interval(Duration::from_secs(self.default_interval()))
            .agent_timeout(Duration::from_secs(self.agent_timeout()))
            .failure_backoff(Duration::from_secs(self.failure_backoff()))
            .merge_timeout(Duration::from_secs(self.merge_timeout()))
            .build()
            .map_err(CacheError::config)
    }

    /// Creates the configured backend, connecting to Redis if endpoints are given.
    pub async fn build_cache(&self) -> Result<Arc<dyn WriteableCache>> {
        match self.redis_url.len() {
            0 => {
                info!("Using in-memory cache backend");
                Ok(Arc::new(InMemoryCache::new(self.prefix())))
            }
            _ => self.build_redis_cache().await,
        }
    }

    pub async fn build_provider_cache(&self, parsers: KeyParsers) -> Result<Arc<dyn ProviderCache>> {
        Ok(Arc::new(DefaultProviderCache::new(self.build_cache().await?, parsers)))
    }

    #[cfg(feature = "redis")]
    async fn build_redis_cache(&self) -> Result<Arc<dyn WriteableCache>> {
        use crate::kv::KeyValueCache;
        use crate::store::redis::RedisStore;
        use crate::store::sharded::ShardedStore;

        let options = self.kv_options()?;
        if let [url] = self.redis_url.as_slice() {
            let store = RedisStore::connect(url, self.atomic_batches()).await?;
            return Ok(Arc::new(KeyValueCache::new(store, options)));
        }

        let mut shards = Vec::with_capacity(self.redis_url.len());
        for url in &self.redis_url {
            shards.push(RedisStore::connect(url, self.atomic_batches()).await?);
        }
        info!("Using sharded redis backend over {} node(s)", shards.len());
        Ok(Arc::new(KeyValueCache::new(ShardedStore::new(shards)?, options)))
    }

    #[cfg(not(feature = "redis"))]
    async fn build_redis_cache(&self) -> Result<Arc<dyn WriteableCache>> {
        Err(CacheError::config("redis endpoints configured but the `redis` feature is disabled"))
    }
}
