//! # cats-cache
//!
//! Caching substrate for cloud inventory: agents poll provider APIs and the cache keeps a consistent, queryable view
//! of the resources they report, their attributes and the relationships between them.
//!
//! # The Basics
//!
//! Everything stored is a [`CacheData`](cache_data::CacheData): an identifier, a map of JSON attributes and a set of
//! relationships, each relationship being a named set of identifiers of other items. Items are grouped by type, e.g.
//! `instances`, `securityGroups` or `applications`.
//!
//! Identifiers are colon-separated keys, `provider:type:account:region:name`, encoded and decoded by the
//! [`keys`] module. Provider-specific layouts plug in through [`KeyParser`](keys::KeyParser).
//!
//! The cache is fed by agents, see the [`agent`] module:
//!
//! - a caching agent runs on an interval and returns a full snapshot of the resources it can see in its account and
//!   region;
//! - an on-demand agent refreshes a single resource right after a user-facing operation changed it;
//! - a health providing agent contributes health data linked to resources owned by someone else.
//!
//! # Authority
//!
//! For every type it reports, an agent is either *authoritative* or *informative*. An authoritative agent is the
//! source of truth within its scope: whatever was cached before but is absent from a fresh snapshot gets evicted. An
//! informative agent only contributes relationships and never deletes anything, and its attributes are discarded.
//!
//! The merge is performed by [`ProviderCache`](provider_cache::ProviderCache):
//!
//! 1. every identifier is validated with the key parser of its provider;
//! 2. the previously cached ids in the agent's scope are diffed against the fresh result;
//! 3. fresh items are written: relationship types present in the result replace the stored ones, absent types are
//!    kept;
//! 4. relationships pointing at removed items are unlinked from their peers;
//! 5. the removed items are evicted.
//!
//! # Backends
//!
//! - [`InMemoryCache`](memory::InMemoryCache), a [moka](https://crates.io/crates/moka) based store for tests and
//!   single-process deployments;
//! - [`KeyValueCache`](kv::KeyValueCache) over any [`StoreClient`](store::StoreClient): a single Redis node, or a set
//!   of nodes sharded by key hash. Attribute blobs can be gzipped, and unchanged blobs are detected by their digest and
//!   not rewritten.
//!
//! # Scheduling
//!
//! [`AgentScheduler`](scheduler::AgentScheduler) runs registered agents on their intervals with bounded parallelism,
//! a per-agent timeout and failure backoff. A failed or timed out execution discards its result, so a broken API call
//! never evicts a cached inventory.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cats_cache::prelude::*;
//!
//! # async fn run(agent: Arc<dyn CachingAgent>) -> cats_cache::error::Result<()> {
//! let config = CatsConfig::load()?;
//! let cache = config.build_provider_cache(KeyParsers::new()).await?;
//!
//! let registry = Arc::new(AgentRegistry::new());
//! registry.register_caching_agent(agent)?;
//!
//! let scheduler = Arc::new(AgentScheduler::new(registry, cache, config.scheduler_options()?));
//! scheduler.start();
//! // ...
//! scheduler.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod builder;
pub mod cache_data;
pub mod config;
pub mod error;
pub mod filter;
pub mod keys;
pub mod kv;
pub mod memory;
pub mod metrics;
pub mod provider_cache;
pub mod registry;
pub mod result;
pub mod scheduler;
pub mod scope;
pub mod store;
#[cfg(feature = "tracing")]
pub mod telemetry;
pub mod test;
pub mod traits;

#[doc(inline)]
pub use provider_cache::ProviderCache;
#[doc(inline)]
pub use traits::Cache;
#[doc(inline)]
pub use traits::WriteableCache;

pub mod prelude {
    pub use crate::agent::AgentDataType;
    pub use crate::agent::Authority;
    pub use crate::agent::CachingAgent;
    pub use crate::agent::HealthProvidingAgent;
    pub use crate::agent::OnDemandAgent;
    pub use crate::agent::OnDemandResult;
    pub use crate::builder::CacheResultBuilder;
    pub use crate::cache_data::Attributes;
    pub use crate::cache_data::CacheData;
    pub use crate::cache_data::Relationships;
    pub use crate::config::CatsConfig;
    pub use crate::error::CacheError;
    pub use crate::filter::CacheFilter;
    pub use crate::filter::RelationshipCacheFilter;
    pub use crate::keys::KeyParser;
    pub use crate::keys::KeyParsers;
    pub use crate::keys::Keys;
    pub use crate::provider_cache::DefaultProviderCache;
    pub use crate::provider_cache::MergeStats;
    pub use crate::provider_cache::ProviderCache;
    pub use crate::registry::AgentRegistry;
    pub use crate::result::CacheResult;
    pub use crate::scheduler::AgentScheduler;
    pub use crate::scope::CacheSource;
    pub use crate::scope::MergeScope;
    pub use crate::traits::Cache;
    pub use crate::traits::WriteableCache;
}
