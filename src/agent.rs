//! Contracts between data-producing agents and the cache.
//!
//! Agents are composed from small capability traits and registered explicitly with the
//! [`AgentRegistry`](crate::registry::AgentRegistry):
//!
//! - [`CachingAgent`] is scheduled on an interval and produces a full snapshot of its scope;
//! - [`OnDemandAgent`] refreshes a single entity synchronously after a user-facing operation;
//! - [`HealthProvidingAgent`] contributes health data for entities owned by other agents.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache_data::Attributes;
use crate::error::Result;
use crate::provider_cache::ProviderCache;
use crate::result::CacheResult;
use crate::scope::MergeScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Authority {
    /// Sole source of truth: absence from a fresh result means deletion.
    Authoritative,
    /// Contributes relationships to entities owned by someone else.
    Informative,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentDataType {
    type_name: String,
    authority: Authority,
}

impl AgentDataType {
    pub fn authoritative<S: ToString>(type_name: S) -> Self {
        Self {
            type_name: type_name.to_string(),
            authority: Authority::Authoritative,
        }
    }

    pub fn informative<S: ToString>(type_name: S) -> Self {
        Self {
            type_name: type_name.to_string(),
            authority: Authority::Informative,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn authority(&self) -> Authority {
        self.authority
    }

    pub fn is_authoritative(&self) -> bool {
        self.authority == Authority::Authoritative
    }
}

/// Authoritative type names out of a list of declared data types.
pub fn authoritative_types(types: &[AgentDataType]) -> BTreeSet<String> {
    types
        .iter()
        .filter(|t| t.is_authoritative())
        .map(|t| t.type_name().to_string())
        .collect()
}

#[async_trait]
pub trait CachingAgent: Debug + Send + Sync + 'static {
    /// Unique name of the agent, e.g. `acctA/us-east-1/ImageCachingAgent`.
    fn agent_type(&self) -> &str;

    fn provider_name(&self) -> &str;

    fn account_name(&self) -> &str;

    fn region(&self) -> Option<&str> {
        None
    }

    fn provided_data_types(&self) -> Vec<AgentDataType>;

    /// Polling interval of this agent; the scheduler default applies when `None`.
    fn interval(&self) -> Option<Duration> {
        None
    }

    /// Ids this agent is responsible for in its authoritative types.
    fn scope(&self) -> MergeScope {
        MergeScope::account(self.provider_name(), self.account_name(), self.region())
    }

    /// Queries the external API and returns the complete current view of the agent's scope.
    ///
    /// Errors must be returned as such: an empty successful result evicts everything previously cached in scope.
    async fn load_data(&self, cache: &dyn ProviderCache) -> Result<CacheResult>;
}

/// Result of an on-demand refresh.
#[derive(Debug, Clone, Default)]
pub struct OnDemandResult {
    pub source_agent_type:   String,
    pub authoritative_types: BTreeSet<String>,
    /// Entities to write plus explicit evictions of ids the agent found to be gone.
    pub cache_result:        CacheResult,
}

#[async_trait]
pub trait OnDemandAgent: Debug + Send + Sync + 'static {
    fn on_demand_agent_type(&self) -> &str;

    fn provider_name(&self) -> &str;

    /// Whether this agent can refresh entities of `on_demand_type` for `cloud_provider`.
    fn handles(&self, on_demand_type: &str, cloud_provider: &str) -> bool;

    /// Refreshes the entity described by `data`. `None` means the request was not applicable.
    async fn handle(&self, cache: &dyn ProviderCache, data: &Attributes) -> Result<Option<OnDemandResult>>;
}

pub trait HealthProvidingAgent: Debug + Send + Sync + 'static {
    /// Name of the health source, used as the relationship type under which health entries are linked.
    fn health_id(&self) -> &str;
}
