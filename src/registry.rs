//! Explicit registry of agents.
//!
//! Populated at startup and changed on configuration refresh, only through this API. Registration is where authority
//! conflicts are caught: two caching agents authoritative for the same type in overlapping scopes would evict each
//! other's data on every cycle.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::agent::CachingAgent;
use crate::agent::HealthProvidingAgent;
use crate::agent::OnDemandAgent;
use crate::error::CacheError;
use crate::error::Result;

#[derive(Debug, Default)]
pub struct AgentRegistry {
    caching:   RwLock<BTreeMap<String, Arc<dyn CachingAgent>>>,
    on_demand: RwLock<BTreeMap<String, Arc<dyn OnDemandAgent>>>,
    health:    RwLock<BTreeMap<String, Arc<dyn HealthProvidingAgent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_caching_agent(&self, agent: Arc<dyn CachingAgent>) -> Result<()> {
        let mut caching = self.caching.write();
        let agent_type = agent.agent_type().to_string();
        if caching.contains_key(&agent_type) {
            return Err(CacheError::config(format!("caching agent '{agent_type}' is already registered")));
        }

        let scope = agent.scope();
        for data_type in agent.provided_data_types().iter().filter(|t| t.is_authoritative()) {
            let conflict = caching.values().find(|other| {
                other
                    .provided_data_types()
                    .iter()
                    .any(|t| t.is_authoritative() && t.type_name() == data_type.type_name())
                    && other.scope().overlaps(&scope)
            });
            if let Some(other) = conflict {
                return Err(CacheError::AuthorityConflict {
                    data_type: data_type.type_name().to_string(),
                    first:     other.agent_type().to_string(),
                    second:    agent_type,
                });
            }
        }

        info!("Registered caching agent {agent_type} [{scope}]");
        caching.insert(agent_type, agent);
        Ok(())
    }

    pub fn deregister_caching_agent(&self, agent_type: &str) -> Option<Arc<dyn CachingAgent>> {
        let removed = self.caching.write().remove(agent_type);
        if removed.is_some() {
            info!("Deregistered caching agent {agent_type}");
        }
        removed
    }

    /// Removes every caching agent of an account, returning them so their data can be evicted.
    pub fn deregister_account(&self, provider: &str, account: &str) -> Vec<Arc<dyn CachingAgent>> {
        let mut caching = self.caching.write();
        let agent_types: Vec<String> = caching
            .values()
            .filter(|agent| agent.provider_name() == provider && agent.account_name() == account)
            .map(|agent| agent.agent_type().to_string())
            .collect();
        agent_types
            .iter()
            .filter_map(|agent_type| caching.remove(agent_type))
            .collect()
    }

    pub fn caching_agent(&self, agent_type: &str) -> Option<Arc<dyn CachingAgent>> {
        self.caching.read().get(agent_type).cloned()
    }

    pub fn caching_agents(&self) -> Vec<Arc<dyn CachingAgent>> {
        self.caching.read().values().cloned().collect()
    }

    pub fn register_on_demand_agent(&self, agent: Arc<dyn OnDemandAgent>) -> Result<()> {
        let agent_type = agent.on_demand_agent_type().to_string();
        let mut on_demand = self.on_demand.write();
        if on_demand.contains_key(&agent_type) {
            return Err(CacheError::config(format!("on-demand agent '{agent_type}' is already registered")));
        }
        on_demand.insert(agent_type, agent);
        Ok(())
    }

    pub fn deregister_on_demand_agent(&self, agent_type: &str) -> Option<Arc<dyn OnDemandAgent>> {
        self.on_demand.write().remove(agent_type)
    }

    /// On-demand agents able to refresh `on_demand_type` entities of `cloud_provider`.
    pub fn on_demand_agents_for(&self, on_demand_type: &str, cloud_provider: &str) -> Vec<Arc<dyn OnDemandAgent>> {
        self.on_demand
            .read()
            .values()
            .filter(|agent| agent.handles(on_demand_type, cloud_provider))
            .cloned()
            .collect()
    }

    pub fn register_health_provider(&self, agent: Arc<dyn HealthProvidingAgent>) {
        self.health.write().insert(agent.health_id().to_string(), agent);
    }

    pub fn deregister_health_provider(&self, health_id: &str) -> Option<Arc<dyn HealthProvidingAgent>> {
        self.health.write().remove(health_id)
    }

    /// Relationship types under which health entries are linked to their entities.
    pub fn health_ids(&self) -> BTreeSet<String> {
        self.health.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.caching.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.caching.read().is_empty()
    }
}
