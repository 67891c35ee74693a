#![cfg(any(test, feature = "test"))]
//! Test doubles: an in-process [`StoreClient`] and configurable sample agents.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::agent::AgentDataType;
use crate::agent::CachingAgent;
use crate::agent::HealthProvidingAgent;
use crate::agent::OnDemandAgent;
use crate::agent::OnDemandResult;
use crate::builder::CacheResultBuilder;
use crate::cache_data::Attributes;
use crate::error::CacheError;
use crate::error::Result;
use crate::filter::compile_glob;
use crate::keys::Keys;
use crate::provider_cache::ProviderCache;
use crate::result::CacheResult;
use crate::store::BatchWriter;
use crate::store::StoreClient;
use crate::store::StoreReader;
use crate::store::WriteBatch;
use crate::store::WriteOp;

#[derive(Debug, Clone)]
enum StoreValue {
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
    Hash(HashMap<String, Vec<u8>>),
}

#[derive(Debug, Default)]
struct StoreState {
    values: HashMap<String, StoreValue>,
    ttls:   HashMap<String, u64>,
}

/// Key-value store held in process memory. Batches are applied atomically.
#[derive(Debug)]
pub struct MemoryStore {
    name:        String,
    state:       Mutex<StoreState>,
    fail_writes: AtomicBool,
    fail_reads:  AtomicBool,
    stall:       AtomicBool,
    batches:     AtomicUsize,
}

impl MemoryStore {
    pub fn new<S: ToString>(name: S) -> Self {
        Self {
            name:        name.to_string(),
            state:       Mutex::new(StoreState::default()),
            fail_writes: AtomicBool::new(false),
            fail_reads:  AtomicBool::new(false),
            stall:       AtomicBool::new(false),
            batches:     AtomicUsize::new(0),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes writes hang forever, like a store that stopped answering.
    pub fn set_stall_writes(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    /// Number of batches applied so far.
    pub fn batches_written(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn key_count(&self) -> usize {
        self.state.lock().values.len()
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.state.lock().values.keys().cloned().collect()
    }

    pub fn value(&self, key: &str) -> Option<Vec<u8>> {
        match self.state.lock().values.get(key) {
            Some(StoreValue::Bytes(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }

    pub fn members(&self, key: &str) -> BTreeSet<String> {
        match self.state.lock().values.get(key) {
            Some(StoreValue::Set(members)) => members.clone(),
            _ => BTreeSet::new(),
        }
    }

    pub fn hash_field(&self, key: &str, field: &str) -> Option<Vec<u8>> {
        match self.state.lock().values.get(key) {
            Some(StoreValue::Hash(hash)) => hash.get(field).cloned(),
            _ => None,
        }
    }

    pub fn ttl(&self, key: &str) -> Option<u64> {
        self.state.lock().ttls.get(key).copied()
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::unavailable(&self.name, "injected read failure"));
        }
        Ok(())
    }

    fn apply(state: &mut StoreState, op: WriteOp) {
        match op {
            WriteOp::Set { key, value } => {
                state.ttls.remove(&key);
                state.values.insert(key, StoreValue::Bytes(value));
            }
            WriteOp::Del { key } => {
                state.ttls.remove(&key);
                state.values.remove(&key);
            }
            WriteOp::SAdd { key, members } => {
                if let StoreValue::Set(set) = state
                    .values
                    .entry(key)
                    .or_insert_with(|| StoreValue::Set(BTreeSet::new()))
                {
                    set.extend(members);
                }
            }
            WriteOp::SRem { key, members } => {
                let emptied = match state.values.get_mut(&key) {
                    Some(StoreValue::Set(set)) => {
                        for member in &members {
                            set.remove(member);
                        }
                        set.is_empty()
                    }
                    _ => false,
                };
                if emptied {
                    state.values.remove(&key);
                    state.ttls.remove(&key);
                }
            }
            WriteOp::HSet { key, field, value } => {
                if let StoreValue::Hash(hash) = state
                    .values
                    .entry(key)
                    .or_insert_with(|| StoreValue::Hash(HashMap::new()))
                {
                    hash.insert(field, value);
                }
            }
            WriteOp::HDel { key, fields } => {
                let emptied = match state.values.get_mut(&key) {
                    Some(StoreValue::Hash(hash)) => {
                        for field in &fields {
                            hash.remove(field);
                        }
                        hash.is_empty()
                    }
                    _ => false,
                };
                if emptied {
                    state.values.remove(&key);
                }
            }
            WriteOp::Expire { key, seconds } => {
                if state.values.contains_key(&key) {
                    state.ttls.insert(key, seconds);
                }
            }
        }
    }
}

#[async_trait]
impl StoreReader for MemoryStore {
    async fn get_values(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.check_reads()?;
        Ok(keys.iter().map(|key| self.value(key)).collect())
    }

    async fn hash_values(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.check_reads()?;
        Ok(fields.iter().map(|field| self.hash_field(key, field)).collect())
    }

    async fn set_members(&self, keys: &[String]) -> Result<Vec<BTreeSet<String>>> {
        self.check_reads()?;
        Ok(keys.iter().map(|key| self.members(key)).collect())
    }

    async fn scan_set(&self, key: &str, pattern: Option<&str>, _count: usize) -> Result<BTreeSet<String>> {
        self.check_reads()?;
        let members = self.members(key);
        match pattern {
            Some(pattern) => {
                let matcher = compile_glob(pattern)?;
                Ok(members.into_iter().filter(|m| matcher.is_match(m)).collect())
            }
            None => Ok(members),
        }
    }

    async fn set_contains(&self, key: &str, members: &[String]) -> Result<Vec<bool>> {
        self.check_reads()?;
        let set = self.members(key);
        Ok(members.iter().map(|m| set.contains(m)).collect())
    }
}

#[async_trait]
impl BatchWriter for MemoryStore {
    fn supports_atomic_batches(&self) -> bool {
        true
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::unavailable(&self.name, "injected write failure"));
        }
        let mut state = self.state.lock();
        for op in batch.into_ops() {
            Self::apply(&mut state, op);
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl StoreClient for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Caching agent reporting a configurable set of resources of one authoritative type.
///
/// Resource `name` is cached under `provider:data_type:account:region:name`, `global` standing in for a missing
/// region.
#[derive(Debug)]
pub struct SnapshotAgent {
    agent_type: String,
    provider:   String,
    account:    String,
    region:     Option<String>,
    data_type:  String,
    names:      Mutex<Vec<String>>,
    related:    Mutex<Vec<(String, String)>>,
    informs:    Mutex<Vec<String>>,
    fail:       AtomicBool,
    delay:      Mutex<Option<Duration>>,
    interval:   Option<Duration>,
    calls:      AtomicUsize,
}

impl SnapshotAgent {
    pub fn new(agent_type: &str, provider: &str, account: &str, region: Option<&str>, data_type: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            provider:   provider.to_string(),
            account:    account.to_string(),
            region:     region.map(str::to_string),
            data_type:  data_type.to_string(),
            names:      Mutex::new(Vec::new()),
            related:    Mutex::new(Vec::new()),
            informs:    Mutex::new(Vec::new()),
            fail:       AtomicBool::new(false),
            delay:      Mutex::new(None),
            interval:   None,
            calls:      AtomicUsize::new(0),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_names(self, names: &[&str]) -> Self {
        self.set_names(names);
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn set_names(&self, names: &[&str]) {
        *self.names.lock() = names.iter().map(|n| n.to_string()).collect();
    }

    /// Every reported resource will carry a relationship to `target` of `related_type`.
    pub fn relate_to(&self, related_type: &str, target: &str) {
        self.related.lock().push((related_type.to_string(), target.to_string()));
    }

    /// Also write, informatively, a back reference from each `related_type` target to the reported resources.
    pub fn inform(&self, related_type: &str) {
        self.informs.lock().push(related_type.to_string());
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn key(&self, name: &str) -> String {
        Keys::resource(
            &self.provider,
            &self.data_type,
            &self.account,
            self.region.as_deref().unwrap_or("global"),
            name,
        )
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.names.lock().iter().map(|name| self.key(name)).collect()
    }
}

#[async_trait]
impl CachingAgent for SnapshotAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn account_name(&self) -> &str {
        &self.account
    }

    fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    fn interval(&self) -> Option<Duration> {
        self.interval
    }

    fn provided_data_types(&self) -> Vec<AgentDataType> {
        let mut types = vec![AgentDataType::authoritative(&self.data_type)];
        types.extend(self.informs.lock().iter().map(AgentDataType::informative));
        types
    }

    async fn load_data(&self, _cache: &dyn ProviderCache) -> Result<CacheResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(CacheError::agent_execution(&self.agent_type, "injected API failure"));
        }

        let names = self.names.lock().clone();
        let related = self.related.lock().clone();
        let informs = self.informs.lock().clone();

        let mut builder = CacheResultBuilder::new();
        for name in &names {
            let key = self.key(name);
            let data = builder.namespace(&self.data_type).keep(&key);
            data.set_attribute("name", json!(name))
                .set_attribute("account", json!(self.account));
            for (related_type, target) in &related {
                data.add_relationship(related_type, target);
            }

            for (related_type, target) in related.iter().filter(|(t, _)| informs.contains(t)) {
                builder
                    .namespace(related_type)
                    .keep(target)
                    .add_relationship(&self.data_type, &key);
            }
        }
        Ok(builder.build())
    }
}

#[derive(Debug)]
pub struct StaticHealthAgent {
    health_id: String,
}

impl StaticHealthAgent {
    pub fn new(health_id: &str) -> Self {
        Self {
            health_id: health_id.to_string(),
        }
    }
}

impl HealthProvidingAgent for StaticHealthAgent {
    fn health_id(&self) -> &str {
        &self.health_id
    }
}

/// On-demand agent refreshing one resource described by `{"account", "region", "name"}`, or evicting it when the
/// request carries `"deleted": true`.
#[derive(Debug)]
pub struct SingleResourceOnDemandAgent {
    agent_type: String,
    provider:   String,
    data_type:  String,
}

impl SingleResourceOnDemandAgent {
    pub fn new(agent_type: &str, provider: &str, data_type: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            provider:   provider.to_string(),
            data_type:  data_type.to_string(),
        }
    }
}

#[async_trait]
impl OnDemandAgent for SingleResourceOnDemandAgent {
    fn on_demand_agent_type(&self) -> &str {
        &self.agent_type
    }

    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn handles(&self, on_demand_type: &str, cloud_provider: &str) -> bool {
        on_demand_type == self.data_type && cloud_provider == self.provider
    }

    async fn handle(&self, _cache: &dyn ProviderCache, data: &Attributes) -> Result<Option<OnDemandResult>> {
        let (Some(account), Some(region), Some(name)) = (
            text_field(data, "account"),
            text_field(data, "region"),
            text_field(data, "name"),
        )
        else {
            return Ok(None);
        };

        let key = Keys::resource(&self.provider, &self.data_type, account, region, name);
        let mut builder = CacheResultBuilder::new();
        let namespace = builder.namespace(&self.data_type);
        if data.get("deleted").and_then(|v| v.as_bool()).unwrap_or(false) {
            namespace.evict(&key);
        }
        else {
            namespace.keep(&key).set_attributes(data.clone());
        }

        Ok(Some(OnDemandResult {
            source_agent_type:   self.agent_type.clone(),
            authoritative_types: BTreeSet::from([self.data_type.clone()]),
            cache_result:        builder.build(),
        }))
    }
}

fn text_field<'a>(data: &'a Attributes, name: &str) -> Option<&'a str> {
    data.get(name).and_then(|v| v.as_str())
}
