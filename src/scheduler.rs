//! Interval scheduling of caching agents.
//!
//! The dispatcher only decides which agents are due; executions run as independent tasks bounded by a semaphore of
//! `max_concurrent_agents` permits, held from loading until the merge is done. Per agent the state machine is
//! `Idle -> Running -> Idle | Failed`, with at most one execution in flight: a trigger arriving while the agent runs
//! is skipped, not queued.
//!
//! An execution loads data under `agent_timeout` and merges only if loading succeeded and the scheduler has not been
//! shut down meanwhile. Shutdown never interrupts a merge; `merge_timeout` does, failing the run as unavailable.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fieldx::fxstruct;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::agent::authoritative_types;
use crate::agent::CachingAgent;
use crate::cache_data::Attributes;
use crate::error::CacheError;
use crate::error::Result;
use crate::provider_cache::MergeStats;
use crate::provider_cache::ProviderCache;
use crate::registry::AgentRegistry;
use crate::result::CacheResult;
use crate::scope::CacheSource;
use crate::scope::MergeScope;

#[derive(Debug, Clone)]
#[fxstruct(no_new, builder, get(copy))]
pub struct SchedulerOptions {
    /// Size of the worker pool.
    #[fieldx(default(4))]
    max_concurrent_agents: usize,

    /// Interval of agents that do not define their own.
    #[fieldx(default(Duration::from_secs(60)))]
    default_interval: Duration,

    /// Wall-clock bound of a single data load.
    #[fieldx(default(Duration::from_secs(300)))]
    agent_timeout: Duration,

    /// Delay before a failed agent is retried.
    #[fieldx(default(Duration::from_secs(30)))]
    failure_backoff: Duration,

    /// Wall-clock bound of merging one result into the cache.
    #[fieldx(default(Duration::from_secs(120)))]
    merge_timeout: Duration,

    /// How often the dispatcher looks for due agents.
    #[fieldx(default(Duration::from_millis(250)))]
    tick: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Running,
    Failed { retry_at: Instant },
}

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Completed(MergeStats),
    /// The agent was already running.
    Skipped,
    /// Loading or merging failed; the result was discarded.
    Failed(CacheError),
}

impl ExecutionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Hooks into agent executions. All methods default to no-ops.
#[async_trait]
pub trait SchedulerObserver: Send + Sync + 'static {
    async fn on_start(&self, _agent_type: &str) {}
    async fn on_success(&self, _agent_type: &str, _stats: &MergeStats, _elapsed: Duration) {}
    async fn on_failure(&self, _agent_type: &str, _error: &CacheError) {}
    async fn on_skip(&self, _agent_type: &str) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl SchedulerObserver for NoopObserver {}

#[derive(Debug, Clone, Copy)]
struct AgentSlot {
    state:    AgentState,
    next_run: Instant,
}

pub struct AgentScheduler {
    registry:   Arc<AgentRegistry>,
    cache:      Arc<dyn ProviderCache>,
    options:    SchedulerOptions,
    observer:   Arc<dyn SchedulerObserver>,
    slots:      Mutex<HashMap<String, AgentSlot>>,
    permits:    Arc<Semaphore>,
    shutdown:   CancellationToken,
    tasks:      TaskTracker,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Returns the agent to a schedulable state even if its execution task is dropped mid-way.
struct RunGuard<'a> {
    scheduler:  &'a AgentScheduler,
    agent_type: String,
    interval:   Duration,
    done:       bool,
}

impl RunGuard<'_> {
    fn finish(mut self, success: bool) {
        self.done = true;
        self.scheduler.release(&self.agent_type, success, self.interval);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.scheduler.release(&self.agent_type, false, self.interval);
        }
    }
}

impl AgentScheduler {
    pub fn new(registry: Arc<AgentRegistry>, cache: Arc<dyn ProviderCache>, options: SchedulerOptions) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(options.max_concurrent_agents().max(1))),
            registry,
            cache,
            options,
            observer: Arc::new(NoopObserver),
            slots: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SchedulerObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<dyn ProviderCache> {
        &self.cache
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn agent_state(&self, agent_type: &str) -> Option<AgentState> {
        self.slots.lock().get(agent_type).map(|slot| slot.state)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn interval_of(&self, agent: &dyn CachingAgent) -> Duration {
        agent.interval().unwrap_or(self.options.default_interval())
    }

    /// Marks the agent as running unless it already is.
    fn try_claim(&self, agent_type: &str) -> bool {
        let mut slots = self.slots.lock();
        let slot = slots.entry(agent_type.to_string()).or_insert(AgentSlot {
            state:    AgentState::Idle,
            next_run: Instant::now(),
        });
        if slot.state == AgentState::Running {
            return false;
        }
        slot.state = AgentState::Running;
        true
    }

    fn release(&self, agent_type: &str, success: bool, interval: Duration) {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(agent_type)
        else {
            return;
        };
        if success {
            slot.state = AgentState::Idle;
            slot.next_run = now + interval;
        }
        else {
            let retry_at = now + self.options.failure_backoff();
            slot.state = AgentState::Failed { retry_at };
            slot.next_run = retry_at;
        }
    }

    /// Registered agents whose next run is due, claimed for execution.
    fn claim_due(&self) -> Vec<Arc<dyn CachingAgent>> {
        let now = Instant::now();
        let agents = self.registry.caching_agents();
        let mut slots = self.slots.lock();
        slots.retain(|agent_type, _| agents.iter().any(|a| a.agent_type() == agent_type));

        agents
            .into_iter()
            .filter(|agent| {
                let slot = slots.entry(agent.agent_type().to_string()).or_insert(AgentSlot {
                    state:    AgentState::Idle,
                    next_run: now,
                });
                if slot.state == AgentState::Running || slot.next_run > now {
                    return false;
                }
                slot.state = AgentState::Running;
                true
            })
            .collect()
    }

    /// Runs a registered agent right away, unless it is already running.
    pub async fn run_agent(&self, agent_type: &str) -> Result<ExecutionOutcome> {
        let agent = self
            .registry
            .caching_agent(agent_type)
            .ok_or_else(|| CacheError::UnknownAgent(agent_type.to_string()))?;

        if !self.try_claim(agent_type) {
            debug!("Agent {agent_type} is already running, skipping");
            self.observer.on_skip(agent_type).await;
            return Ok(ExecutionOutcome::Skipped);
        }
        Ok(self.run_claimed(agent).await)
    }

    async fn load(&self, agent: &dyn CachingAgent) -> Result<CacheResult> {
        let agent_type = agent.agent_type();
        let timeout = self.options.agent_timeout();

        self.observer.on_start(agent_type).await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(CacheError::Cancelled { agent: agent_type.to_string() }),
            loaded = tokio::time::timeout(timeout, agent.load_data(self.cache.as_ref())) => match loaded {
                Ok(result) => result,
                Err(_) => Err(CacheError::Timeout { agent: agent_type.to_string(), timeout }),
            },
        }
    }

    async fn merge(&self, source: &CacheSource, types: &BTreeSet<String>, result: CacheResult) -> Result<MergeStats> {
        let timeout = self.options.merge_timeout();
        tokio::time::timeout(timeout, self.cache.put_cache_result(source, types, result))
            .await
            .map_err(|_| CacheError::unavailable("cache", format!("merge of {source} took longer than {timeout:?}")))?
    }

    /// Loads and merges while holding a worker permit.
    async fn execute(&self, agent: &dyn CachingAgent) -> Result<MergeStats> {
        let cancelled = || CacheError::Cancelled {
            agent: agent.agent_type().to_string(),
        };
        let _permit = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(cancelled()),
            permit = self.permits.acquire() => permit.map_err(|_| cancelled())?,
        };

        let result = self.load(agent).await?;
        // Shutdown may have been requested while the data was loading.
        if self.shutdown.is_cancelled() {
            return Err(cancelled());
        }
        let source = CacheSource::new(agent.agent_type(), agent.scope());
        let types = authoritative_types(&agent.provided_data_types());
        self.merge(&source, &types, result).await
    }

    #[instrument(level = "debug", skip_all, fields(agent = %agent.agent_type()))]
    async fn run_claimed(&self, agent: Arc<dyn CachingAgent>) -> ExecutionOutcome {
        let guard = RunGuard {
            scheduler:  self,
            agent_type: agent.agent_type().to_string(),
            interval:   self.interval_of(agent.as_ref()),
            done:       false,
        };
        let started = Instant::now();

        match self.execute(agent.as_ref()).await {
            Ok(stats) => {
                let elapsed = started.elapsed();
                debug!(
                    "Agent {} completed in {elapsed:?}: {} written, {} evicted",
                    guard.agent_type,
                    stats.written_items(),
                    stats.evicted_items()
                );
                self.observer.on_success(&guard.agent_type, &stats, elapsed).await;
                guard.finish(true);
                ExecutionOutcome::Completed(stats)
            }
            Err(err) => {
                warn!("Agent {} failed, result discarded: {err}", guard.agent_type);
                self.observer.on_failure(&guard.agent_type, &err).await;
                guard.finish(false);
                ExecutionOutcome::Failed(err)
            }
        }
    }

    /// Starts the dispatcher. Calling it again while running has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        info!(
            "Starting agent scheduler: {} worker(s), {} agent(s)",
            self.options.max_concurrent_agents(),
            self.registry.len()
        );
        let scheduler = self.clone();
        *dispatcher = Some(tokio::spawn(async move { scheduler.dispatch().await }));
    }

    async fn dispatch(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.options.tick());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }

            for agent in self.claim_due() {
                let scheduler = self.clone();
                self.tasks.spawn(async move {
                    scheduler.run_claimed(agent).await;
                });
            }
        }
        debug!("Agent dispatcher stopped");
    }

    /// Stops dispatching, cancels executions that have not reached their merge and waits for the rest.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            if let Err(err) = dispatcher.await {
                warn!("Agent dispatcher terminated abnormally: {err}");
            }
        }
        self.tasks.close();
        self.tasks.wait().await;
        info!("Agent scheduler shut down");
    }

    /// Refreshes a single entity through every on-demand agent able to handle it.
    ///
    /// Results are merged with their scope limited to the ids they mention, so siblings are never evicted.
    #[instrument(level = "debug", skip(self, data))]
    pub async fn on_demand(&self, on_demand_type: &str, cloud_provider: &str, data: &Attributes) -> Result<MergeStats> {
        let agents = self.registry.on_demand_agents_for(on_demand_type, cloud_provider);
        if agents.is_empty() {
            debug!("No on-demand agent handles '{on_demand_type}' for '{cloud_provider}'");
        }

        let timeout = self.options.agent_timeout();
        let mut stats = MergeStats::default();
        for agent in agents {
            let agent_type = agent.on_demand_agent_type();
            let handled = tokio::time::timeout(timeout, agent.handle(self.cache.as_ref(), data))
                .await
                .map_err(|_| CacheError::Timeout {
                    agent: agent_type.to_string(),
                    timeout,
                })??;

            let Some(handled) = handled
            else {
                continue;
            };
            let source = CacheSource::new(
                &handled.source_agent_type,
                MergeScope::Ids(handled.cache_result.touched_ids()),
            );
            let merged = self
                .merge(&source, &handled.authoritative_types, handled.cache_result)
                .await?;
            stats.combine(merged);
        }
        Ok(stats)
    }

    /// Deregisters an agent. With `evict` its scope is merged as empty, removing everything it was authoritative for.
    pub async fn deregister_agent(&self, agent_type: &str, evict: bool) -> Result<Option<MergeStats>> {
        let Some(agent) = self.registry.deregister_caching_agent(agent_type)
        else {
            return Err(CacheError::UnknownAgent(agent_type.to_string()));
        };
        self.slots.lock().remove(agent_type);
        if !evict {
            return Ok(None);
        }
        Ok(Some(self.evict_scope(agent.as_ref()).await?))
    }

    /// Removes all agents of an account and evicts their data.
    pub async fn deregister_account(&self, provider: &str, account: &str) -> Result<MergeStats> {
        let mut stats = MergeStats::default();
        for agent in self.registry.deregister_account(provider, account) {
            self.slots.lock().remove(agent.agent_type());
            stats.combine(self.evict_scope(agent.as_ref()).await?);
        }
        Ok(stats)
    }

    async fn evict_scope(&self, agent: &dyn CachingAgent) -> Result<MergeStats> {
        let source = CacheSource::new(agent.agent_type(), agent.scope());
        let types = authoritative_types(&agent.provided_data_types());
        info!("Evicting data of {source}");
        self.merge(&source, &types, CacheResult::empty()).await
    }
}

impl Debug for AgentScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentScheduler")
            .field("options", &self.options)
            .field("agents", &self.registry.len())
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish()
    }
}
