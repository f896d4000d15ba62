//! Core-state controller
//!
//! Owns the authoritative [`CoreStateStore`], drives transitions through
//! the host agents and answers status and usage queries. A background
//! [`MonitorLoop`] feeds sampled usage through the [`TransitionPolicy`](crate::policy::TransitionPolicy)
//! while callers may force transitions with [`CoreController::switch`].
//!
//! Every transition follows the same protocol, whoever triggers it:
//! compare-and-swap the core into `Transitioning`, call the agent with a
//! timeout, then swap to the target on success or back to the prior state
//! on failure. Losing the first swap means someone else owns the core.

mod monitor;

#[cfg(test)]
mod tests;

pub use monitor::{CycleReport, MonitorLoop};

use crate::agent::HostAgents;
use crate::error::{ControllerError, TransitionError};
use crate::health::HealthRegistry;
use crate::models::{CoreId, CoreState, FleetConfig, TargetState};
use crate::observability::{outcome, ControllerMetrics, StructuredLogger};
use crate::policy::PolicyConfig;
use crate::sampler::{UsageSampler, UsageSnapshot, DEFAULT_WINDOW_SIZE};
use crate::store::CoreStateStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tuning for the controller and its monitoring loop
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Time between monitoring cycles (default: 10 seconds)
    pub sample_interval: Duration,
    /// Upper bound for any single host agent call (default: 5 seconds)
    pub agent_timeout: Duration,
    /// Samples per rolling window (default: 3)
    pub window_size: usize,
    pub policy: PolicyConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(10),
            agent_timeout: Duration::from_secs(5),
            window_size: DEFAULT_WINDOW_SIZE,
            policy: PolicyConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_interval.is_zero() {
            anyhow::bail!("sample interval must be non-zero");
        }
        if self.agent_timeout.is_zero() {
            anyhow::bail!("agent timeout must be non-zero");
        }
        if self.window_size == 0 {
            anyhow::bail!("window size must be at least 1");
        }
        self.policy.validate()
    }
}

/// Last failed transition of a core
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionFailure {
    pub target: TargetState,
    pub kind: &'static str,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Fleet-wide status
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    /// True when no core in the fleet is asleep
    pub is_awake: bool,
    pub any_asleep: bool,
    pub monitoring: bool,
    pub cores: BTreeMap<CoreId, CoreState>,
    pub failures: BTreeMap<CoreId, TransitionFailure>,
}

/// Status of a single core
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreStatus {
    pub core_id: CoreId,
    pub state: CoreState,
    /// True only for a confirmed `Awake` state
    pub is_awake: bool,
}

/// Answer to a sleep-status query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SleepStatus {
    Fleet(FleetStatus),
    Core(CoreStatus),
}

struct MonitorHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

struct Inner {
    fleet: Arc<FleetConfig>,
    agents: HostAgents,
    store: CoreStateStore,
    config: ControllerConfig,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
    health: HealthRegistry,
    /// Latest usage view published by the monitoring loop
    usage: watch::Sender<Option<Arc<UsageSnapshot>>>,
    failures: DashMap<CoreId, TransitionFailure>,
    is_monitoring: AtomicBool,
    monitor: Mutex<Option<MonitorHandle>>,
}

/// Handle to the controller; clones share the same state
#[derive(Clone)]
pub struct CoreController {
    inner: Arc<Inner>,
}

impl CoreController {
    pub fn builder() -> CoreControllerBuilder {
        CoreControllerBuilder::new()
    }

    pub fn fleet(&self) -> &FleetConfig {
        &self.inner.fleet
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.inner.health
    }

    pub fn store(&self) -> &CoreStateStore {
        &self.inner.store
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner.is_monitoring.load(Ordering::SeqCst)
    }

    /// Start the monitoring loop in the background
    ///
    /// Returns `false` without side effects when a loop is already running.
    pub fn begin(&self) -> bool {
        let mut monitor = self.inner.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = monitor.as_ref() {
            if !handle.task.is_finished() {
                debug!("Monitoring already running");
                return false;
            }
        }

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let monitor_loop = MonitorLoop::new(self.clone());
        let task = tokio::spawn(monitor_loop.run(shutdown_rx));
        *monitor = Some(MonitorHandle { shutdown, task });

        self.inner.is_monitoring.store(true, Ordering::SeqCst);
        self.inner
            .logger
            .log_monitoring_started(self.inner.config.sample_interval.as_secs());
        true
    }

    /// Stop the monitoring loop at its next iteration boundary and wait for it
    pub async fn stop(&self) {
        let handle = {
            let mut monitor = self.inner.monitor.lock().unwrap_or_else(|e| e.into_inner());
            // Cleared under the lock, before the loop is awaited
            self.inner.is_monitoring.store(false, Ordering::SeqCst);
            monitor.take()
        };

        if let Some(handle) = handle {
            let _ = handle.shutdown.send(());
            if let Err(e) = handle.task.await {
                warn!(error = %e, "Monitoring task ended abnormally");
            }
            info!("Monitoring stopped");
        }
    }

    /// Sleep status of one core, or of the whole fleet when `core` is `None`
    pub fn is_asleep(&self, core: Option<&CoreId>) -> Result<SleepStatus, ControllerError> {
        match core {
            Some(id) => self.core_status(id).map(SleepStatus::Core),
            None => Ok(SleepStatus::Fleet(self.fleet_status())),
        }
    }

    pub fn core_status(&self, id: &CoreId) -> Result<CoreStatus, ControllerError> {
        let state = self.inner.store.get(id)?;
        Ok(CoreStatus {
            core_id: id.clone(),
            state,
            is_awake: state.is_awake(),
        })
    }

    pub fn fleet_status(&self) -> FleetStatus {
        let cores = self.inner.store.snapshot();
        let any_asleep = cores.values().any(|s| *s == CoreState::Asleep);
        let failures = self
            .inner
            .failures
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        FleetStatus {
            is_awake: !any_asleep,
            any_asleep,
            monitoring: self.is_monitoring(),
            cores,
            failures,
        }
    }

    /// Ids of all sleeping cores, ordered by host then core index
    pub fn sleeping_core_ids(&self) -> Vec<CoreId> {
        self.inner.store.ids_in_state(CoreState::Asleep)
    }

    /// Toggle a dynamic core regardless of policy
    ///
    /// Returns the state the core ended up in.
    pub async fn switch(&self, id: &CoreId) -> Result<CoreState, ControllerError> {
        if self.inner.store.is_pinned(id)? {
            return Err(ControllerError::PinnedCore(id.clone()));
        }

        let target = match self.inner.store.get(id)? {
            CoreState::Awake => TargetState::Asleep,
            CoreState::Asleep => TargetState::Awake,
            CoreState::Transitioning => {
                return Err(ControllerError::TransitionConflict(id.clone()));
            }
        };

        // Detached so a dropped request cannot strand the core in Transitioning
        let controller = self.clone();
        let core = id.clone();
        let result = tokio::spawn(async move {
            let result = controller.transition(&core, target, "switch").await;
            controller.refresh_core_counts();
            result
        })
        .await;

        result.unwrap_or_else(|e| {
            Err(ControllerError::Transition {
                core: id.clone(),
                source: TransitionError::Rejected(format!("transition task failed: {e}")),
            })
        })
    }

    /// Latest usage per core
    ///
    /// Serves the view published by the last monitoring cycle. Before the
    /// first cycle the fleet is sampled on demand, leaving the rolling
    /// windows untouched.
    pub async fn core_usage(&self) -> Result<Arc<UsageSnapshot>, ControllerError> {
        let published = self.inner.usage.borrow().clone();
        let snapshot = match published {
            Some(snapshot) => snapshot,
            None => {
                let sampler =
                    UsageSampler::new(self.inner.fleet.clone(), self.inner.config.agent_timeout);
                let outcome = sampler.sample(&self.inner.agents).await;
                Arc::new(UsageSnapshot::from_outcome(&outcome))
            }
        };

        let hosts = self.inner.fleet.hosts.len();
        if hosts > 0 && snapshot.failed_hosts.len() >= hosts {
            return Err(ControllerError::SamplerUnavailable);
        }
        Ok(snapshot)
    }

    /// Run one transition through the CAS / agent / settle protocol
    pub(crate) async fn transition(
        &self,
        id: &CoreId,
        target: TargetState,
        trigger: &str,
    ) -> Result<CoreState, ControllerError> {
        let inner = &self.inner;
        let prior = target.opposite();

        if !inner
            .store
            .set_if_current(id, prior, CoreState::Transitioning)?
        {
            debug!(core_id = %id, target = target.as_str(), trigger, "Transition conflict");
            inner.metrics.inc_transition(target, outcome::CONFLICT);
            return Err(ControllerError::TransitionConflict(id.clone()));
        }

        let result = match inner.agents.get(&id.host) {
            Some(agent) => {
                let start = Instant::now();
                let timeout = inner.config.agent_timeout;
                let result = tokio::time::timeout(timeout, agent.set_core_state(id, target))
                    .await
                    .unwrap_or(Err(TransitionError::Timeout(timeout)));
                inner
                    .metrics
                    .observe_transition_latency(start.elapsed().as_secs_f64());
                result
            }
            None => Err(TransitionError::Unreachable(format!(
                "no agent configured for host {}",
                id.host
            ))),
        };

        match result {
            Ok(()) => {
                let next = CoreState::from(target);
                self.settle(id, next);
                inner.failures.remove(id);
                inner.metrics.inc_transition(target, outcome::OK);
                inner.logger.log_transition(id, target, trigger, None);
                Ok(next)
            }
            Err(err) => {
                self.settle(id, prior);
                inner.failures.insert(
                    id.clone(),
                    TransitionFailure {
                        target,
                        kind: err.kind(),
                        reason: err.to_string(),
                        at: Utc::now(),
                    },
                );
                inner.metrics.inc_transition(target, outcome::FAILED);
                inner
                    .logger
                    .log_transition(id, target, trigger, Some(&err.to_string()));
                Err(ControllerError::Transition {
                    core: id.clone(),
                    source: err,
                })
            }
        }
    }

    /// Leave `Transitioning` for `next`
    fn settle(&self, id: &CoreId, next: CoreState) {
        match self
            .inner
            .store
            .set_if_current(id, CoreState::Transitioning, next)
        {
            Ok(true) => {}
            Ok(false) => warn!(core_id = %id, "Core left Transitioning outside its owner"),
            Err(e) => warn!(core_id = %id, error = %e, "Failed to settle core state"),
        }
    }

    fn publish_usage(&self, snapshot: UsageSnapshot) {
        self.inner.usage.send_replace(Some(Arc::new(snapshot)));
    }

    fn refresh_core_counts(&self) {
        let snapshot = self.inner.store.snapshot();
        let asleep = snapshot
            .values()
            .filter(|s| **s == CoreState::Asleep)
            .count() as i64;
        let awake = snapshot.values().filter(|s| s.is_awake()).count() as i64;
        self.inner.metrics.set_core_counts(awake, asleep);
    }

    fn agents(&self) -> &HostAgents {
        &self.inner.agents
    }

    fn metrics(&self) -> &ControllerMetrics {
        &self.inner.metrics
    }
}

/// Builder for [`CoreController`]
pub struct CoreControllerBuilder {
    fleet: Option<FleetConfig>,
    agents: Option<HostAgents>,
    config: ControllerConfig,
    health: Option<HealthRegistry>,
    service_name: String,
}

impl CoreControllerBuilder {
    pub fn new() -> Self {
        Self {
            fleet: None,
            agents: None,
            config: ControllerConfig::default(),
            health: None,
            service_name: "greencore".to_string(),
        }
    }

    pub fn fleet(mut self, fleet: FleetConfig) -> Self {
        self.fleet = Some(fleet);
        self
    }

    pub fn agents(mut self, agents: HostAgents) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.config.sample_interval = interval;
        self
    }

    pub fn agent_timeout(mut self, timeout: Duration) -> Self {
        self.config.agent_timeout = timeout;
        self
    }

    /// Share an existing health registry, e.g. the one served over HTTP
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Validate the inputs and build the controller with every configured
    /// core tracked as `Awake`
    pub fn build(self) -> Result<CoreController> {
        let fleet = self
            .fleet
            .ok_or_else(|| anyhow::anyhow!("Fleet configuration is required"))?;
        let agents = self
            .agents
            .ok_or_else(|| anyhow::anyhow!("Host agents are required"))?;

        fleet.validate()?;
        self.config.validate()?;
        for host in &fleet.hosts {
            if !agents.contains_key(&host.name) {
                anyhow::bail!("no host agent for host '{}'", host.name);
            }
        }

        let store = CoreStateStore::new();
        store.populate(&fleet);

        let (usage, _) = watch::channel(None);
        let controller = CoreController {
            inner: Arc::new(Inner {
                fleet: Arc::new(fleet),
                agents,
                store,
                config: self.config,
                metrics: ControllerMetrics::new(),
                logger: StructuredLogger::new(self.service_name),
                health: self.health.unwrap_or_default(),
                usage,
                failures: DashMap::new(),
                is_monitoring: AtomicBool::new(false),
                monitor: Mutex::new(None),
            }),
        };
        controller.refresh_core_counts();
        Ok(controller)
    }
}

impl Default for CoreControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
