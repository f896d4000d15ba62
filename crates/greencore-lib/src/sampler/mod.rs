//! Usage sampling across the fleet
//!
//! Every host is sampled concurrently with its own timeout, so one slow or
//! dead host never holds up the others. A host failure is reported on its
//! own and leaves that host's rolling windows untouched.

mod window;

pub use window::{UsageWindow, DEFAULT_WINDOW_SIZE};

use crate::agent::HostAgents;
use crate::error::{HostFailure, TransitionError};
use crate::models::{CoreId, CoreState, FleetConfig, HostId, UsageSample};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Result of sampling every host once
#[derive(Debug, Clone, Default)]
pub struct SampleOutcome {
    pub samples: Vec<UsageSample>,
    pub failures: Vec<HostFailure>,
    /// Hosts that answered this round
    pub fresh_hosts: HashSet<HostId>,
}

impl SampleOutcome {
    pub fn is_partial_failure(&self) -> bool {
        !self.failures.is_empty()
    }

    /// True when hosts were asked and none answered
    pub fn is_total_failure(&self) -> bool {
        self.fresh_hosts.is_empty() && !self.failures.is_empty()
    }
}

/// Pulls per-core utilization from every host
pub struct UsageSampler {
    fleet: Arc<FleetConfig>,
    timeout: Duration,
}

impl UsageSampler {
    pub fn new(fleet: Arc<FleetConfig>, timeout: Duration) -> Self {
        Self { fleet, timeout }
    }

    /// Sample all dynamic and stable cores on every host
    pub async fn sample(&self, agents: &HostAgents) -> SampleOutcome {
        let mut outcome = SampleOutcome::default();
        let mut tasks = JoinSet::new();

        for host in &self.fleet.hosts {
            let Some(agent) = agents.get(&host.name).cloned() else {
                outcome.failures.push(HostFailure::new(
                    host.name.clone(),
                    &TransitionError::Unreachable("no agent configured".to_string()),
                ));
                continue;
            };

            let cores = host.all_core_indices();
            let timeout = self.timeout;
            let host_id = host.name.clone();
            tasks.spawn(async move {
                let result = match tokio::time::timeout(timeout, agent.sample_usage(&cores)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransitionError::Timeout(timeout)),
                };
                (host_id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (host, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Sampling task panicked");
                    continue;
                }
            };

            match result {
                Ok(values) => {
                    let observed_at = Utc::now();
                    debug!(host = %host, cores = values.len(), "Host sampled");
                    outcome.samples.extend(values.into_iter().map(|(core, u)| {
                        UsageSample::new(CoreId::new(host.as_str(), core), u, observed_at)
                    }));
                    outcome.fresh_hosts.insert(host);
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "Failed to sample host");
                    outcome.failures.push(HostFailure::new(host, &e));
                }
            }
        }

        outcome.failures.sort_by(|a, b| a.host.cmp(&b.host));
        outcome
    }
}

/// Rolling windows for every sampled core, owned by the monitoring loop
#[derive(Debug, Clone)]
pub struct UsageHistory {
    windows: HashMap<CoreId, UsageWindow>,
    /// Settled state each window was collected under
    settled: HashMap<CoreId, CoreState>,
    window_size: usize,
}

impl UsageHistory {
    pub fn new(window_size: usize) -> Self {
        Self {
            windows: HashMap::new(),
            settled: HashMap::new(),
            window_size,
        }
    }

    /// Push fresh samples into their windows; cores of failed hosts keep
    /// their previous windows
    ///
    /// `state_of` reports each core's current state. A window restarts when
    /// its core has settled into a different state since the last sample,
    /// so samples taken before a transition never count towards the next
    /// decision.
    pub fn record<F>(&mut self, outcome: &SampleOutcome, state_of: F)
    where
        F: Fn(&CoreId) -> Option<CoreState>,
    {
        for sample in &outcome.samples {
            let id = &sample.core_id;
            let window = self
                .windows
                .entry(id.clone())
                .or_insert_with(|| UsageWindow::new(self.window_size));

            match state_of(id) {
                Some(CoreState::Transitioning) | None => {}
                Some(state) => {
                    let previous = self.settled.insert(id.clone(), state);
                    if previous.is_some_and(|p| p != state) {
                        debug!(core = %id, state = %state, "Core changed state, restarting window");
                        window.clear();
                    }
                }
            }

            window.push(sample.clone());
        }
    }

    pub fn window(&self, id: &CoreId) -> Option<&UsageWindow> {
        self.windows.get(id)
    }

    /// Immutable view for readers
    pub fn snapshot(&self, cycle: u64, outcome: &SampleOutcome) -> UsageSnapshot {
        let cores = self
            .windows
            .iter()
            .map(|(id, window)| {
                let usage = CoreUsage {
                    latest: window.latest().cloned(),
                    window: window.values(),
                    stale: !outcome.fresh_hosts.contains(&id.host),
                };
                (id.clone(), usage)
            })
            .collect();

        UsageSnapshot {
            cycle,
            collected_at: Utc::now(),
            cores,
            failed_hosts: outcome.failures.clone(),
        }
    }
}

/// Usage of one core as exposed to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreUsage {
    pub latest: Option<UsageSample>,
    /// Utilization values in the rolling window, oldest first
    pub window: Vec<f64>,
    /// The host could not be sampled in the last cycle
    pub stale: bool,
}

/// Point-in-time usage view across the fleet
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    /// Monitoring cycle that produced this view; 0 for an on-demand sample
    pub cycle: u64,
    pub collected_at: DateTime<Utc>,
    pub cores: BTreeMap<CoreId, CoreUsage>,
    pub failed_hosts: Vec<HostFailure>,
}

impl UsageSnapshot {
    /// View built from a single sampling round, outside the monitoring loop
    pub fn from_outcome(outcome: &SampleOutcome) -> Self {
        let cores = outcome
            .samples
            .iter()
            .map(|s| {
                let usage = CoreUsage {
                    latest: Some(s.clone()),
                    window: vec![s.utilization],
                    stale: false,
                };
                (s.core_id.clone(), usage)
            })
            .collect();

        Self {
            cycle: 0,
            collected_at: Utc::now(),
            cores,
            failed_hosts: outcome.failures.clone(),
        }
    }
}
