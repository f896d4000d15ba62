//! In-memory host agent
//!
//! Lets tests and local runs drive the controller without real hosts:
//! usage can be injected per core, the host can be made unreachable, and
//! transitions can be delayed or forced to fail.

use super::{async_trait, HostAgent};
use crate::error::TransitionError;
use crate::models::{CoreId, HostId, TargetState};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Utilization reported by an awake core with nothing injected
const DEFAULT_UTILIZATION: f64 = 0.5;

pub struct SimulatedHostAgent {
    host: HostId,
    /// Injected utilization, sticky until changed
    usage: DashMap<u32, f64>,
    /// Cores this host believes are offline
    asleep: DashMap<u32, ()>,
    default_utilization: f64,
    unreachable: AtomicBool,
    transition_failure: Mutex<Option<TransitionError>>,
    transition_delay: Mutex<Duration>,
    transition_calls: AtomicUsize,
    sample_calls: AtomicUsize,
}

impl SimulatedHostAgent {
    pub fn new(host: HostId) -> Self {
        Self {
            host,
            usage: DashMap::new(),
            asleep: DashMap::new(),
            default_utilization: DEFAULT_UTILIZATION,
            unreachable: AtomicBool::new(false),
            transition_failure: Mutex::new(None),
            transition_delay: Mutex::new(Duration::ZERO),
            transition_calls: AtomicUsize::new(0),
            sample_calls: AtomicUsize::new(0),
        }
    }

    /// Utilization reported by awake cores without injected usage
    pub fn with_default_utilization(mut self, utilization: f64) -> Self {
        self.default_utilization = utilization;
        self
    }

    /// Report `utilization` for `core` from now on
    pub fn set_usage(&self, core: u32, utilization: f64) {
        self.usage.insert(core, utilization);
    }

    pub fn clear_usage(&self, core: u32) {
        self.usage.remove(&core);
    }

    /// Make every call fail with `Unreachable`
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make transitions fail with `error` until cleared with `None`
    pub fn fail_transitions(&self, error: Option<TransitionError>) {
        *self
            .transition_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = error;
    }

    /// Delay every transition call
    pub fn set_transition_delay(&self, delay: Duration) {
        *self
            .transition_delay
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Whether this host has `core` offline
    pub fn is_core_asleep(&self, core: u32) -> bool {
        self.asleep.contains_key(&core)
    }

    pub fn transition_calls(&self) -> usize {
        self.transition_calls.load(Ordering::SeqCst)
    }

    pub fn sample_calls(&self) -> usize {
        self.sample_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), TransitionError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransitionError::Unreachable(format!(
                "simulated host {} is down",
                self.host
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl HostAgent for SimulatedHostAgent {
    fn host(&self) -> &HostId {
        &self.host
    }

    async fn sample_usage(&self, cores: &[u32]) -> Result<Vec<(u32, f64)>, TransitionError> {
        self.sample_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;

        Ok(cores
            .iter()
            .map(|&core| {
                let value = match self.usage.get(&core) {
                    Some(injected) => *injected,
                    None if self.is_core_asleep(core) => 0.0,
                    None => self.default_utilization,
                };
                (core, value)
            })
            .collect())
    }

    async fn set_core_state(
        &self,
        core: &CoreId,
        target: TargetState,
    ) -> Result<(), TransitionError> {
        self.transition_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self
            .transition_delay
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.check_reachable()?;
        let failure = self
            .transition_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(err) = failure {
            return Err(err);
        }

        match target {
            TargetState::Asleep => {
                self.asleep.insert(core.core, ());
            }
            TargetState::Awake => {
                self.asleep.remove(&core.core);
            }
        }
        Ok(())
    }
}
