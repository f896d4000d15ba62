//! Host agents: the capability to read usage from and toggle cores on a host
//!
//! The controller never talks to a host directly. Each configured host is
//! backed by one [`HostAgent`], either the SSH agent used in production or
//! the in-memory simulation used by tests and local runs.

mod simulated;
mod ssh;

pub use simulated::SimulatedHostAgent;
pub use ssh::{parse_proc_stat, CpuTimes, SshHostAgent};

use crate::error::TransitionError;
use crate::models::{CoreId, FleetConfig, HostId, TargetState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use async_trait::async_trait;

/// Agents keyed by the host they drive
pub type HostAgents = HashMap<HostId, Arc<dyn HostAgent>>;

/// Remote operations the controller needs from a host
///
/// `set_core_state` must be idempotent: asking for the state a core is
/// already in succeeds without side effects.
#[async_trait]
pub trait HostAgent: Send + Sync {
    /// Host this agent drives
    fn host(&self) -> &HostId;

    /// Current utilization in `[0, 1]` for each requested local core index
    async fn sample_usage(&self, cores: &[u32]) -> Result<Vec<(u32, f64)>, TransitionError>;

    /// Put a core to sleep or wake it up
    async fn set_core_state(&self, core: &CoreId, target: TargetState)
        -> Result<(), TransitionError>;
}

/// Which agent implementation to build for the fleet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    #[default]
    Ssh,
    Simulated,
}

/// Build one agent per configured host
pub fn create_agents(fleet: &FleetConfig, kind: AgentKind, connect_timeout: Duration) -> HostAgents {
    fleet
        .hosts
        .iter()
        .map(|host| {
            let agent: Arc<dyn HostAgent> = match kind {
                AgentKind::Ssh => Arc::new(SshHostAgent::new(host, connect_timeout)),
                AgentKind::Simulated => Arc::new(SimulatedHostAgent::new(host.name.clone())),
            };
            (host.name.clone(), agent)
        })
        .collect()
}
