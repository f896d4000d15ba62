//! SSH-backed host agent
//!
//! Runs commands through the system `ssh` client. Cores are put to sleep
//! by offlining them through sysfs, and utilization is derived from the
//! per-cpu counters in `/proc/stat`.

use super::{async_trait, HostAgent};
use crate::error::TransitionError;
use crate::models::{ComputeHost, CoreId, HostId, TargetState};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// `ssh` exits with 255 when the connection itself failed
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Cumulative per-cpu jiffies from `/proc/stat`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

impl CpuTimes {
    /// Busy fraction between `prev` and `self`; without a previous reading
    /// the fraction since boot is used
    pub fn utilization_since(&self, prev: Option<&CpuTimes>) -> f64 {
        let (busy, total) = match prev {
            Some(p) if self.total > p.total => (
                self.busy.saturating_sub(p.busy),
                self.total - p.total,
            ),
            Some(_) => return 0.0,
            None => (self.busy, self.total),
        };
        if total == 0 {
            return 0.0;
        }
        busy as f64 / total as f64
    }
}

/// Parse the `cpuN` lines of `/proc/stat`
///
/// Columns are `user nice system idle iowait irq softirq steal ...`; idle
/// and iowait count as not busy. Offline cpus have no line.
pub fn parse_proc_stat(content: &str) -> HashMap<u32, CpuTimes> {
    let mut result = HashMap::new();

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let Some(label) = parts.next() else {
            continue;
        };
        let Some(index) = label.strip_prefix("cpu").and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };

        let values: Vec<u64> = parts.filter_map(|v| v.parse().ok()).collect();
        if values.len() < 4 {
            continue;
        }

        // guest columns are already included in user/nice
        let total: u64 = values.iter().take(8).sum();
        let idle = values[3] + values.get(4).copied().unwrap_or(0);
        result.insert(
            index,
            CpuTimes {
                busy: total.saturating_sub(idle),
                total,
            },
        );
    }

    result
}

/// Per-core utilization between two `/proc/stat` readings
///
/// An offline cpu has no counters of its own, so it reports the host's
/// pressure instead: the mean utilization of the cpus that are online.
pub fn usage_from_readings(
    cores: &[u32],
    current: &HashMap<u32, CpuTimes>,
    previous: &HashMap<u32, CpuTimes>,
) -> Vec<(u32, f64)> {
    let online: Vec<f64> = current
        .iter()
        .map(|(cpu, now)| now.utilization_since(previous.get(cpu)))
        .collect();
    let pressure = if online.is_empty() {
        0.0
    } else {
        (online.iter().sum::<f64>() / online.len() as f64).clamp(0.0, 1.0)
    };

    cores
        .iter()
        .map(|core| {
            let value = current
                .get(core)
                .map(|now| now.utilization_since(previous.get(core)))
                .unwrap_or(pressure);
            (*core, value)
        })
        .collect()
}

/// Host agent executing commands over SSH
pub struct SshHostAgent {
    host: HostId,
    destination: String,
    port: u16,
    connect_timeout: Duration,
    /// Last `/proc/stat` reading per cpu, for delta computation
    previous: Mutex<HashMap<u32, CpuTimes>>,
}

impl SshHostAgent {
    pub fn new(host: &ComputeHost, connect_timeout: Duration) -> Self {
        Self {
            host: host.name.clone(),
            destination: format!("{}@{}", host.user, host.ip),
            port: host.ssh_port,
            connect_timeout,
            previous: Mutex::new(HashMap::new()),
        }
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-p")
            .arg(self.port.to_string())
            .args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.connect_timeout.as_secs().max(1)
            ))
            .arg(&self.destination)
            .arg(remote)
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, remote: &str) -> Result<String, TransitionError> {
        debug!(host = %self.host, command = remote, "Running remote command");

        let output = self
            .command(remote)
            .output()
            .await
            .map_err(|e| TransitionError::Unreachable(format!("failed to spawn ssh: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            Some(SSH_CONNECTION_FAILURE) => Err(TransitionError::Unreachable(stderr)),
            Some(code) => Err(TransitionError::Rejected(format!(
                "exit status {code}: {stderr}"
            ))),
            None => Err(TransitionError::Unreachable(
                "ssh terminated by signal".to_string(),
            )),
        }
    }
}

#[async_trait]
impl HostAgent for SshHostAgent {
    fn host(&self) -> &HostId {
        &self.host
    }

    async fn sample_usage(&self, cores: &[u32]) -> Result<Vec<(u32, f64)>, TransitionError> {
        let stat = self.run("cat /proc/stat").await?;
        let current = parse_proc_stat(&stat);

        let mut previous = self.previous.lock().unwrap_or_else(|e| e.into_inner());
        let usage = usage_from_readings(cores, &current, &previous);
        *previous = current;

        Ok(usage)
    }

    async fn set_core_state(
        &self,
        core: &CoreId,
        target: TargetState,
    ) -> Result<(), TransitionError> {
        let online = match target {
            TargetState::Awake => 1,
            TargetState::Asleep => 0,
        };
        let remote = format!(
            "echo {online} | sudo -n tee /sys/devices/system/cpu/cpu{}/online > /dev/null",
            core.core
        );
        self.run(&remote).await.map(|_| ())
    }
}
