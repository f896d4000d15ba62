//! Core data models for the green core controller

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a compute host within the fleet
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(pub String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fleet-wide core identifier: `(host, local core index)`
///
/// Rendered as `<host>:<index>`. Parsing splits on the last `:` so
/// hosts named by IPv6 address still round-trip.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CoreId {
    pub host: HostId,
    pub core: u32,
}

impl CoreId {
    pub fn new(host: impl Into<String>, core: u32) -> Self {
        Self {
            host: HostId::new(host),
            core,
        }
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.core)
    }
}

/// Error returned when a core id string is malformed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid core id '{0}', expected <host>:<index>")]
pub struct ParseCoreIdError(pub String);

impl FromStr for CoreId {
    type Err = ParseCoreIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, core) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseCoreIdError(s.to_string()))?;
        if host.is_empty() {
            return Err(ParseCoreIdError(s.to_string()));
        }
        let core = core
            .parse::<u32>()
            .map_err(|_| ParseCoreIdError(s.to_string()))?;
        Ok(Self::new(host, core))
    }
}

impl From<CoreId> for String {
    fn from(id: CoreId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for CoreId {
    type Error = ParseCoreIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Power state of a single core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreState {
    Awake,
    Asleep,
    /// A host agent call is in flight for this core
    Transitioning,
}

impl CoreState {
    pub fn is_awake(&self) -> bool {
        matches!(self, CoreState::Awake)
    }
}

impl fmt::Display for CoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoreState::Awake => "awake",
            CoreState::Asleep => "asleep",
            CoreState::Transitioning => "transitioning",
        };
        f.write_str(s)
    }
}

/// Target of a transition; a core is never asked to become `Transitioning`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Awake,
    Asleep,
}

impl TargetState {
    /// The confirmed state a core must be in before moving to this target
    pub fn opposite(self) -> CoreState {
        match self {
            TargetState::Awake => CoreState::Asleep,
            TargetState::Asleep => CoreState::Awake,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TargetState::Awake => "awake",
            TargetState::Asleep => "asleep",
        }
    }
}

impl From<TargetState> for CoreState {
    fn from(target: TargetState) -> Self {
        match target {
            TargetState::Awake => CoreState::Awake,
            TargetState::Asleep => CoreState::Asleep,
        }
    }
}

/// One utilization observation for one core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSample {
    pub core_id: CoreId,
    /// Fraction of time busy, clamped to `[0, 1]`
    pub utilization: f64,
    pub observed_at: DateTime<Utc>,
}

impl UsageSample {
    pub fn new(core_id: CoreId, utilization: f64, observed_at: DateTime<Utc>) -> Self {
        let utilization = if utilization.is_nan() {
            0.0
        } else {
            utilization.clamp(0.0, 1.0)
        };
        Self {
            core_id,
            utilization,
            observed_at,
        }
    }
}

/// A compute host and the partition of its cores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ComputeHost {
    /// Identifier used in core ids; defaults to `ip`
    pub name: HostId,
    pub ip: String,
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// Cores eligible for sleep/wake
    pub dynamic_core_ids: Vec<u32>,
    /// Cores always kept awake
    pub stable_core_ids: Vec<u32>,
}

fn default_ssh_port() -> u16 {
    22
}

impl ComputeHost {
    pub fn new(
        ip: impl Into<String>,
        user: impl Into<String>,
        dynamic_core_ids: Vec<u32>,
        stable_core_ids: Vec<u32>,
    ) -> Self {
        let ip = ip.into();
        Self {
            name: HostId::new(ip.clone()),
            ip,
            user: user.into(),
            ssh_port: default_ssh_port(),
            dynamic_core_ids,
            stable_core_ids,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = HostId::new(name);
        self
    }

    pub fn dynamic_cores(&self) -> impl Iterator<Item = CoreId> + '_ {
        self.dynamic_core_ids
            .iter()
            .map(move |&core| CoreId::new(self.name.as_str(), core))
    }

    pub fn stable_cores(&self) -> impl Iterator<Item = CoreId> + '_ {
        self.stable_core_ids
            .iter()
            .map(move |&core| CoreId::new(self.name.as_str(), core))
    }

    /// All local core indices, dynamic first
    pub fn all_core_indices(&self) -> Vec<u32> {
        self.dynamic_core_ids
            .iter()
            .chain(self.stable_core_ids.iter())
            .copied()
            .collect()
    }

    pub fn is_dynamic(&self, core: u32) -> bool {
        self.dynamic_core_ids.contains(&core)
    }
}

/// Static description of the fleet, consumed once at startup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    pub hosts: Vec<ComputeHost>,
}

impl FleetConfig {
    pub fn new(hosts: Vec<ComputeHost>) -> Self {
        Self { hosts }
    }

    pub fn host(&self, id: &HostId) -> Option<&ComputeHost> {
        self.hosts.iter().find(|h| &h.name == id)
    }

    pub fn core_count(&self) -> usize {
        self.hosts
            .iter()
            .map(|h| h.dynamic_core_ids.len() + h.stable_core_ids.len())
            .sum()
    }

    /// Check the partition invariants: unique host names, and every core
    /// index in exactly one of the two sets of its host
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.hosts.is_empty() {
            anyhow::bail!("fleet has no compute hosts");
        }

        let mut names = std::collections::HashSet::new();
        for host in &self.hosts {
            if !names.insert(&host.name) {
                anyhow::bail!("duplicate compute host '{}'", host.name);
            }

            let mut seen = std::collections::HashSet::new();
            for core in host.all_core_indices() {
                if !seen.insert(core) {
                    anyhow::bail!(
                        "core {} listed more than once on host '{}'",
                        core,
                        host.name
                    );
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_id_display_and_parse() {
        let id = CoreId::new("10.0.0.1", 3);
        assert_eq!(id.to_string(), "10.0.0.1:3");
        assert_eq!("10.0.0.1:3".parse::<CoreId>().unwrap(), id);

        let v6: CoreId = "fe80::1:7".parse().unwrap();
        assert_eq!(v6.host.as_str(), "fe80::1");
        assert_eq!(v6.core, 7);
    }

    #[test]
    fn test_core_id_parse_rejects_garbage() {
        assert!("nohost".parse::<CoreId>().is_err());
        assert!(":3".parse::<CoreId>().is_err());
        assert!("a:-1".parse::<CoreId>().is_err());
    }

    #[test]
    fn test_core_id_serializes_as_string() {
        let json = serde_json::to_string(&CoreId::new("a", 0)).unwrap();
        assert_eq!(json, "\"a:0\"");
    }

    #[test]
    fn test_core_id_ordering_groups_by_host() {
        let mut ids = vec![CoreId::new("b", 0), CoreId::new("a", 1), CoreId::new("a", 0)];
        ids.sort();
        assert_eq!(
            ids,
            vec![CoreId::new("a", 0), CoreId::new("a", 1), CoreId::new("b", 0)]
        );
    }

    #[test]
    fn test_usage_sample_clamps() {
        let now = Utc::now();
        assert_eq!(UsageSample::new(CoreId::new("a", 0), 1.7, now).utilization, 1.0);
        assert_eq!(UsageSample::new(CoreId::new("a", 0), -0.2, now).utilization, 0.0);
        assert_eq!(UsageSample::new(CoreId::new("a", 0), f64::NAN, now).utilization, 0.0);
    }

    #[test]
    fn test_fleet_validate_rejects_overlap() {
        let fleet = FleetConfig::new(vec![ComputeHost::new("a", "u", vec![0, 1], vec![1])]);
        assert!(fleet.validate().is_err());
    }

    #[test]
    fn test_fleet_validate_rejects_duplicate_hosts() {
        let fleet = FleetConfig::new(vec![
            ComputeHost::new("a", "u", vec![0], vec![]),
            ComputeHost::new("a", "u", vec![1], vec![]),
        ]);
        assert!(fleet.validate().is_err());
    }

    #[test]
    fn test_fleet_validate_accepts_disjoint_sets() {
        let fleet = FleetConfig::new(vec![
            ComputeHost::new("a", "u", vec![2, 3], vec![0, 1]),
            ComputeHost::new("b", "u", vec![0], vec![]),
        ]);
        assert!(fleet.validate().is_ok());
        assert_eq!(fleet.core_count(), 5);
    }
}
