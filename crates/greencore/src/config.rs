//! Service configuration
//!
//! Read from an optional YAML file (path in `GREENCORE_CONFIG`, default
//! `config.yaml`) and overridden by `GREENCORE_`-prefixed environment
//! variables, e.g. `GREENCORE_HOST_PORT=9000`.

use anyhow::{Context, Result};
use greencore_lib::{AgentKind, ComputeHost, ControllerConfig, FleetConfig, HostId, PolicyConfig};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const CONFIG_PATH_ENV: &str = "GREENCORE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// One entry of `compute-hosts`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HostEntry {
    /// Name used in core ids; defaults to `ip`
    #[serde(default)]
    pub name: Option<String>,
    pub ip: String,
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub dynamic_core_ids: Vec<u32>,
    #[serde(default)]
    pub stable_core_ids: Vec<u32>,
}

/// Service configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceConfig {
    /// Address the HTTP API binds to
    #[serde(default = "default_host_ip")]
    pub host_ip: String,

    #[serde(default = "default_host_port")]
    pub host_port: u16,

    #[serde(default)]
    pub compute_hosts: Vec<HostEntry>,

    /// Seconds between monitoring cycles
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,

    /// Upper bound in seconds for a single host agent call
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,

    #[serde(default = "default_sleep_threshold")]
    pub sleep_threshold: f64,

    #[serde(default = "default_wake_threshold")]
    pub wake_threshold: f64,

    #[serde(default = "default_window_size")]
    pub window_size: usize,

    #[serde(default)]
    pub agent: AgentKind,
}

fn default_host_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_host_port() -> u16 {
    8080
}

fn default_ssh_port() -> u16 {
    22
}

fn default_sample_interval() -> u64 {
    10
}

fn default_agent_timeout() -> u64 {
    5
}

fn default_sleep_threshold() -> f64 {
    greencore_lib::policy::DEFAULT_SLEEP_THRESHOLD
}

fn default_wake_threshold() -> f64 {
    greencore_lib::policy::DEFAULT_WAKE_THRESHOLD
}

fn default_window_size() -> usize {
    greencore_lib::sampler::DEFAULT_WINDOW_SIZE
}

impl ServiceConfig {
    /// Load from the file named by `GREENCORE_CONFIG` and the environment
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// Load from `path` (if it exists) and the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix("GREENCORE")
                    .separator("__")
                    .convert_case(config::Case::Kebab),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        let parsed: ServiceConfig = config
            .try_deserialize()
            .context("Invalid service configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Reject configurations the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        self.fleet().validate()?;
        self.controller_config().validate()?;
        for host in &self.compute_hosts {
            if host.ip.is_empty() || host.user.is_empty() {
                anyhow::bail!("compute host entries need both ip and user");
            }
        }
        Ok(())
    }

    pub fn fleet(&self) -> FleetConfig {
        FleetConfig::new(
            self.compute_hosts
                .iter()
                .map(|entry| {
                    let mut host = ComputeHost::new(
                        entry.ip.clone(),
                        entry.user.clone(),
                        entry.dynamic_core_ids.clone(),
                        entry.stable_core_ids.clone(),
                    );
                    if let Some(name) = &entry.name {
                        host.name = HostId::new(name.clone());
                    }
                    host.ssh_port = entry.ssh_port;
                    host
                })
                .collect(),
        )
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            sample_interval: Duration::from_secs(self.sample_interval_secs),
            agent_timeout: Duration::from_secs(self.agent_timeout_secs),
            window_size: self.window_size,
            policy: PolicyConfig {
                sleep_threshold: self.sleep_threshold,
                wake_threshold: self.wake_threshold,
            },
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host_ip, self.host_port)
    }
}
