//! Green core controller library
//!
//! This crate provides the core functionality for:
//! - Sampling per-core utilization across a fleet of compute hosts
//! - Deciding which cores may sleep or must wake (threshold policy with hysteresis)
//! - Driving sleep/wake transitions through host agents with CAS-guarded state
//! - Health checks and observability

pub mod agent;
pub mod controller;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod policy;
pub mod sampler;
pub mod store;

pub use agent::{create_agents, AgentKind, HostAgent, HostAgents, SimulatedHostAgent, SshHostAgent};
pub use controller::{
    ControllerConfig, CoreController, CoreControllerBuilder, CoreStatus, CycleReport,
    FleetStatus, MonitorLoop, SleepStatus, TransitionFailure,
};
pub use error::{ControllerError, HostFailure, StoreError, TransitionError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ControllerMetrics, StructuredLogger};
pub use policy::{Decision, PolicyConfig, TransitionPolicy};
pub use sampler::{CoreUsage, UsageSnapshot};
pub use store::CoreStateStore;
