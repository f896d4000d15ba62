//! Observability infrastructure for the controller
//!
//! Provides:
//! - Prometheus metrics (sampling latency, transition latency, core counts, outcomes)
//! - Structured JSON logging with tracing

use crate::models::{CoreId, TargetState};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

/// Outcome label values for `greencore_transitions_total`
pub mod outcome {
    pub const OK: &str = "ok";
    pub const FAILED: &str = "failed";
    pub const CONFLICT: &str = "conflict";
}

struct ControllerMetricsInner {
    sample_latency_seconds: Histogram,
    transition_latency_seconds: Histogram,
    cores_asleep: IntGauge,
    cores_awake: IntGauge,
    transitions_total: IntCounterVec,
    sampler_host_failures: IntCounterVec,
    monitoring_cycles: IntCounter,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            sample_latency_seconds: register_histogram!(
                "greencore_sample_latency_seconds",
                "Time spent sampling usage from every host",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register sample_latency_seconds"),

            transition_latency_seconds: register_histogram!(
                "greencore_transition_latency_seconds",
                "Time spent in host agent sleep/wake calls",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register transition_latency_seconds"),

            cores_asleep: register_int_gauge!(
                "greencore_cores_asleep",
                "Number of cores currently asleep"
            )
            .expect("Failed to register cores_asleep"),

            cores_awake: register_int_gauge!(
                "greencore_cores_awake",
                "Number of cores currently awake"
            )
            .expect("Failed to register cores_awake"),

            transitions_total: register_int_counter_vec!(
                "greencore_transitions_total",
                "Core transitions by target state and outcome",
                &["target", "outcome"]
            )
            .expect("Failed to register transitions_total"),

            sampler_host_failures: register_int_counter_vec!(
                "greencore_sampler_host_failures_total",
                "Hosts that could not be sampled",
                &["host"]
            )
            .expect("Failed to register sampler_host_failures_total"),

            monitoring_cycles: register_int_counter!(
                "greencore_monitoring_cycles_total",
                "Completed monitoring loop iterations"
            )
            .expect("Failed to register monitoring_cycles_total"),
        }
    }
}

/// Controller metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_sample_latency(&self, duration_secs: f64) {
        self.inner().sample_latency_seconds.observe(duration_secs);
    }

    pub fn observe_transition_latency(&self, duration_secs: f64) {
        self.inner().transition_latency_seconds.observe(duration_secs);
    }

    pub fn set_core_counts(&self, awake: i64, asleep: i64) {
        self.inner().cores_awake.set(awake);
        self.inner().cores_asleep.set(asleep);
    }

    pub fn inc_transition(&self, target: TargetState, outcome: &str) {
        self.inner()
            .transitions_total
            .with_label_values(&[target.as_str(), outcome])
            .inc();
    }

    pub fn inc_sampler_host_failure(&self, host: &str) {
        self.inner()
            .sampler_host_failures
            .with_label_values(&[host])
            .inc();
    }

    pub fn inc_monitoring_cycles(&self) {
        self.inner().monitoring_cycles.inc();
    }
}

/// Structured logger for controller lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    service: String,
}

impl StructuredLogger {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn log_startup(&self, version: &str, hosts: usize, cores: usize) {
        info!(
            event = "controller_started",
            service = %self.service,
            version = %version,
            hosts = hosts,
            cores = cores,
            "Green core controller started"
        );
    }

    pub fn log_monitoring_started(&self, interval_secs: u64) {
        info!(
            event = "monitoring_started",
            service = %self.service,
            interval_secs = interval_secs,
            "Core monitoring started"
        );
    }

    /// Log the outcome of one core transition
    pub fn log_transition(
        &self,
        core_id: &CoreId,
        target: TargetState,
        trigger: &str,
        error: Option<&str>,
    ) {
        match error {
            None => info!(
                event = "core_transition",
                service = %self.service,
                core_id = %core_id,
                target = target.as_str(),
                trigger = %trigger,
                "Core transitioned"
            ),
            Some(error) => warn!(
                event = "core_transition_failed",
                service = %self.service,
                core_id = %core_id,
                target = target.as_str(),
                trigger = %trigger,
                error = %error,
                "Core transition failed, reverted to previous state"
            ),
        }
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            service = %self.service,
            reason = %reason,
            "Green core controller shutting down"
        );
    }
}
