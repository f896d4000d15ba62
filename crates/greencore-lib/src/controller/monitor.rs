//! Monitoring loop
//!
//! Each iteration samples the fleet, evaluates the policy for every dynamic
//! core on hosts that answered, and runs the requested transitions
//! concurrently. The stop signal is checked between iterations only, so a
//! transition is never abandoned halfway.

use super::CoreController;
use crate::error::ControllerError;
use crate::health::components;
use crate::models::{CoreId, HostId, TargetState};
use crate::policy::{Decision, TransitionPolicy};
use crate::sampler::{UsageHistory, UsageSampler};
use std::collections::HashSet;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Summary of one monitoring iteration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub samples: usize,
    pub failed_hosts: usize,
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub conflicts: usize,
}

/// Background loop driving policy decisions; owns the rolling windows
pub struct MonitorLoop {
    controller: CoreController,
    sampler: UsageSampler,
    policy: TransitionPolicy,
    history: UsageHistory,
    cycle: u64,
}

impl MonitorLoop {
    pub fn new(controller: CoreController) -> Self {
        let config = controller.config().clone();
        let sampler = UsageSampler::new(controller.inner.fleet.clone(), config.agent_timeout);

        Self {
            sampler,
            policy: TransitionPolicy::new(config.policy),
            history: UsageHistory::new(config.window_size),
            cycle: 0,
            controller,
        }
    }

    /// Run until a shutdown signal arrives
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.controller.config().sample_interval;
        info!(interval_secs = period.as_secs(), "Starting monitoring loop");

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Shutting down monitoring loop");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.run_once().await;
                    debug!(
                        cycle = report.cycle,
                        samples = report.samples,
                        failed_hosts = report.failed_hosts,
                        transitions = report.requested,
                        succeeded = report.succeeded,
                        failed = report.failed,
                        conflicts = report.conflicts,
                        "Monitoring cycle complete"
                    );
                }
            }
        }
    }

    /// One iteration: sample, decide, transition
    ///
    /// Never fails; host and transition errors are counted in the report.
    pub async fn run_once(&mut self) -> CycleReport {
        let controller = &self.controller;
        let start = Instant::now();

        let outcome = self.sampler.sample(controller.agents()).await;
        controller
            .metrics()
            .observe_sample_latency(start.elapsed().as_secs_f64());
        for failure in &outcome.failures {
            controller
                .metrics()
                .inc_sampler_host_failure(failure.host.as_str());
        }
        controller.health().record_sample_outcome(&outcome).await;

        self.cycle += 1;
        let store = controller.store();
        self.history.record(&outcome, |id| store.get(id).ok());
        controller.publish_usage(self.history.snapshot(self.cycle, &outcome));

        let mut report = CycleReport {
            cycle: self.cycle,
            samples: outcome.samples.len(),
            failed_hosts: outcome.failures.len(),
            ..Default::default()
        };

        let requests = self.decide(&outcome.fresh_hosts);
        report.requested = requests.len();

        let mut tasks = JoinSet::new();
        for (id, target) in requests {
            let controller = controller.clone();
            tasks.spawn(async move { controller.transition(&id, target, "policy").await });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(_)) => report.succeeded += 1,
                Ok(Err(ControllerError::TransitionConflict(_))) => report.conflicts += 1,
                Ok(Err(_)) => report.failed += 1,
                Err(e) => {
                    warn!(error = %e, "Transition task panicked");
                    report.failed += 1;
                }
            }
        }

        if report.failed > 0 {
            controller
                .health()
                .set_degraded(
                    components::CONTROLLER,
                    format!("{} transition(s) failed in cycle {}", report.failed, report.cycle),
                )
                .await;
        } else {
            controller.health().set_healthy(components::CONTROLLER).await;
        }

        controller.refresh_core_counts();
        controller.metrics().inc_monitoring_cycles();
        report
    }

    /// Policy decisions for dynamic cores on hosts sampled this cycle
    fn decide(&self, fresh_hosts: &HashSet<HostId>) -> Vec<(CoreId, TargetState)> {
        let store = self.controller.store();
        let mut requests = Vec::new();

        for host in &self.controller.fleet().hosts {
            if !fresh_hosts.contains(&host.name) {
                continue;
            }
            for id in host.dynamic_cores() {
                let Some(window) = self.history.window(&id) else {
                    continue;
                };
                let state = match store.get(&id) {
                    Ok(state) => state,
                    Err(e) => {
                        warn!(core_id = %id, error = %e, "Skipping core");
                        continue;
                    }
                };

                match self.policy.evaluate(window, state) {
                    Decision::NoChange => {}
                    Decision::RequestSleep => requests.push((id, TargetState::Asleep)),
                    Decision::RequestWake => requests.push((id, TargetState::Awake)),
                }
            }
        }

        requests
    }
}
