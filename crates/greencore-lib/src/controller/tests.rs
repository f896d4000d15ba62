//! Controller scenarios driven through simulated hosts
//!
//! Monitoring cycles are stepped by hand with `MonitorLoop::run_once`, so
//! these tests do not depend on wall-clock intervals.

use super::*;
use crate::agent::{HostAgent, SimulatedHostAgent};
use crate::models::{ComputeHost, HostId};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    controller: CoreController,
    a: Arc<SimulatedHostAgent>,
    b: Arc<SimulatedHostAgent>,
}

/// Host `a` has dynamic cores 0 and 1 plus stable core 2; host `b` has
/// dynamic core 0
fn fixture() -> Fixture {
    fixture_with_timeout(Duration::from_secs(1))
}

fn fixture_with_timeout(agent_timeout: Duration) -> Fixture {
    let fleet = FleetConfig::new(vec![
        ComputeHost::new("10.0.0.1", "ops", vec![0, 1], vec![2]).with_name("a"),
        ComputeHost::new("10.0.0.2", "ops", vec![0], vec![]).with_name("b"),
    ]);

    let a = Arc::new(SimulatedHostAgent::new(HostId::new("a")));
    let b = Arc::new(SimulatedHostAgent::new(HostId::new("b")));
    let mut agents = HostAgents::new();
    agents.insert(HostId::new("a"), a.clone() as Arc<dyn HostAgent>);
    agents.insert(HostId::new("b"), b.clone() as Arc<dyn HostAgent>);

    let controller = CoreController::builder()
        .fleet(fleet)
        .agents(agents)
        .agent_timeout(agent_timeout)
        .build()
        .unwrap();

    Fixture { controller, a, b }
}

fn a(core: u32) -> CoreId {
    CoreId::new("a", core)
}

fn b(core: u32) -> CoreId {
    CoreId::new("b", core)
}

fn state(controller: &CoreController, id: &CoreId) -> CoreState {
    controller.store().get(id).unwrap()
}

#[tokio::test]
async fn test_all_cores_start_awake() {
    let f = fixture();
    let status = f.controller.fleet_status();

    assert_eq!(status.cores.len(), 4);
    assert!(status.cores.values().all(|s| *s == CoreState::Awake));
    assert!(status.is_awake);
    assert!(!status.any_asleep);
    assert!(!status.monitoring);
    assert!(f.controller.sleeping_core_ids().is_empty());
}

#[tokio::test]
async fn test_idle_core_sleeps_then_wakes_under_load() {
    let f = fixture();
    let mut monitor = MonitorLoop::new(f.controller.clone());
    f.a.set_usage(0, 0.0);

    monitor.run_once().await;
    monitor.run_once().await;
    assert_eq!(state(&f.controller, &a(0)), CoreState::Awake);

    let report = monitor.run_once().await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(state(&f.controller, &a(0)), CoreState::Asleep);
    assert!(f.a.is_core_asleep(0));
    assert_eq!(f.controller.sleeping_core_ids(), vec![a(0)]);

    f.a.set_usage(0, 0.5);
    monitor.run_once().await;
    assert_eq!(state(&f.controller, &a(0)), CoreState::Awake);
    assert!(!f.a.is_core_asleep(0));
    assert!(f.controller.sleeping_core_ids().is_empty());
}

#[tokio::test]
async fn test_mid_band_usage_never_transitions() {
    let f = fixture();
    let mut monitor = MonitorLoop::new(f.controller.clone());
    f.a.set_usage(0, 0.10);

    for _ in 0..6 {
        let report = monitor.run_once().await;
        assert_eq!(report.requested, 0);
    }

    assert_eq!(state(&f.controller, &a(0)), CoreState::Awake);
    assert_eq!(f.a.transition_calls(), 0);
}

#[tokio::test]
async fn test_single_dip_does_not_sleep() {
    let f = fixture();
    let mut monitor = MonitorLoop::new(f.controller.clone());

    f.a.set_usage(0, 0.0);
    monitor.run_once().await;
    monitor.run_once().await;
    f.a.set_usage(0, 0.10);
    monitor.run_once().await;
    f.a.set_usage(0, 0.0);
    monitor.run_once().await;

    assert_eq!(state(&f.controller, &a(0)), CoreState::Awake);
}

#[tokio::test]
async fn test_stable_cores_are_never_put_to_sleep() {
    let f = fixture();
    let mut monitor = MonitorLoop::new(f.controller.clone());
    f.a.set_usage(2, 0.0);

    for _ in 0..5 {
        monitor.run_once().await;
    }

    assert_eq!(state(&f.controller, &a(2)), CoreState::Awake);
    assert!(!f.a.is_core_asleep(2));

    // Still sampled for reporting
    let usage = f.controller.core_usage().await.unwrap();
    assert_eq!(usage.cores[&a(2)].latest.as_ref().unwrap().utilization, 0.0);
}

#[tokio::test]
async fn test_unreachable_host_does_not_block_other_hosts() {
    let f = fixture();
    let mut monitor = MonitorLoop::new(f.controller.clone());
    f.a.set_usage(0, 0.0);
    f.b.set_usage(0, 0.0);
    f.b.set_unreachable(true);

    let mut last = CycleReport::default();
    for _ in 0..3 {
        last = monitor.run_once().await;
    }

    assert_eq!(last.failed_hosts, 1);
    assert_eq!(state(&f.controller, &a(0)), CoreState::Asleep);
    assert_eq!(state(&f.controller, &b(0)), CoreState::Awake);

    let usage = f.controller.core_usage().await.unwrap();
    assert_eq!(usage.failed_hosts.len(), 1);
    assert!(!usage.cores[&a(0)].stale);
    // b never answered, so it has no window yet
    assert!(!usage.cores.contains_key(&b(0)));

    let health = f.controller.health().health().await;
    assert_eq!(
        health.components["host:b"].status,
        crate::health::ComponentStatus::Degraded
    );
}

#[tokio::test]
async fn test_stale_host_keeps_previous_window() {
    let f = fixture();
    let mut monitor = MonitorLoop::new(f.controller.clone());
    f.b.set_usage(0, 0.0);

    monitor.run_once().await;
    monitor.run_once().await;
    f.b.set_unreachable(true);
    monitor.run_once().await;
    monitor.run_once().await;

    // Two fresh zero samples and no decision while stale
    assert_eq!(state(&f.controller, &b(0)), CoreState::Awake);
    let usage = f.controller.core_usage().await.unwrap();
    assert!(usage.cores[&b(0)].stale);
    assert_eq!(usage.cores[&b(0)].window, vec![0.0, 0.0]);

    f.b.set_unreachable(false);
    monitor.run_once().await;
    assert_eq!(state(&f.controller, &b(0)), CoreState::Asleep);
}

#[tokio::test]
async fn test_failed_policy_transition_reverts_and_retries() {
    let f = fixture();
    let mut monitor = MonitorLoop::new(f.controller.clone());
    f.a.set_usage(1, 0.0);
    f.a.fail_transitions(Some(TransitionError::Rejected("core busy".into())));

    monitor.run_once().await;
    monitor.run_once().await;
    let report = monitor.run_once().await;

    assert_eq!(report.failed, 1);
    assert_eq!(state(&f.controller, &a(1)), CoreState::Awake);
    let failure = &f.controller.fleet_status().failures[&a(1)];
    assert_eq!(failure.kind, "rejected");
    assert_eq!(failure.target, TargetState::Asleep);

    // Next iteration tries again and clears the failure
    f.a.fail_transitions(None);
    let report = monitor.run_once().await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(state(&f.controller, &a(1)), CoreState::Asleep);
    assert!(f.controller.fleet_status().failures.is_empty());
}

#[tokio::test]
async fn test_core_switched_awake_needs_a_fresh_idle_window() {
    let f = fixture();
    let mut monitor = MonitorLoop::new(f.controller.clone());
    f.a.set_usage(0, 0.0);

    for _ in 0..3 {
        monitor.run_once().await;
    }
    assert_eq!(state(&f.controller, &a(0)), CoreState::Asleep);

    // Still idle, but an operator wants it back
    let next = f.controller.switch(&a(0)).await.unwrap();
    assert_eq!(next, CoreState::Awake);

    let report = monitor.run_once().await;
    assert_eq!(report.requested, 0);
    assert_eq!(state(&f.controller, &a(0)), CoreState::Awake);
    let usage = f.controller.core_usage().await.unwrap();
    assert_eq!(usage.cores[&a(0)].window, vec![0.0]);

    monitor.run_once().await;
    assert_eq!(state(&f.controller, &a(0)), CoreState::Awake);

    // A full window of idle samples since the switch
    let report = monitor.run_once().await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(state(&f.controller, &a(0)), CoreState::Asleep);
}

#[tokio::test]
async fn test_loop_survives_total_sampling_failure() {
    let f = fixture();
    let mut monitor = MonitorLoop::new(f.controller.clone());
    f.a.set_unreachable(true);
    f.b.set_unreachable(true);

    let report = monitor.run_once().await;
    assert_eq!(report.failed_hosts, 2);
    assert_eq!(report.samples, 0);
    assert_eq!(
        f.controller.core_usage().await.unwrap_err(),
        ControllerError::SamplerUnavailable
    );

    f.a.set_unreachable(false);
    let report = monitor.run_once().await;
    assert_eq!(report.failed_hosts, 1);
    assert!(f.controller.core_usage().await.is_ok());
}

#[tokio::test]
async fn test_switch_toggles_core() {
    let f = fixture();

    let next = f.controller.switch(&a(1)).await.unwrap();
    assert_eq!(next, CoreState::Asleep);
    assert!(f.a.is_core_asleep(1));
    assert_eq!(f.controller.sleeping_core_ids(), vec![a(1)]);

    let next = f.controller.switch(&a(1)).await.unwrap();
    assert_eq!(next, CoreState::Awake);
    assert!(!f.a.is_core_asleep(1));
}

#[tokio::test]
async fn test_switch_unknown_core_leaves_store_unchanged() {
    let f = fixture();
    let before = f.controller.store().snapshot();

    let err = f.controller.switch(&CoreId::new("c", 0)).await.unwrap_err();
    assert_eq!(err, ControllerError::UnknownCore(CoreId::new("c", 0)));
    assert!(err.is_client_error());

    let err = f.controller.switch(&a(9)).await.unwrap_err();
    assert_eq!(err, ControllerError::UnknownCore(a(9)));

    assert_eq!(f.controller.store().snapshot(), before);
    assert_eq!(f.a.transition_calls(), 0);
}

#[tokio::test]
async fn test_switch_refuses_stable_core() {
    let f = fixture();
    let err = f.controller.switch(&a(2)).await.unwrap_err();

    assert_eq!(err, ControllerError::PinnedCore(a(2)));
    assert_eq!(state(&f.controller, &a(2)), CoreState::Awake);
}

#[tokio::test]
async fn test_switch_failure_reverts_to_prior_state() {
    let f = fixture();
    f.b.set_unreachable(true);

    let err = f.controller.switch(&b(0)).await.unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Transition {
            source: TransitionError::Unreachable(_),
            ..
        }
    ));
    assert_eq!(state(&f.controller, &b(0)), CoreState::Awake);
    assert_eq!(f.controller.fleet_status().failures[&b(0)].kind, "unreachable");
}

#[tokio::test]
async fn test_switch_times_out_slow_agent() {
    let f = fixture_with_timeout(Duration::from_millis(50));
    f.a.set_transition_delay(Duration::from_millis(500));

    let err = f.controller.switch(&a(0)).await.unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Transition {
            source: TransitionError::Timeout(_),
            ..
        }
    ));
    assert_eq!(state(&f.controller, &a(0)), CoreState::Awake);
}

#[tokio::test]
async fn test_concurrent_switch_reports_conflict() {
    let f = fixture();
    f.a.set_transition_delay(Duration::from_millis(200));

    let first = {
        let controller = f.controller.clone();
        tokio::spawn(async move { controller.switch(&a(0)).await })
    };

    // Wait for the first switch to claim the core
    let deadline = Instant::now() + Duration::from_secs(2);
    while state(&f.controller, &a(0)) != CoreState::Transitioning {
        assert!(Instant::now() < deadline, "first switch never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let status = f.controller.core_status(&a(0)).unwrap();
    assert_eq!(status.state, CoreState::Transitioning);
    assert!(!status.is_awake);

    let err = f.controller.switch(&a(0)).await.unwrap_err();
    assert_eq!(err, ControllerError::TransitionConflict(a(0)));

    assert_eq!(first.await.unwrap().unwrap(), CoreState::Asleep);
    assert_eq!(state(&f.controller, &a(0)), CoreState::Asleep);
    assert_eq!(f.a.transition_calls(), 1);
}

#[tokio::test]
async fn test_policy_transition_loses_to_inflight_switch() {
    let f = fixture();
    f.a.set_transition_delay(Duration::from_millis(200));

    let switch = {
        let controller = f.controller.clone();
        tokio::spawn(async move { controller.switch(&a(0)).await })
    };
    let deadline = Instant::now() + Duration::from_secs(2);
    while state(&f.controller, &a(0)) != CoreState::Transitioning {
        assert!(Instant::now() < deadline, "switch never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let err = f
        .controller
        .transition(&a(0), TargetState::Asleep, "policy")
        .await
        .unwrap_err();
    assert_eq!(err, ControllerError::TransitionConflict(a(0)));

    switch.await.unwrap().unwrap();
    assert_eq!(state(&f.controller, &a(0)), CoreState::Asleep);
}

#[tokio::test]
async fn test_is_asleep_per_core_and_fleet() {
    let f = fixture();
    f.controller.switch(&b(0)).await.unwrap();

    match f.controller.is_asleep(None).unwrap() {
        SleepStatus::Fleet(status) => {
            assert!(status.any_asleep);
            assert!(!status.is_awake);
            assert_eq!(status.cores[&b(0)], CoreState::Asleep);
        }
        other => panic!("expected fleet status, got {other:?}"),
    }

    match f.controller.is_asleep(Some(&a(0))).unwrap() {
        SleepStatus::Core(status) => {
            assert_eq!(status.state, CoreState::Awake);
            assert!(status.is_awake);
        }
        other => panic!("expected core status, got {other:?}"),
    }

    assert_eq!(
        f.controller.is_asleep(Some(&a(7))).unwrap_err(),
        ControllerError::UnknownCore(a(7))
    );
}

#[tokio::test]
async fn test_core_usage_before_monitoring_samples_on_demand() {
    let f = fixture();
    f.a.set_usage(1, 0.3);

    let usage = f.controller.core_usage().await.unwrap();
    assert_eq!(usage.cycle, 0);
    assert_eq!(usage.cores.len(), 4);
    assert_eq!(usage.cores[&a(1)].latest.as_ref().unwrap().utilization, 0.3);
}

#[tokio::test]
async fn test_core_usage_fails_when_every_host_is_down() {
    let f = fixture();
    f.a.set_unreachable(true);
    f.b.set_unreachable(true);

    assert_eq!(
        f.controller.core_usage().await.unwrap_err(),
        ControllerError::SamplerUnavailable
    );
}

#[tokio::test]
async fn test_core_usage_does_not_mutate_state() {
    let f = fixture();
    f.a.set_usage(0, 0.0);
    let before = f.controller.store().snapshot();

    for _ in 0..4 {
        f.controller.core_usage().await.unwrap();
    }

    assert_eq!(f.controller.store().snapshot(), before);
    assert_eq!(f.a.transition_calls(), 0);
}

#[tokio::test]
async fn test_core_usage_reports_rolling_window() {
    let f = fixture();
    let mut monitor = MonitorLoop::new(f.controller.clone());
    for u in [0.2, 0.3, 0.4, 0.6] {
        f.a.set_usage(1, u);
        monitor.run_once().await;
    }

    let usage = f.controller.core_usage().await.unwrap();
    assert_eq!(usage.cycle, 4);
    assert_eq!(usage.cores[&a(1)].window, vec![0.3, 0.4, 0.6]);
    assert_eq!(usage.cores[&a(1)].latest.as_ref().unwrap().utilization, 0.6);
}

#[tokio::test]
async fn test_begin_is_idempotent() {
    let fleet = FleetConfig::new(vec![ComputeHost::new("h", "ops", vec![0], vec![])]);
    let agent = Arc::new(SimulatedHostAgent::new(HostId::new("h")));
    let mut agents = HostAgents::new();
    agents.insert(HostId::new("h"), agent.clone() as Arc<dyn HostAgent>);

    let controller = CoreController::builder()
        .fleet(fleet)
        .agents(agents)
        .sample_interval(Duration::from_secs(3600))
        .build()
        .unwrap();

    assert!(controller.begin());
    assert!(!controller.begin());
    assert!(controller.is_monitoring());

    // The first tick fires immediately; one loop means one sample per hour
    let deadline = Instant::now() + Duration::from_secs(2);
    while agent.sample_calls() == 0 {
        assert!(Instant::now() < deadline, "monitoring loop never sampled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(agent.sample_calls(), 1);

    controller.stop().await;
    assert!(!controller.is_monitoring());

    // Restartable after a stop
    assert!(controller.begin());
    assert!(controller.is_monitoring());
    controller.stop().await;
}

#[tokio::test]
async fn test_begin_racing_stop_stays_monitoring() {
    let f = fixture();

    for _ in 0..20 {
        assert!(f.controller.begin());
        let stopping = {
            let controller = f.controller.clone();
            tokio::spawn(async move { controller.stop().await })
        };
        tokio::task::yield_now().await;
        let restarted = f.controller.begin();
        stopping.await.unwrap();

        // Whichever order the two ran in, the flag matches the loop handle
        let running = f.controller.inner.monitor.lock().unwrap().is_some();
        assert_eq!(f.controller.is_monitoring(), running);
        if restarted {
            assert!(f.controller.is_monitoring());
        }
        f.controller.stop().await;
        assert!(!f.controller.is_monitoring());
    }
}

#[tokio::test]
async fn test_stop_without_begin_is_safe() {
    let f = fixture();
    f.controller.stop().await;
    assert!(!f.controller.is_monitoring());
}

#[test]
fn test_builder_requires_agent_per_host() {
    let fleet = FleetConfig::new(vec![ComputeHost::new("h", "ops", vec![0], vec![])]);
    let result = CoreController::builder()
        .fleet(fleet)
        .agents(HostAgents::new())
        .build();
    assert!(result.is_err());
}

#[test]
fn test_builder_rejects_inverted_thresholds() {
    let fleet = FleetConfig::new(vec![ComputeHost::new("h", "ops", vec![0], vec![])]);
    let mut agents = HostAgents::new();
    agents.insert(
        HostId::new("h"),
        Arc::new(SimulatedHostAgent::new(HostId::new("h"))) as Arc<dyn HostAgent>,
    );
    let config = ControllerConfig {
        policy: PolicyConfig {
            sleep_threshold: 0.5,
            wake_threshold: 0.1,
        },
        ..Default::default()
    };

    let result = CoreController::builder()
        .fleet(fleet)
        .agents(agents)
        .config(config)
        .build();
    assert!(result.is_err());
}

#[test]
fn test_builder_requires_fleet() {
    assert!(CoreController::builder().agents(HostAgents::new()).build().is_err());
}
