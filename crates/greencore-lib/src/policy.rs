//! Sleep/wake decision policy
//!
//! Two thresholds with a gap between them give hysteresis, and the
//! rolling window damps single-sample noise:
//!
//! - an awake core sleeps only once a full window sits below `sleep_threshold`
//! - an asleep core wakes as soon as any sample in the window exceeds
//!   `wake_threshold`
//! - a transitioning core is left alone; the in-flight call owns it

use crate::models::CoreState;
use crate::sampler::UsageWindow;
use serde::{Deserialize, Serialize};

/// Default utilization below which an awake core may sleep
pub const DEFAULT_SLEEP_THRESHOLD: f64 = 0.05;

/// Default utilization above which a sleeping core is woken
pub const DEFAULT_WAKE_THRESHOLD: f64 = 0.40;

/// Outcome of evaluating one core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    NoChange,
    RequestSleep,
    RequestWake,
}

/// Threshold configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub sleep_threshold: f64,
    pub wake_threshold: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            sleep_threshold: DEFAULT_SLEEP_THRESHOLD,
            wake_threshold: DEFAULT_WAKE_THRESHOLD,
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let PolicyConfig {
            sleep_threshold: sleep,
            wake_threshold: wake,
        } = *self;
        if !(0.0..=1.0).contains(&sleep) || !(0.0..=1.0).contains(&wake) {
            anyhow::bail!("thresholds must lie in [0, 1] (sleep={sleep}, wake={wake})");
        }
        if sleep >= wake {
            anyhow::bail!("sleep threshold {sleep} must be below wake threshold {wake}");
        }
        Ok(())
    }
}

/// Pure decision function over a core's usage window and state
#[derive(Debug, Clone, Default)]
pub struct TransitionPolicy {
    config: PolicyConfig,
}

impl TransitionPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn evaluate(&self, window: &UsageWindow, state: CoreState) -> Decision {
        match state {
            CoreState::Transitioning => Decision::NoChange,
            CoreState::Awake => {
                let all_idle = window.is_full()
                    && window
                        .iter()
                        .all(|s| s.utilization < self.config.sleep_threshold);
                if all_idle {
                    Decision::RequestSleep
                } else {
                    Decision::NoChange
                }
            }
            CoreState::Asleep => {
                if window
                    .iter()
                    .any(|s| s.utilization > self.config.wake_threshold)
                {
                    Decision::RequestWake
                } else {
                    Decision::NoChange
                }
            }
        }
    }
}
