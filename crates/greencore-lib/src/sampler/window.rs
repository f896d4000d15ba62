//! Bounded rolling window of usage samples for one core

use crate::models::UsageSample;
use std::collections::VecDeque;

/// Default number of samples the policy looks at
pub const DEFAULT_WINDOW_SIZE: usize = 3;

/// Most recent samples for a single core, oldest first
#[derive(Debug, Clone)]
pub struct UsageWindow {
    samples: VecDeque<UsageSample>,
    capacity: usize,
}

impl UsageWindow {
    /// Create an empty window holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a sample, evicting the oldest when full
    pub fn push(&mut self, sample: UsageSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Drop every sample
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn latest(&self) -> Option<&UsageSample> {
        self.samples.back()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &UsageSample> {
        self.samples.iter()
    }

    /// Utilization values, oldest first
    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.utilization).collect()
    }
}

impl Default for UsageWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}
