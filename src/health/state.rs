//! Server health state from a trailing probe window.
//!
//! # States
//! - Unknown: no probe has completed yet
//! - Healthy: success ratio over the window ≥ healthy threshold
//! - Unhealthy: anything below the threshold
//!
//! # Design Decisions
//! - Health is recomputed from the whole window after every probe
//! - History is never reset on a transition; old results age out
//! - Timeouts and probe errors are both unsuccessful results

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::load_balancer::backend::HealthState;

/// Ratios are compared with this slack so 4/5 meets a 0.8 threshold.
const RATIO_EPSILON: f64 = 1e-9;

/// One probe outcome.
#[derive(Debug, Clone, Copy)]
pub struct HealthCheckResult {
    pub success: bool,
    pub latency: Duration,
    pub at: Instant,
}

impl HealthCheckResult {
    pub fn new(success: bool, latency: Duration) -> Self {
        Self {
            success,
            latency,
            at: Instant::now(),
        }
    }
}

/// Serializable view of a probe result.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeSummary {
    pub success: bool,
    pub latency_ms: u64,
    pub age_ms: u64,
}

impl From<&HealthCheckResult> for ProbeSummary {
    fn from(result: &HealthCheckResult) -> Self {
        Self {
            success: result.success,
            latency_ms: result.latency.as_millis() as u64,
            age_ms: result.at.elapsed().as_millis() as u64,
        }
    }
}

/// Bounded trailing window of probe results.
#[derive(Debug)]
pub struct HealthWindow {
    results: VecDeque<HealthCheckResult>,
    capacity: usize,
}

impl HealthWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            results: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a result, dropping the oldest once full.
    pub fn push(&mut self, result: HealthCheckResult) {
        if self.results.len() == self.capacity {
            self.results.pop_front();
        }
        self.results.push_back(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Fraction of successful probes, `None` before the first probe.
    pub fn success_ratio(&self) -> Option<f64> {
        if self.results.is_empty() {
            return None;
        }
        let successes = self.results.iter().filter(|r| r.success).count();
        Some(successes as f64 / self.results.len() as f64)
    }

    /// Health implied by the current window.
    pub fn evaluate(&self, healthy_threshold: f64) -> HealthState {
        match self.success_ratio() {
            None => HealthState::Unknown,
            Some(ratio) if ratio + RATIO_EPSILON >= healthy_threshold => HealthState::Healthy,
            Some(_) => HealthState::Unhealthy,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &HealthCheckResult> {
        self.results.iter()
    }
}
