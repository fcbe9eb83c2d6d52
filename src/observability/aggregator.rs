//! Per-pool metrics aggregation and alerting.
//!
//! # Responsibilities
//! - Consume outcome events from every routing path
//! - Keep lifetime counters plus a trailing window per server
//! - Roll the windows up into pool statistics on a fixed interval
//! - Raise and clear threshold alerts (error rate, latency, availability)
//!
//! # Design Decisions
//! - Passive: nothing here feeds back into selection
//! - Alerts are edge-triggered; a breach is reported once until it clears
//! - Prometheus series are emitted from here so every outcome is counted once

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AlertConfig;
use crate::load_balancer::backend::{ServerId, ServerRecord};
use crate::observability::metrics;

/// Alerts kept for the history endpoint.
const ALERT_HISTORY: usize = 100;

/// One finished request (or attempt) against one server.
#[derive(Debug, Clone)]
pub struct OutcomeEvent {
    pub server: ServerId,
    pub success: bool,
    pub latency: Duration,
    /// Short label for the metrics series ("success", "timeout", ...).
    pub outcome: &'static str,
}

#[derive(Debug, Default)]
struct ServerCounters {
    requests: u64,
    errors: u64,
    recent: VecDeque<(bool, f64)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerStats {
    pub requests: u64,
    pub errors: u64,
    pub window_requests: usize,
    pub window_error_rate: f64,
    pub window_avg_latency_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_requests: u64,
    pub total_errors: u64,
    pub window_requests: usize,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    /// Mean probe availability over members.
    pub availability: f64,
    pub servers: usize,
    pub healthy_servers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ErrorRate,
    Latency,
    Availability,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::ErrorRate => "error_rate",
            AlertKind::Latency => "latency",
            AlertKind::Availability => "availability",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub pool: String,
    pub kind: AlertKind,
    pub value: f64,
    pub threshold: f64,
    pub raised_at_unix_ms: u64,
}

#[derive(Debug)]
pub struct MetricsAggregator {
    pool: String,
    config: AlertConfig,
    servers: DashMap<ServerId, ServerCounters>,
    active: Mutex<HashSet<AlertKind>>,
    history: Mutex<VecDeque<Alert>>,
    last: Mutex<PoolStats>,
}

impl MetricsAggregator {
    pub fn new(pool: impl Into<String>, config: AlertConfig) -> Self {
        Self {
            pool: pool.into(),
            config,
            servers: DashMap::new(),
            active: Mutex::new(HashSet::new()),
            history: Mutex::new(VecDeque::new()),
            last: Mutex::new(PoolStats::default()),
        }
    }

    pub fn record(&self, event: OutcomeEvent) {
        metrics::record_request(&self.pool, event.server.as_str(), event.outcome, event.latency);

        let window = self.config.window.max(1);
        let mut counters = self.servers.entry(event.server).or_default();
        counters.requests += 1;
        if !event.success {
            counters.errors += 1;
        }
        if counters.recent.len() == window {
            counters.recent.pop_front();
        }
        counters.recent.push_back((event.success, event.latency.as_secs_f64() * 1000.0));
    }

    pub fn server_stats(&self, id: &ServerId) -> ServerStats {
        self.servers.get(id).map(|c| summarize(&c)).unwrap_or_default()
    }

    pub fn forget(&self, id: &ServerId) {
        self.servers.remove(id);
    }

    /// Compute pool statistics without touching alert state.
    pub fn stats(&self, members: &[Arc<ServerRecord>]) -> PoolStats {
        let mut stats = PoolStats::default();
        let mut errors_in_window = 0usize;
        let mut latency_sum = 0.0;

        for entry in self.servers.iter() {
            stats.total_requests += entry.requests;
            stats.total_errors += entry.errors;
            stats.window_requests += entry.recent.len();
            for (ok, latency) in entry.recent.iter() {
                if !ok {
                    errors_in_window += 1;
                }
                latency_sum += latency;
            }
        }
        if stats.window_requests > 0 {
            stats.error_rate = errors_in_window as f64 / stats.window_requests as f64;
            stats.avg_latency_ms = latency_sum / stats.window_requests as f64;
        }

        stats.servers = members.len();
        stats.healthy_servers = members.iter().filter(|s| s.is_routable()).count();
        if !members.is_empty() {
            let total: f64 = members.iter().map(|s| s.metrics().availability).sum();
            stats.availability = total / members.len() as f64;
        }
        stats
    }

    /// Periodic rollup: refresh the cached stats and evaluate alerts.
    pub fn rollup(&self, members: &[Arc<ServerRecord>]) -> PoolStats {
        let stats = self.stats(members);
        let c = &self.config;

        let error_breach = stats.window_requests > 0 && stats.error_rate > c.error_rate;
        self.evaluate(AlertKind::ErrorRate, error_breach, stats.error_rate, c.error_rate);

        let latency_breach = stats.window_requests > 0 && stats.avg_latency_ms > c.latency_ms;
        self.evaluate(AlertKind::Latency, latency_breach, stats.avg_latency_ms, c.latency_ms);

        let availability_breach = stats.servers > 0 && stats.availability < c.availability;
        self.evaluate(AlertKind::Availability, availability_breach, stats.availability, c.availability);

        *self.last.lock() = stats.clone();
        stats
    }

    fn evaluate(&self, kind: AlertKind, breached: bool, value: f64, threshold: f64) {
        let mut active = self.active.lock();
        if breached && active.insert(kind) {
            tracing::warn!(pool = %self.pool, kind = kind.as_str(), value, threshold, "Alert raised");
            metrics::record_alert(&self.pool, kind.as_str());
            let alert = Alert {
                pool: self.pool.clone(),
                kind,
                value,
                threshold,
                raised_at_unix_ms: unix_ms(),
            };
            let mut history = self.history.lock();
            if history.len() == ALERT_HISTORY {
                history.pop_front();
            }
            history.push_back(alert);
        } else if !breached && active.remove(&kind) {
            tracing::info!(pool = %self.pool, kind = kind.as_str(), value, threshold, "Alert cleared");
        }
    }

    /// Most recent alert of each currently breached kind.
    pub fn active_alerts(&self) -> Vec<Alert> {
        let active = self.active.lock();
        let history = self.history.lock();
        let mut out: Vec<Alert> = active
            .iter()
            .filter_map(|kind| history.iter().rev().find(|a| a.kind == *kind).cloned())
            .collect();
        out.sort_by_key(|a| a.kind.as_str());
        out
    }

    pub fn alert_history(&self) -> Vec<Alert> {
        self.history.lock().iter().cloned().collect()
    }

    /// Stats from the last rollup.
    pub fn last_rollup(&self) -> PoolStats {
        self.last.lock().clone()
    }
}

fn summarize(c: &ServerCounters) -> ServerStats {
    let n = c.recent.len();
    let (errors, latency) = c
        .recent
        .iter()
        .fold((0usize, 0.0f64), |(e, l), (ok, ms)| (e + usize::from(!ok), l + ms));
    ServerStats {
        requests: c.requests,
        errors: c.errors,
        window_requests: n,
        window_error_rate: if n > 0 { errors as f64 / n as f64 } else { 0.0 },
        window_avg_latency_ms: if n > 0 { latency / n as f64 } else { 0.0 },
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
