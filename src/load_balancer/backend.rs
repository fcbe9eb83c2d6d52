//! Server records.
//!
//! # Responsibilities
//! - Represent a single backend server inside a pool
//! - Track active connections (for Least Connections and drain)
//! - Enforce max connection limits
//! - Track health state and the administrative overlay (draining/maintenance)
//! - Keep rolling runtime metrics read by the selection strategies

use std::borrow::Borrow;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use url::Url;

use crate::config::ServerSpec;
use crate::error::ConfigurationError;
use crate::health::state::{HealthCheckResult, HealthWindow, ProbeSummary};
use crate::load_balancer::geo::GeoPoint;

/// Smoothing factor for the response time moving average.
const RESPONSE_TIME_ALPHA: f64 = 0.2;

/// Outcomes kept for the per-server error rate.
const ERROR_WINDOW: usize = 50;

/// Published health before and after one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthChange {
    pub previous: HealthState,
    pub next: HealthState,
}

/// Opaque server identity, unique across all pools.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ServerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

/// Administrative overlay on top of health.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdminState {
    Active = 0,
    Maintenance = 1,
    Draining = 2,
}

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unknown,
    Healthy,
    Unhealthy,
    Draining,
    Maintenance,
}

/// Snapshot of the rolling runtime metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RuntimeMetrics {
    /// Exponentially weighted average response time.
    pub avg_response_ms: f64,
    pub error_rate: f64,
    /// Probe success ratio over the health window (1.0 before any probe).
    pub availability: f64,
    pub cpu_utilization: Option<f64>,
}

#[derive(Debug)]
struct RuntimeState {
    avg_response_ms: Option<f64>,
    outcomes: VecDeque<bool>,
    availability: f64,
    cpu_utilization: Option<f64>,
}

impl RuntimeState {
    fn new() -> Self {
        Self {
            avg_response_ms: None,
            outcomes: VecDeque::with_capacity(ERROR_WINDOW),
            availability: 1.0,
            cpu_utilization: None,
        }
    }

    fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }
}

/// A single backend server.
#[derive(Debug)]
pub struct ServerRecord {
    pub id: ServerId,
    /// Owning pool.
    pub pool: String,
    pub host: String,
    pub port: u16,
    /// Pre-calculated base URL for forwarding.
    pub base_url: Url,
    /// Static weight for weighted selection.
    pub weight: u32,
    /// Maximum concurrent connections allowed.
    pub max_connections: usize,
    /// Declared request ceiling per rate-limit window.
    pub max_requests_per_sec: Option<u32>,
    pub location: Option<GeoPoint>,
    pub health_interval: Option<Duration>,
    pub health_timeout: Option<Duration>,

    active_connections: AtomicUsize,
    health: AtomicU8,
    admin: AtomicU8,
    idle: Notify,
    probes: Mutex<HealthWindow>,
    runtime: Mutex<RuntimeState>,
}

impl ServerRecord {
    /// Create a record in state `unknown` with zeroed metrics.
    pub fn new(pool: &str, spec: &ServerSpec, window_size: usize) -> Result<Self, ConfigurationError> {
        let base_url = Url::parse(&format!("http://{}:{}", spec.host, spec.port)).map_err(|e| {
            ConfigurationError::Invalid(format!("server '{}' has an invalid address: {}", spec.id, e))
        })?;

        Ok(Self {
            id: ServerId::new(spec.id.clone()),
            pool: pool.to_string(),
            host: spec.host.clone(),
            port: spec.port,
            base_url,
            weight: spec.weight,
            max_connections: spec.max_connections,
            max_requests_per_sec: spec.max_requests_per_sec,
            location: spec.location,
            health_interval: spec.health_interval_ms.map(Duration::from_millis),
            health_timeout: spec.health_timeout_ms.map(Duration::from_millis),
            active_connections: AtomicUsize::new(0),
            health: AtomicU8::new(HealthState::Unknown as u8),
            admin: AtomicU8::new(AdminState::Active as u8),
            idle: Notify::new(),
            probes: Mutex::new(HealthWindow::new(window_size)),
            runtime: Mutex::new(RuntimeState::new()),
        })
    }

    /// Get the current number of active connections.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Try to create a connection guard that increments count.
    pub fn try_create_guard(self: &Arc<Self>) -> Option<ConnectionGuard> {
        let mut prev = self.active_connections.load(Ordering::Relaxed);
        loop {
            if prev >= self.max_connections {
                return None;
            }
            match self.active_connections.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(ConnectionGuard {
            server: self.clone(),
        })
    }

    fn release_connection(&self) {
        if self.active_connections.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Resolve once no connection is active.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active_connections() == 0 {
                return;
            }
            notified.await;
        }
    }

    // --- State ---

    pub fn health(&self) -> HealthState {
        HealthState::from(self.health.load(Ordering::Acquire))
    }

    /// Publish a new health state, returning the previous one.
    pub fn set_health(&self, state: HealthState) -> HealthState {
        HealthState::from(self.health.swap(state as u8, Ordering::AcqRel))
    }

    pub fn state(&self) -> LifecycleState {
        match self.admin.load(Ordering::Acquire) {
            x if x == AdminState::Draining as u8 => LifecycleState::Draining,
            x if x == AdminState::Maintenance as u8 => LifecycleState::Maintenance,
            _ => match self.health() {
                HealthState::Unknown => LifecycleState::Unknown,
                HealthState::Healthy => LifecycleState::Healthy,
                HealthState::Unhealthy => LifecycleState::Unhealthy,
            },
        }
    }

    /// Toggle maintenance. Draining always wins; returns false in that case.
    pub fn set_maintenance(&self, enabled: bool) -> bool {
        let (from, to) = if enabled {
            (AdminState::Active, AdminState::Maintenance)
        } else {
            (AdminState::Maintenance, AdminState::Active)
        };
        match self
            .admin
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == to as u8,
        }
    }

    /// Stop new routing to this server. Irreversible.
    pub fn begin_drain(&self) {
        self.admin.store(AdminState::Draining as u8, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.admin.load(Ordering::Acquire) == AdminState::Draining as u8
    }

    /// Lifecycle allows traffic: active and not unhealthy. Ignores capacity.
    pub fn is_serving(&self) -> bool {
        self.admin.load(Ordering::Acquire) == AdminState::Active as u8 && self.health() != HealthState::Unhealthy
    }

    /// Lifecycle and capacity allow new requests. Unknown counts as routable.
    pub fn is_routable(&self) -> bool {
        self.is_serving() && self.active_connections() < self.max_connections
    }

    // --- Metrics ---

    /// Fold one request outcome into the rolling metrics.
    pub fn observe_response(&self, latency: Duration, success: bool) {
        let sample = latency.as_secs_f64() * 1000.0;
        let mut runtime = self.runtime.lock();
        runtime.avg_response_ms = Some(match runtime.avg_response_ms {
            Some(avg) => avg + RESPONSE_TIME_ALPHA * (sample - avg),
            None => sample,
        });
        if runtime.outcomes.len() == ERROR_WINDOW {
            runtime.outcomes.pop_front();
        }
        runtime.outcomes.push_back(success);
    }

    /// Append a probe result, then evaluate and publish the window's health.
    ///
    /// Push, evaluation and publication happen under the window lock, so the
    /// published state always reflects the newest window.
    pub fn record_probe(
        &self,
        result: HealthCheckResult,
        cpu_utilization: Option<f64>,
        healthy_threshold: f64,
    ) -> HealthChange {
        let (ratio, change) = {
            let mut probes = self.probes.lock();
            probes.push(result);
            let next = probes.evaluate(healthy_threshold);
            let previous = self.set_health(next);
            (probes.success_ratio().unwrap_or(0.0), HealthChange { previous, next })
        };
        let mut runtime = self.runtime.lock();
        runtime.availability = ratio;
        if cpu_utilization.is_some() {
            runtime.cpu_utilization = cpu_utilization;
        }
        change
    }

    pub fn recent_probes(&self) -> Vec<ProbeSummary> {
        self.probes.lock().iter().map(ProbeSummary::from).collect()
    }

    pub fn metrics(&self) -> RuntimeMetrics {
        let runtime = self.runtime.lock();
        RuntimeMetrics {
            avg_response_ms: runtime.avg_response_ms.unwrap_or(0.0),
            error_rate: runtime.error_rate(),
            availability: runtime.availability,
            cpu_utilization: runtime.cpu_utilization,
        }
    }
}

/// A RAII guard that manages the active connection count.
#[derive(Debug)]
pub struct ConnectionGuard {
    pub server: Arc<ServerRecord>,
}

impl Deref for ConnectionGuard {
    type Target = ServerRecord;
    fn deref(&self) -> &Self::Target {
        &self.server
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.server.release_connection();
    }
}
