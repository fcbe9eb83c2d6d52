//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define balancer metrics (requests, latency, retries, health, breakers)
//! - Expose Prometheus-compatible metrics endpoint
//! - Track per-server and per-pool series
//!
//! # Metrics
//! - `lb_requests_total` (counter): requests by pool, server, outcome
//! - `lb_request_duration_seconds` (histogram): latency per pool, server
//! - `lb_retries_total` (counter): failover retries per pool
//! - `lb_backend_health` (gauge): 1=healthy, 0=not healthy
//! - `lb_circuit_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `lb_rate_limited_total` (counter): rejections per scope
//! - `lb_alerts_total` (counter): raised alerts per pool, kind
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   exporter every call is a no-op
//! - Labels are server and pool ids, never request data

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::resilience::circuit_breaker::CircuitState;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_request(pool: &str, server: &str, outcome: &str, latency: Duration) {
    counter!(
        "lb_requests_total",
        "pool" => pool.to_string(),
        "server" => server.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(
        "lb_request_duration_seconds",
        "pool" => pool.to_string(),
        "server" => server.to_string()
    )
    .record(latency.as_secs_f64());
}

pub fn record_retry(pool: &str) {
    counter!("lb_retries_total", "pool" => pool.to_string()).increment(1);
}

pub fn record_backend_health(server: &str, healthy: bool) {
    gauge!("lb_backend_health", "server" => server.to_string()).set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_circuit_state(server: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!("lb_circuit_state", "server" => server.to_string()).set(value);
}

pub fn record_rate_limited(scope: &str) {
    counter!("lb_rate_limited_total", "scope" => scope.to_string()).increment(1);
}

pub fn record_alert(pool: &str, kind: &str) {
    counter!("lb_alerts_total", "pool" => pool.to_string(), "kind" => kind.to_string()).increment(1);
}
