//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the balancer.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::load_balancer::geo::GeoPoint;
use crate::load_balancer::registry;

/// Root configuration for the balancer daemon.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BalancerConfig {
    /// Front-door listener (where routed requests arrive).
    pub listener: ListenerConfig,

    /// Admin API settings.
    pub admin: AdminConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Which health probe the daemon uses for every pool.
    pub probe: ProbeConfig,

    /// Rule defaults applied to every pool unless the pool overrides a section.
    pub defaults: PoolSettings,

    /// Pools created at startup.
    pub pools: Vec<PoolConfig>,
}

/// Front-door listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Request deadline applied when the caller does not send one.
    pub request_timeout_ms: u64,

    /// Largest request body buffered for forwarding.
    pub max_body_bytes: usize,
}

impl ListenerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            request_timeout_ms: 30_000,
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Health probe implementation used by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    #[default]
    Tcp,
    Http,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub kind: ProbeKind,

    /// Path to probe for HTTP health checks.
    pub path: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            kind: ProbeKind::Tcp,
            path: "/health".to_string(),
        }
    }
}

/// Every routing rule a pool is created with.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Selection algorithm id (see `load_balancer::registry`).
    pub algorithm: String,
    pub health_check: HealthCheckConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub failover: FailoverConfig,
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
    pub consistent_hash: ConsistentHashConfig,
    pub geo: GeoConfig,
    pub adaptive: AdaptiveWeights,
    pub drain: DrainConfig,
    pub alerts: AlertConfig,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            algorithm: registry::ROUND_ROBIN.to_string(),
            health_check: HealthCheckConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            failover: FailoverConfig::default(),
            rate_limit: RateLimitConfig::default(),
            session: SessionConfig::default(),
            consistent_hash: ConsistentHashConfig::default(),
            geo: GeoConfig::default(),
            adaptive: AdaptiveWeights::default(),
            drain: DrainConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl PoolSettings {
    /// Defaults with a different algorithm.
    pub fn with_algorithm(algorithm: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            ..Self::default()
        }
    }
}

/// A pool declared in the config file. Unset sections inherit `defaults`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    pub id: String,
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    #[serde(default)]
    pub failover: Option<FailoverConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub session: Option<SessionConfig>,
    #[serde(default)]
    pub consistent_hash: Option<ConsistentHashConfig>,
    #[serde(default)]
    pub geo: Option<GeoConfig>,
    #[serde(default)]
    pub adaptive: Option<AdaptiveWeights>,
    #[serde(default)]
    pub drain: Option<DrainConfig>,
    #[serde(default)]
    pub alerts: Option<AlertConfig>,
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
}

impl PoolConfig {
    /// Resolve this pool's effective settings against the shared defaults.
    pub fn settings(&self, defaults: &PoolSettings) -> PoolSettings {
        let d = defaults.clone();
        PoolSettings {
            algorithm: self.algorithm.clone().unwrap_or(d.algorithm),
            health_check: self.health_check.clone().unwrap_or(d.health_check),
            circuit_breaker: self.circuit_breaker.clone().unwrap_or(d.circuit_breaker),
            failover: self.failover.clone().unwrap_or(d.failover),
            rate_limit: self.rate_limit.clone().unwrap_or(d.rate_limit),
            session: self.session.clone().unwrap_or(d.session),
            consistent_hash: self.consistent_hash.clone().unwrap_or(d.consistent_hash),
            geo: self.geo.clone().unwrap_or(d.geo),
            adaptive: self.adaptive.clone().unwrap_or(d.adaptive),
            drain: self.drain.clone().unwrap_or(d.drain),
            alerts: self.alerts.clone().unwrap_or(d.alerts),
        }
    }
}

/// Backend server definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSpec {
    /// Unique server identifier (unique across all pools).
    pub id: String,

    pub host: String,

    pub port: u16,

    /// Weight for weighted load balancing (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Maximum concurrent connections to this server.
    #[serde(default = "default_max_server_conns")]
    pub max_connections: usize,

    /// Declared request ceiling; falls back to the pool rate limit.
    #[serde(default)]
    pub max_requests_per_sec: Option<u32>,

    #[serde(default)]
    pub location: Option<GeoPoint>,

    /// Per-server probe interval override.
    #[serde(default)]
    pub health_interval_ms: Option<u64>,

    /// Per-server probe timeout override.
    #[serde(default)]
    pub health_timeout_ms: Option<u64>,
}

fn default_weight() -> u32 {
    1
}

fn default_max_server_conns() -> usize {
    100
}

impl ServerSpec {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            weight: default_weight(),
            max_connections: default_max_server_conns(),
            max_requests_per_sec: None,
            location: None,
            health_interval_ms: None,
            health_timeout_ms: None,
        }
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn max_requests_per_sec(mut self, max: u32) -> Self {
        self.max_requests_per_sec = Some(max);
        self
    }

    pub fn location(mut self, latitude: f64, longitude: f64) -> Self {
        self.location = Some(GeoPoint::new(latitude, longitude));
        self
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Probe interval in milliseconds.
    pub interval_ms: u64,

    /// Probe timeout in milliseconds.
    pub timeout_ms: u64,

    /// Number of trailing probe results kept per server.
    pub window_size: usize,

    /// Success ratio over the window at or above which a server is healthy.
    pub healthy_threshold: f64,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            timeout_ms: 5_000,
            window_size: 5,
            healthy_threshold: 0.8,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures (net of decay) that open the circuit.
    pub failure_threshold: u32,

    /// Time spent open before a trial is allowed, in milliseconds.
    pub recovery_timeout_ms: u64,

    /// Concurrent half-open trials; also the successes needed to close.
    pub half_open_limit: u32,
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn success_threshold(&self) -> u32 {
        self.half_open_limit
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_limit: 3,
        }
    }
}

/// Failover configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Total attempts per request, including the first.
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    pub backoff_multiplier: f64,

    /// Jitter upper bound as a fraction of the base delay.
    pub jitter_range: f64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Upper bound for a single downstream call in milliseconds.
    pub attempt_timeout_ms: u64,

    /// Response statuses treated as downstream failures.
    pub retry_on_status: Vec<u16>,

    /// Fixed seed for the jitter source; random when unset.
    pub jitter_seed: Option<u64>,
}

impl FailoverConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            jitter_range: 0.1,
            max_delay_ms: 5_000,
            attempt_timeout_ms: 10_000,
            retry_on_status: vec![502, 503, 504],
            jitter_seed: None,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Requests admitted per server per window, unless the server declares its own ceiling.
    pub max_requests: u32,

    /// Sliding window length in milliseconds.
    pub window_ms: u64,

    /// Optional ceiling across the whole pool.
    pub pool_max_requests: Option<u32>,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 1_000,
            window_ms: 1_000,
            pool_max_requests: None,
        }
    }
}

/// Session affinity configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Binding lifetime in seconds.
    pub ttl_secs: u64,

    /// Expired-binding sweep interval in seconds.
    pub sweep_interval_secs: u64,
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30 * 60,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsistentHashConfig {
    /// Virtual points per server on the ring.
    pub virtual_nodes: usize,
}

impl Default for ConsistentHashConfig {
    fn default() -> Self {
        Self { virtual_nodes: 150 }
    }
}

/// Geolocation selection configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GeoConfig {
    /// Nearest servers farther than this fall back to round robin.
    pub fallback_distance_km: Option<f64>,
}

/// Score weights for the adaptive strategy. Must sum to 1.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdaptiveWeights {
    pub response_time: f64,
    pub connections: f64,
    pub cpu: f64,
    pub error_rate: f64,
}

impl AdaptiveWeights {
    pub fn sum(&self) -> f64 {
        self.response_time + self.connections + self.cpu + self.error_rate
    }
}

impl Default for AdaptiveWeights {
    fn default() -> Self {
        Self {
            response_time: 0.4,
            connections: 0.3,
            cpu: 0.2,
            error_rate: 0.1,
        }
    }
}

/// Server removal configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DrainConfig {
    /// Longest a draining server waits for in-flight requests.
    pub grace_secs: u64,
}

impl DrainConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self { grace_secs: 30 }
    }
}

/// Alert thresholds for the metrics aggregator.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Error rate above which an alert is raised.
    pub error_rate: f64,

    /// Average latency above which an alert is raised.
    pub latency_ms: f64,

    /// Pool availability below which an alert is raised.
    pub availability: f64,

    /// How often pool statistics are rolled up.
    pub rollup_interval_secs: u64,

    /// Outcomes kept per server for rolling rates.
    pub window: usize,
}

impl AlertConfig {
    pub fn rollup_interval(&self) -> Duration {
        Duration::from_secs(self.rollup_interval_secs)
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.1,
            latency_ms: 1_000.0,
            availability: 0.9,
            rollup_interval_secs: 10,
            window: 100,
        }
    }
}
