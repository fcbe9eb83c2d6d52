//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (unique pool and server ids, known algorithms)
//! - Validate value ranges (thresholds in (0, 1], non-zero windows and ports)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BalancerConfig → Result<(), Vec<ValidationError>>
//! - The same pool checks run when a pool is created through the admin API

use std::collections::HashSet;
use std::fmt;

use crate::config::schema::{BalancerConfig, PoolSettings, ServerSpec};
use crate::load_balancer::registry::BUILTIN_ALGORITHMS;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-3;

/// A single semantic problem, located by a dotted field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a whole config file.
pub fn validate_config(config: &BalancerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.request_timeout_ms == 0 {
        errors.push(ValidationError::new("listener.request_timeout_ms", "must be greater than zero"));
    }
    if config.admin.enabled && config.admin.api_key.trim().is_empty() {
        errors.push(ValidationError::new("admin.api_key", "must not be empty when admin is enabled"));
    }

    errors.extend(validate_algorithm(&config.defaults.algorithm, "defaults.algorithm"));
    errors.extend(validate_pool_settings(&config.defaults, "defaults"));

    let mut pool_ids = HashSet::new();
    let mut server_ids = HashSet::new();
    for (i, pool) in config.pools.iter().enumerate() {
        let scope = format!("pools[{}]", i);
        if pool.id.trim().is_empty() {
            errors.push(ValidationError::new(format!("{}.id", scope), "must not be empty"));
        } else if !pool_ids.insert(pool.id.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.id", scope),
                format!("duplicate pool id '{}'", pool.id),
            ));
        }

        let settings = pool.settings(&config.defaults);
        errors.extend(validate_algorithm(&settings.algorithm, &format!("{}.algorithm", scope)));
        errors.extend(validate_pool_settings(&settings, &scope));

        for (j, server) in pool.servers.iter().enumerate() {
            let server_scope = format!("{}.servers[{}]", scope, j);
            errors.extend(validate_server(server, &server_scope));
            if !server_ids.insert(server.id.as_str()) {
                errors.push(ValidationError::new(
                    format!("{}.id", server_scope),
                    format!("duplicate server id '{}'", server.id),
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_algorithm(algorithm: &str, field: &str) -> Vec<ValidationError> {
    if BUILTIN_ALGORITHMS.contains(&algorithm) {
        Vec::new()
    } else {
        vec![ValidationError::new(field, format!("unknown algorithm '{}'", algorithm))]
    }
}

/// Range checks for one pool's rules. The algorithm id is checked by the caller,
/// since custom strategy registries may know more ids than the built-in set.
pub fn validate_pool_settings(settings: &PoolSettings, scope: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut check = |ok: bool, field: &str, message: &str| {
        if !ok {
            errors.push(ValidationError::new(format!("{}.{}", scope, field), message));
        }
    };

    let hc = &settings.health_check;
    check(hc.interval_ms > 0, "health_check.interval_ms", "must be greater than zero");
    check(hc.timeout_ms > 0, "health_check.timeout_ms", "must be greater than zero");
    check(hc.window_size > 0, "health_check.window_size", "must be greater than zero");
    check(
        hc.healthy_threshold > 0.0 && hc.healthy_threshold <= 1.0,
        "health_check.healthy_threshold",
        "must be in (0, 1]",
    );

    let cb = &settings.circuit_breaker;
    check(cb.failure_threshold > 0, "circuit_breaker.failure_threshold", "must be greater than zero");
    check(cb.half_open_limit > 0, "circuit_breaker.half_open_limit", "must be greater than zero");

    let fo = &settings.failover;
    check(fo.max_retries > 0, "failover.max_retries", "must allow at least one attempt");
    check(fo.backoff_multiplier >= 1.0, "failover.backoff_multiplier", "must be at least 1.0");
    check(
        (0.0..=1.0).contains(&fo.jitter_range),
        "failover.jitter_range",
        "must be in [0, 1]",
    );
    check(fo.max_delay_ms >= fo.base_delay_ms, "failover.max_delay_ms", "must not be below base_delay_ms");
    check(fo.attempt_timeout_ms > 0, "failover.attempt_timeout_ms", "must be greater than zero");

    let rl = &settings.rate_limit;
    check(rl.window_ms > 0, "rate_limit.window_ms", "must be greater than zero");
    check(rl.max_requests > 0, "rate_limit.max_requests", "must be greater than zero");
    check(
        rl.pool_max_requests.map_or(true, |n| n > 0),
        "rate_limit.pool_max_requests",
        "must be greater than zero when set",
    );

    check(settings.session.ttl_secs > 0, "session.ttl_secs", "must be greater than zero");
    check(
        settings.session.sweep_interval_secs > 0,
        "session.sweep_interval_secs",
        "must be greater than zero",
    );
    check(
        settings.consistent_hash.virtual_nodes > 0,
        "consistent_hash.virtual_nodes",
        "must be greater than zero",
    );
    check(
        settings.geo.fallback_distance_km.map_or(true, |d| d > 0.0),
        "geo.fallback_distance_km",
        "must be positive when set",
    );

    let weights = &settings.adaptive;
    check(
        [weights.response_time, weights.connections, weights.cpu, weights.error_rate]
            .iter()
            .all(|w| *w >= 0.0),
        "adaptive",
        "weights must not be negative",
    );
    check(
        (weights.sum() - 1.0).abs() <= WEIGHT_SUM_TOLERANCE,
        "adaptive",
        "weights must sum to 1",
    );

    let alerts = &settings.alerts;
    check(alerts.window > 0, "alerts.window", "must be greater than zero");
    check(
        alerts.rollup_interval_secs > 0,
        "alerts.rollup_interval_secs",
        "must be greater than zero",
    );

    errors
}

/// Checks for a single server definition.
pub fn validate_server(server: &ServerSpec, scope: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if server.id.trim().is_empty() {
        errors.push(ValidationError::new(format!("{}.id", scope), "must not be empty"));
    }
    if server.host.trim().is_empty() {
        errors.push(ValidationError::new(format!("{}.host", scope), "must not be empty"));
    }
    if server.port == 0 {
        errors.push(ValidationError::new(format!("{}.port", scope), "must not be zero"));
    }
    if server.max_connections == 0 {
        errors.push(ValidationError::new(
            format!("{}.max_connections", scope),
            "must be greater than zero",
        ));
    }
    if server.max_requests_per_sec == Some(0) {
        errors.push(ValidationError::new(
            format!("{}.max_requests_per_sec", scope),
            "must be greater than zero when set",
        ));
    }
    if let Some(location) = &server.location {
        if !location.is_valid() {
            errors.push(ValidationError::new(
                format!("{}.location", scope),
                "latitude must be within ±90 and longitude within ±180",
            ));
        }
    }
    errors
}

/// Join errors into a single line for `ConfigurationError::Invalid`.
pub fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
