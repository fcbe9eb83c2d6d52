//! Error taxonomy.
//!
//! # Design Decisions
//! - `RouteError` is the only error `Dispatcher::route` returns; every request
//!   ends in exactly one response or exactly one of these variants
//! - Administrative mistakes surface as `ConfigurationError` at call time
//! - Health and breaker transitions never surface directly; callers only see
//!   their effect through `NoServerAvailable` / `AllRetriesFailed`

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::load_balancer::backend::ServerId;

/// Invalid pool, server or algorithm reference at admin-API call time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("pool '{0}' not found")]
    PoolNotFound(String),

    #[error("pool '{0}' already exists")]
    PoolAlreadyExists(String),

    #[error("server '{0}' not found")]
    ServerNotFound(String),

    #[error("server '{0}' is already registered")]
    DuplicateServer(ServerId),

    #[error("unknown selection algorithm '{0}'")]
    UnknownAlgorithm(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Why a single routing attempt against one server failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    CircuitOpen,
    RateLimited,
    AtCapacity,
    Timeout,
    Downstream(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::CircuitOpen => write!(f, "circuit open"),
            FailureReason::RateLimited => write!(f, "rate limited"),
            FailureReason::AtCapacity => write!(f, "connection limit reached"),
            FailureReason::Timeout => write!(f, "timed out"),
            FailureReason::Downstream(message) => write!(f, "downstream error: {}", message),
        }
    }
}

/// One failed attempt inside a failover sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptFailure {
    pub server: ServerId,
    pub reason: FailureReason,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.server, self.reason)
    }
}

/// Errors returned by `Dispatcher::route`.
#[derive(Debug, Clone, Error)]
pub enum RouteError {
    #[error("no server available in pool '{pool}'")]
    NoServerAvailable { pool: String },

    #[error("circuit open for every candidate in pool '{pool}'")]
    CircuitOpen { pool: String },

    #[error("rate limit exceeded for '{scope}'")]
    RateLimited { scope: String },

    #[error("request deadline exceeded")]
    Timeout,

    #[error("downstream call to '{server}' failed: {message}")]
    Downstream { server: ServerId, message: String },

    #[error("all {} attempts failed: {}", .attempts.len(), AttemptList(.attempts))]
    AllRetriesFailed { attempts: Vec<AttemptFailure> },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl RouteError {
    /// Short machine-readable label, used for metrics and response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            RouteError::NoServerAvailable { .. } => "no_server_available",
            RouteError::CircuitOpen { .. } => "circuit_open",
            RouteError::RateLimited { .. } => "rate_limited",
            RouteError::Timeout => "timeout",
            RouteError::Downstream { .. } => "downstream_error",
            RouteError::AllRetriesFailed { .. } => "all_retries_failed",
            RouteError::Configuration(_) => "configuration_error",
        }
    }

    /// Convert the lone failure of a single-attempt request into its own variant.
    pub(crate) fn from_single_failure(pool: &str, failure: AttemptFailure) -> Self {
        match failure.reason {
            FailureReason::CircuitOpen => RouteError::CircuitOpen { pool: pool.to_string() },
            FailureReason::RateLimited => RouteError::RateLimited {
                scope: failure.server.to_string(),
            },
            FailureReason::AtCapacity => RouteError::NoServerAvailable { pool: pool.to_string() },
            FailureReason::Timeout => RouteError::Timeout,
            FailureReason::Downstream(message) => RouteError::Downstream {
                server: failure.server,
                message,
            },
        }
    }
}

struct AttemptList<'a>(&'a [AttemptFailure]);

impl fmt::Display for AttemptList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, attempt) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "#{} {}", i + 1, attempt)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_retries_failed_lists_every_attempt() {
        let err = RouteError::AllRetriesFailed {
            attempts: vec![
                AttemptFailure {
                    server: ServerId::new("a"),
                    reason: FailureReason::Downstream("connection refused".into()),
                },
                AttemptFailure {
                    server: ServerId::new("b"),
                    reason: FailureReason::Timeout,
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "all 2 attempts failed: #1 a (downstream error: connection refused), #2 b (timed out)"
        );
        assert_eq!(err.kind(), "all_retries_failed");
    }

    #[test]
    fn test_configuration_error_converts() {
        let err: RouteError = ConfigurationError::PoolNotFound("web".into()).into();
        assert_eq!(err.to_string(), "pool 'web' not found");
        assert!(matches!(err, RouteError::Configuration(ConfigurationError::PoolNotFound(_))));
    }

    #[test]
    fn test_single_failure_maps_to_typed_variant() {
        let err = RouteError::from_single_failure(
            "web",
            AttemptFailure {
                server: ServerId::new("a"),
                reason: FailureReason::Downstream("503".into()),
            },
        );
        assert!(matches!(err, RouteError::Downstream { .. }));

        let err = RouteError::from_single_failure(
            "web",
            AttemptFailure {
                server: ServerId::new("a"),
                reason: FailureReason::CircuitOpen,
            },
        );
        assert!(matches!(err, RouteError::CircuitOpen { pool } if pool == "web"));
    }
}
