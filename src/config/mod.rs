//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → BalancerConfig (validated, immutable)
//!     → PoolConfig::settings(defaults) → PoolSettings per pool
//!
//! Admin API createPool:
//!     PoolConfig (JSON)
//!     → PoolSettings
//!     → validation.rs (same pool checks)
//!     → Dispatcher::create_pool
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - A pool overriding a section replaces that section wholesale
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AdaptiveWeights, AdminConfig, AlertConfig, BalancerConfig, CircuitBreakerConfig,
    ConsistentHashConfig, DrainConfig, FailoverConfig, GeoConfig, HealthCheckConfig,
    ListenerConfig, LogFormat, ObservabilityConfig, PoolConfig, PoolSettings, ProbeConfig,
    ProbeKind, RateLimitConfig, ServerSpec, SessionConfig,
};
