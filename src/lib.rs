//! Adaptive request routing and resilience core.

pub mod admin;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod resilience;
pub mod routing;
pub mod security;
pub mod session;

pub use config::schema::BalancerConfig;
pub use error::{ConfigurationError, RouteError};
pub use lifecycle::Shutdown;
pub use load_balancer::backend::ServerId;
pub use routing::{Dispatcher, RequestContext, Routed};
