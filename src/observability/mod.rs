//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Routing outcomes:
//!     → aggregator.rs (per-server windows → pool stats → alerts)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//!     → Admin API (pool stats, alerts)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through the front-door spans
//! - Metrics are cheap (atomic increments)

pub mod aggregator;
pub mod logging;
pub mod metrics;

pub use aggregator::{Alert, AlertKind, MetricsAggregator, OutcomeEvent, PoolStats, ServerStats};
