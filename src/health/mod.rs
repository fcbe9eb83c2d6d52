//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Per-server timer
//!     → probe.rs (HealthProbe: TCP connect / HTTP GET / embedder supplied)
//!     → state.rs (append to trailing window, recompute)
//!     → ServerRecord::record_probe (window, evaluation and publication under one lock)
//! ```
//!
//! # Design Decisions
//! - One independent loop per server; a slow probe never delays another server
//! - Health is per-server, not per-pool
//! - Request-level failures are the circuit breaker's concern, not this module's

pub mod active;
pub mod probe;
pub mod state;

pub use active::HealthMonitor;
pub use probe::{HealthProbe, HttpProbe, ProbeOutcome, TcpProbe};
