//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to server:
//!     → circuit_breaker.rs (admit, reject fast, or admit as half-open trial)
//!     → timeouts.rs (bound the attempt by min(deadline, attempt timeout))
//!     → On failure: circuit_breaker.rs records it
//!     → retries.rs (select another server, wait backoff.rs delay, try again)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every downstream call has a deadline
//! - Circuit breaker prevents cascading failures
//! - Backoff jitter is seedable so retry timing is testable

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakers, CircuitSnapshot, CircuitState};
pub use retries::{AttemptOutcome, Completed, FailoverCoordinator};
pub use timeouts::Deadline;
