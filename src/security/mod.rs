//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Candidate server selected:
//!     → rate_limit.rs (server window, then pool-wide window)
//!     → Admitted: request recorded in both windows
//!     → Rejected: attempt fails with RateLimited
//!
//! Admin API:
//!     → admin/auth.rs (bearer token)
//! ```
//!
//! # Design Decisions
//! - Eligibility peeks at the windows; only the chosen server records a stamp
//! - Fail closed: a full window rejects, never queues

pub mod rate_limit;

pub use rate_limit::RateLimiter;
