//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Logging/metrics → Create pools → Start listeners
//!
//! Shutdown (shutdown.rs):
//!     Ctrl-C → Stop accepting → Dispatcher::shutdown (per-pool tasks) → Exit
//!
//! Pool teardown:
//!     Dispatcher::remove_pool → pool Shutdown::trigger
//!     → health probes, session sweep, metrics rollup exit
//! ```
//!
//! # Design Decisions
//! - Every background task belongs to exactly one pool and ends with it
//! - Ordered shutdown: stop accept, stop pools, exit

pub mod shutdown;

pub use shutdown::{Shutdown, ShutdownSignal};
