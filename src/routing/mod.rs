//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher::route(pool_id, RequestContext)
//!     → session binding lookup (first attempt only)
//!     → Pool::select (eligible set → strategy)
//!     → breaker permit → connection guard → rate-limit admission
//!     → upstream.rs (Upstream::call, bounded by the attempt deadline)
//!     → outcome recorded: breaker, server EWMA, aggregator
//!     → failure: FailoverCoordinator backs off and selects again
//!     → success: bind session, return Routed
//! ```
//!
//! # Design Decisions
//! - Collaborators (upstream, health probe) are traits injected at construction
//! - Retries within one request are sequential; requests are independent
//! - The request deadline covers selection, backoff and the downstream call

pub mod context;
pub mod dispatcher;
pub mod upstream;

pub use context::RequestContext;
pub use dispatcher::{Dispatcher, Routed};
pub use upstream::{cancel_pair, CancelHandle, CancelSignal, Upstream, UpstreamError, UpstreamRequest, UpstreamResponse};
