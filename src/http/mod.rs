//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, trace span)
//!     → request.rs (buffer body, routing headers → RequestContext)
//!     → Dispatcher::route
//!         → client.rs (HttpUpstream forwards to the chosen server)
//!     → response.rs (relay response, or RouteError → status code)
//!     → Send to client
//! ```

pub mod client;
pub mod request;
pub mod response;
pub mod server;

pub use client::HttpUpstream;
pub use request::{UuidRequestId, X_REQUEST_ID};
pub use server::HttpServer;
