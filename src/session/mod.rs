//! Session affinity (sticky routing).
//!
//! # Data Flow
//! ```text
//! Request with session key
//!     → affinity.rs lookup
//!     → bound server still eligible? route there on the first attempt
//!     → otherwise unbind and fall through to the pool's strategy
//!     → successful response: bind key → server that answered
//! ```

pub mod affinity;

pub use affinity::{BindingSummary, SessionBinding, SessionStore};
