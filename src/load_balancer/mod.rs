//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher::route(pool_id, ctx)
//!     → pool.rs (members → eligible set: lifecycle, capacity, breaker, rate limit)
//!     → Apply the pool's selection strategy:
//!         - round_robin.rs     (rotate through servers)
//!         - weighted.rs        (smooth weighted round robin)
//!         - least_conn.rs      (fewest active connections)
//!         - response_time.rs   (avg response time × active connections)
//!         - hashing.rs         (client-key hash, consistent hash ring)
//!         - geo.rs             (nearest by great-circle distance)
//!         - adaptive.rs        (weighted composite score)
//!     → backend.rs (acquire connection guard)
//!     → Return guarded server or a classified error
//! ```
//!
//! # Design Decisions
//! - Strategies only see the eligible set; eligibility lives in the pool
//! - Strategies are resolved once per pool from an injectable registry
//! - Ties always break on the lowest server id so selection is reproducible

use std::sync::Arc;

pub mod adaptive;
pub mod backend;
pub mod geo;
pub mod hashing;
pub mod least_conn;
pub mod pool;
pub mod registry;
pub mod response_time;
pub mod round_robin;
pub mod weighted;

use backend::ServerRecord;
use geo::GeoPoint;

/// Per-request inputs a strategy may use.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionContext<'a> {
    /// Client identifier for hash-based strategies.
    pub client_key: Option<&'a str>,
    /// Session key; hash strategies prefer it over the client key.
    pub session_key: Option<&'a str>,
    /// Client coordinate for geolocation.
    pub location: Option<GeoPoint>,
}

impl<'a> SelectionContext<'a> {
    /// Key used by the hashing strategies.
    pub fn hash_key(&self) -> Option<&'a str> {
        self.session_key.or(self.client_key)
    }
}

/// A server selection algorithm.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    /// Pick one server from `servers`, which holds only eligible candidates
    /// in registration order.
    fn next_server(
        &self,
        servers: &[Arc<ServerRecord>],
        ctx: &SelectionContext<'_>,
    ) -> Option<Arc<ServerRecord>>;

    /// Registry id of this algorithm.
    fn name(&self) -> &'static str;

    /// Pool membership changed. Called with every member, eligible or not.
    fn rebuild(&self, _members: &[Arc<ServerRecord>]) {}
}
