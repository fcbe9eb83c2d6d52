//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{backend::ServerRecord, LoadBalancer, SelectionContext};

/// Round-robin selector.
/// Stores an internal counter to rotate through servers.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_server(
        &self,
        servers: &[Arc<ServerRecord>],
        _ctx: &SelectionContext<'_>,
    ) -> Option<Arc<ServerRecord>> {
        if servers.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % servers.len();
        Some(servers[index].clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
