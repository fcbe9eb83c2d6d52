//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{backend::ServerRecord, LoadBalancer, SelectionContext};

/// Least connections selector.
/// Selects the server with the minimum number of active connections.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server(
        &self,
        servers: &[Arc<ServerRecord>],
        _ctx: &SelectionContext<'_>,
    ) -> Option<Arc<ServerRecord>> {
        // In case of tie, the lowest id wins
        servers
            .iter()
            .min_by(|a, b| {
                a.active_connections()
                    .cmp(&b.active_connections())
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned()
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}
