//! Smooth weighted round robin.
//!
//! Every pick adds each candidate's static weight to its running total, takes
//! the largest total, and subtracts the sum of weights from the winner. Over
//! one cycle each server is chosen exactly `weight` times, interleaved rather
//! than in bursts.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::load_balancer::{
    backend::{ServerId, ServerRecord},
    LoadBalancer, SelectionContext,
};

#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    current: Mutex<HashMap<ServerId, i64>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

fn effective_weight(server: &ServerRecord) -> i64 {
    i64::from(server.weight.max(1))
}

impl LoadBalancer for WeightedRoundRobin {
    fn next_server(
        &self,
        servers: &[Arc<ServerRecord>],
        _ctx: &SelectionContext<'_>,
    ) -> Option<Arc<ServerRecord>> {
        if servers.is_empty() {
            return None;
        }

        let mut current = self.current.lock();
        let mut total = 0i64;
        let mut best: Option<(&Arc<ServerRecord>, i64)> = None;

        for server in servers {
            let weight = effective_weight(server);
            total += weight;
            let running = current.entry(server.id.clone()).or_insert(0);
            *running += weight;

            let better = match best {
                None => true,
                Some((b, value)) => *running > value || (*running == value && server.id < b.id),
            };
            if better {
                best = Some((server, *running));
            }
        }

        let (winner, _) = best?;
        if let Some(running) = current.get_mut(&winner.id) {
            *running -= total;
        }
        Some(winner.clone())
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }

    fn rebuild(&self, members: &[Arc<ServerRecord>]) {
        // Membership changed, start a fresh cycle.
        let mut current = self.current.lock();
        current.clear();
        for server in members {
            current.insert(server.id.clone(), 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::server_with;

    fn pool_321() -> Vec<Arc<ServerRecord>> {
        vec![
            server_with("a", |s| s.weight(3)),
            server_with("b", |s| s.weight(2)),
            server_with("c", |s| s.weight(1)),
        ]
    }

    #[test]
    fn test_ratio_over_600_calls() {
        let lb = WeightedRoundRobin::new();
        let servers = pool_321();
        let ctx = SelectionContext::default();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..600 {
            let s = lb.next_server(&servers, &ctx).unwrap();
            *counts.entry(s.id.to_string()).or_default() += 1;
        }

        assert_eq!(counts["a"], 300);
        assert_eq!(counts["b"], 200);
        assert_eq!(counts["c"], 100);
    }

    #[test]
    fn test_interleaves_instead_of_bursting() {
        let lb = WeightedRoundRobin::new();
        let servers = pool_321();
        let ctx = SelectionContext::default();

        let picks: Vec<String> = (0..6)
            .map(|_| lb.next_server(&servers, &ctx).unwrap().id.to_string())
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "c", "b", "a"]);
    }

    #[test]
    fn test_rebuild_restarts_cycle() {
        let lb = WeightedRoundRobin::new();
        let servers = pool_321();
        let ctx = SelectionContext::default();

        lb.next_server(&servers, &ctx);
        lb.next_server(&servers, &ctx);
        lb.rebuild(&servers);
        assert_eq!(lb.next_server(&servers, &ctx).unwrap().id.as_str(), "a");
    }
}
