//! Least Response Time load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{backend::ServerRecord, LoadBalancer, SelectionContext};

/// Picks the server minimizing `avg response time × active connections`,
/// an estimate of the queueing delay a new request would see.
/// Ties fall back to the lower average, then the lowest id.
#[derive(Debug, Default)]
pub struct LeastResponseTime;

impl LeastResponseTime {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastResponseTime {
    fn next_server(
        &self,
        servers: &[Arc<ServerRecord>],
        _ctx: &SelectionContext<'_>,
    ) -> Option<Arc<ServerRecord>> {
        servers
            .iter()
            .map(|s| {
                let avg = s.metrics().avg_response_ms;
                (avg * s.active_connections() as f64, avg, s)
            })
            .min_by(|(sa, aa, a), (sb, ab, b)| {
                sa.total_cmp(sb)
                    .then_with(|| aa.total_cmp(ab))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|(_, _, s)| s.clone())
    }

    fn name(&self) -> &'static str {
        "least_response_time"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::server_with;
    use std::time::Duration;

    #[test]
    fn test_prefers_lowest_queueing_estimate() {
        let lb = LeastResponseTime::new();
        let fast_busy = server_with("a", |s| s);
        let slow_idle = server_with("b", |s| s);
        fast_busy.observe_response(Duration::from_millis(10), true);
        slow_idle.observe_response(Duration::from_millis(200), true);

        let _guards: Vec<_> = (0..3).map(|_| fast_busy.try_create_guard().unwrap()).collect();
        let _one = slow_idle.try_create_guard().unwrap();

        // a: 10 × 3 = 30, b: 200 × 1 = 200
        let servers = vec![fast_busy.clone(), slow_idle.clone()];
        let ctx = SelectionContext::default();
        assert_eq!(lb.next_server(&servers, &ctx).unwrap().id, fast_busy.id);
    }

    #[test]
    fn test_idle_servers_break_tie_on_average() {
        let lb = LeastResponseTime::new();
        let a = server_with("a", |s| s);
        let b = server_with("b", |s| s);
        a.observe_response(Duration::from_millis(80), true);
        b.observe_response(Duration::from_millis(20), true);

        let servers = vec![a, b.clone()];
        assert_eq!(lb.next_server(&servers, &SelectionContext::default()).unwrap().id, b.id);
    }
}
