//! Adaptive composite strategy.
//!
//! Each eligible server gets a score from four signals, each normalized to
//! [0, 1] against the largest value in the eligible set:
//!
//! ```text
//! score = w_rt  × rt / max_rt
//!       + w_con × active / max_active
//!       + w_cpu × cpu / max_cpu
//!       + w_err × error_rate / max_error_rate
//! ```
//!
//! The lowest score wins. A signal that is zero everywhere contributes
//! nothing; servers that never reported CPU count as idle.

use std::sync::Arc;

use crate::config::AdaptiveWeights;
use crate::load_balancer::{backend::ServerRecord, LoadBalancer, SelectionContext};

#[derive(Debug)]
pub struct Adaptive {
    weights: AdaptiveWeights,
}

impl Adaptive {
    pub fn new(weights: AdaptiveWeights) -> Self {
        Self { weights }
    }
}

struct Signals {
    response_ms: f64,
    connections: f64,
    cpu: f64,
    error_rate: f64,
}

fn ratio(value: f64, max: f64) -> f64 {
    if max > 0.0 {
        value / max
    } else {
        0.0
    }
}

impl LoadBalancer for Adaptive {
    fn next_server(
        &self,
        servers: &[Arc<ServerRecord>],
        _ctx: &SelectionContext<'_>,
    ) -> Option<Arc<ServerRecord>> {
        let signals: Vec<Signals> = servers
            .iter()
            .map(|s| {
                let m = s.metrics();
                Signals {
                    response_ms: m.avg_response_ms,
                    connections: s.active_connections() as f64,
                    cpu: m.cpu_utilization.unwrap_or(0.0),
                    error_rate: m.error_rate,
                }
            })
            .collect();

        let max = signals.iter().fold((0.0f64, 0.0f64, 0.0f64, 0.0f64), |acc, s| {
            (
                acc.0.max(s.response_ms),
                acc.1.max(s.connections),
                acc.2.max(s.cpu),
                acc.3.max(s.error_rate),
            )
        });

        let w = &self.weights;
        servers
            .iter()
            .zip(signals.iter())
            .map(|(server, s)| {
                let score = w.response_time * ratio(s.response_ms, max.0)
                    + w.connections * ratio(s.connections, max.1)
                    + w.cpu * ratio(s.cpu, max.2)
                    + w.error_rate * ratio(s.error_rate, max.3);
                (score, server)
            })
            .min_by(|(sa, a), (sb, b)| sa.total_cmp(sb).then_with(|| a.id.cmp(&b.id)))
            .map(|(_, server)| server.clone())
    }

    fn name(&self) -> &'static str {
        "adaptive"
    }
}
