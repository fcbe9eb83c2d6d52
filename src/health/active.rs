//! Active health checking.
//!
//! # Responsibilities
//! - Run one independent probe loop per server
//! - Bound every probe with the health timeout
//! - Recompute health from the trailing window and publish transitions

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::HealthCheckConfig;
use crate::health::probe::HealthProbe;
use crate::health::state::HealthCheckResult;
use crate::lifecycle::ShutdownSignal;
use crate::load_balancer::backend::{HealthChange, HealthState, ServerId, ServerRecord};
use crate::observability::metrics;

/// Probe loops for the servers of one pool.
#[derive(Debug)]
pub struct HealthMonitor {
    pool: String,
    config: HealthCheckConfig,
    probe: Arc<dyn HealthProbe>,
    shutdown: ShutdownSignal,
    tasks: DashMap<ServerId, JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(
        pool: impl Into<String>,
        config: HealthCheckConfig,
        probe: Arc<dyn HealthProbe>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            pool: pool.into(),
            config,
            probe,
            shutdown,
            tasks: DashMap::new(),
        }
    }

    /// Start probing `server`. The first probe runs immediately.
    pub fn watch(&self, server: Arc<ServerRecord>) {
        if !self.config.enabled {
            tracing::debug!(pool = %self.pool, server = %server.id, "Active health checks disabled");
            return;
        }

        let interval = server.health_interval.unwrap_or_else(|| self.config.interval());
        let probe = self.probe.clone();
        let config = self.config.clone();
        let mut shutdown = self.shutdown.clone();
        let id = server.id.clone();

        tracing::info!(
            pool = %self.pool,
            server = %server.id,
            interval_ms = interval.as_millis() as u64,
            "Health monitor starting"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        check_server(probe.as_ref(), &server, &config).await;
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!(server = %server.id, "Health monitor received shutdown signal, exiting loop");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.tasks.insert(id, handle) {
            previous.abort();
        }
    }

    /// Stop probing one server.
    pub fn unwatch(&self, id: &ServerId) {
        if let Some((_, handle)) = self.tasks.remove(id) {
            handle.abort();
        }
    }

    /// Stop every probe loop.
    pub fn stop(&self) {
        self.tasks.retain(|_, handle| {
            handle.abort();
            false
        });
    }

    pub fn watched(&self) -> usize {
        self.tasks.len()
    }

    /// Run a single probe outside the schedule.
    pub async fn check_once(&self, server: &ServerRecord) -> HealthState {
        check_server(self.probe.as_ref(), server, &self.config).await
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Probe once, fold the result into the window, publish the new health.
pub async fn check_server(
    probe: &dyn HealthProbe,
    server: &ServerRecord,
    config: &HealthCheckConfig,
) -> HealthState {
    let timeout = server.health_timeout.unwrap_or_else(|| config.timeout());

    let (success, latency, cpu) = match time::timeout(timeout, probe.probe(server)).await {
        Ok(outcome) => {
            if !outcome.success {
                tracing::debug!(
                    server = %server.id,
                    details = outcome.details.as_deref().unwrap_or(""),
                    "Health check failed"
                );
            }
            (outcome.success, outcome.latency, outcome.cpu_utilization)
        }
        Err(_) => {
            tracing::debug!(server = %server.id, timeout_ms = timeout.as_millis() as u64, "Health check failed: timeout");
            (false, timeout, None)
        }
    };

    let HealthChange { previous, next } =
        server.record_probe(HealthCheckResult::new(success, latency), cpu, config.healthy_threshold);

    if previous != next {
        match next {
            HealthState::Healthy => tracing::info!(
                pool = %server.pool,
                server = %server.id,
                from = ?previous,
                to = ?next,
                "Server became healthy"
            ),
            _ => tracing::warn!(
                pool = %server.pool,
                server = %server.id,
                from = ?previous,
                to = ?next,
                "Server became unhealthy"
            ),
        }
    }

    metrics::record_backend_health(server.id.as_str(), next == HealthState::Healthy);
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::health::probe::ProbeOutcome;
    use crate::lifecycle::Shutdown;
    use crate::load_balancer::test_support::server_with;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays scripted outcomes, then repeats the last one.
    #[derive(Debug)]
    struct Scripted {
        outcomes: Mutex<VecDeque<bool>>,
        last: Mutex<bool>,
        delay: Duration,
    }

    impl Scripted {
        fn new(outcomes: &[bool]) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                last: Mutex::new(true),
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(&[])
            }
        }
    }

    #[async_trait]
    impl HealthProbe for Scripted {
        async fn probe(&self, _server: &ServerRecord) -> ProbeOutcome {
            if !self.delay.is_zero() {
                time::sleep(self.delay).await;
            }
            let next = self.outcomes.lock().pop_front();
            let ok = match next {
                Some(ok) => {
                    *self.last.lock() = ok;
                    ok
                }
                None => *self.last.lock(),
            };
            if ok {
                ProbeOutcome::healthy(Duration::from_millis(1))
            } else {
                ProbeOutcome::failed(Duration::from_millis(1), "scripted failure")
            }
        }
    }

    fn config() -> HealthCheckConfig {
        HealthCheckConfig {
            interval_ms: 1_000,
            timeout_ms: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_window_drives_health() {
        let server = server_with("a", |s| s);
        let probe = Scripted::new(&[true, true, false, true, true, false]);
        let cfg = config();

        let mut states = Vec::new();
        for _ in 0..6 {
            states.push(check_server(&probe, &server, &cfg).await);
        }
        // After 5: 4/5 healthy. After 6: window [T,F,T,T,F] = 3/5 unhealthy.
        assert_eq!(states[4], HealthState::Healthy);
        assert_eq!(states[5], HealthState::Unhealthy);
        assert_eq!(server.health(), HealthState::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let server = server_with("a", |s| s);
        let probe = Scripted::slow(Duration::from_secs(5));
        let state = check_server(&probe, &server, &config()).await;
        assert_eq!(state, HealthState::Unhealthy);
        assert!(!server.recent_probes()[0].success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_probes_on_schedule_until_unwatched() {
        let shutdown = Shutdown::new();
        let monitor = HealthMonitor::new(
            "test",
            config(),
            Arc::new(Scripted::new(&[false])),
            shutdown.subscribe(),
        );
        let server = server_with("a", |s| s);
        monitor.watch(server.clone());
        assert_eq!(monitor.watched(), 1);

        time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(server.recent_probes().len(), 3);
        assert_eq!(server.health(), HealthState::Unhealthy);

        monitor.unwatch(&server.id);
        time::sleep(Duration::from_millis(3_000)).await;
        assert_eq!(server.recent_probes().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_loops() {
        let shutdown = Shutdown::new();
        let monitor = HealthMonitor::new("test", config(), Arc::new(Scripted::new(&[])), shutdown.subscribe());
        let server = server_with("a", |s| s);
        monitor.watch(server.clone());
        time::sleep(Duration::from_millis(10)).await;

        shutdown.trigger();
        time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(server.recent_probes().len(), 1);
    }
}
