//! Pool and server registry.
//!
//! # Responsibilities
//! - Own each pool's members, strategy and per-server resilience state
//! - Compute the eligible set and hand it to the pool's strategy
//! - Register, drain, and remove servers; keep server ids unique across pools
//! - Start and stop the pool's background tasks (probes, session sweep, rollup)
//!
//! # Design Decisions
//! - Membership is an `ArcSwap` snapshot; routing never takes a pool-wide lock
//! - Pools are independent; the registry map is only touched on lookup
//! - Removal drains first: the server stops receiving traffic immediately and
//!   its breaker, rate-limit and session state are discarded afterwards

use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::validation::{join_errors, validate_pool_settings, validate_server};
use crate::config::{PoolSettings, ServerSpec};
use crate::error::{ConfigurationError, RouteError};
use crate::health::probe::HealthProbe;
use crate::health::state::ProbeSummary;
use crate::health::HealthMonitor;
use crate::lifecycle::Shutdown;
use crate::load_balancer::backend::{HealthState, LifecycleState, ServerId, ServerRecord};
use crate::load_balancer::registry::StrategyRegistry;
use crate::load_balancer::{LoadBalancer, SelectionContext};
use crate::observability::{Alert, MetricsAggregator, PoolStats, ServerStats};
use crate::resilience::{CircuitBreakers, CircuitSnapshot, FailoverCoordinator};
use crate::security::rate_limit::RateLimiter;
use crate::session::SessionStore;

/// Point-in-time view of one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub id: ServerId,
    pub pool: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub max_connections: usize,
    pub state: LifecycleState,
    pub active_connections: usize,
    pub avg_response_ms: f64,
    pub error_rate: f64,
    pub availability: f64,
    pub cpu_utilization: Option<f64>,
    pub circuit: CircuitSnapshot,
    /// Admissions in the current rate-limit window.
    pub rate_window: usize,
    pub stats: ServerStats,
    pub recent_probes: Vec<ProbeSummary>,
}

/// Point-in-time view of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub id: String,
    pub algorithm: String,
    pub servers: Vec<ServerStatus>,
    pub stats: PoolStats,
    pub active_alerts: Vec<Alert>,
    pub session_bindings: usize,
}

/// A named group of servers sharing one strategy and one rule set.
#[derive(Debug)]
pub struct Pool {
    pub id: String,
    settings: PoolSettings,
    members: ArcSwap<Vec<Arc<ServerRecord>>>,
    strategy: Box<dyn LoadBalancer>,
    pub(crate) breakers: CircuitBreakers,
    pub(crate) limiter: RateLimiter,
    pub(crate) sessions: Arc<SessionStore>,
    pub(crate) aggregator: MetricsAggregator,
    pub(crate) failover: FailoverCoordinator,
    health: HealthMonitor,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Build a pool and start its background tasks. Must run inside a Tokio runtime.
    pub fn start(
        id: impl Into<String>,
        settings: PoolSettings,
        strategy: Box<dyn LoadBalancer>,
        probe: Arc<dyn HealthProbe>,
    ) -> Arc<Self> {
        let id = id.into();
        let shutdown = Shutdown::new();

        let pool = Arc::new(Self {
            breakers: CircuitBreakers::new(settings.circuit_breaker.clone()),
            limiter: RateLimiter::new(&id, settings.rate_limit.clone()),
            sessions: Arc::new(SessionStore::new(settings.session.ttl())),
            aggregator: MetricsAggregator::new(id.clone(), settings.alerts.clone()),
            failover: FailoverCoordinator::new(id.clone(), &settings.failover),
            health: HealthMonitor::new(id.clone(), settings.health_check.clone(), probe, shutdown.subscribe()),
            members: ArcSwap::from_pointee(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            strategy,
            shutdown,
            settings,
            id,
        });

        let sweeper = pool
            .sessions
            .spawn_sweeper(pool.settings.session.sweep_interval(), pool.shutdown.subscribe());
        let rollup = pool.spawn_rollup();
        pool.tasks.lock().extend([sweeper, rollup]);

        tracing::info!(pool = %pool.id, algorithm = pool.strategy.name(), "Pool created");
        pool
    }

    fn spawn_rollup(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Pool> = Arc::downgrade(self);
        let period = self.settings.alerts.rollup_interval();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(pool) = weak.upgrade() else { break };
                        pool.aggregator.rollup(&pool.members());
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn algorithm(&self) -> &'static str {
        self.strategy.name()
    }

    /// Current members in registration order.
    pub fn members(&self) -> Arc<Vec<Arc<ServerRecord>>> {
        self.members.load_full()
    }

    pub fn find(&self, id: &ServerId) -> Option<Arc<ServerRecord>> {
        self.members.load().iter().find(|s| &s.id == id).cloned()
    }

    fn add_member(&self, server: Arc<ServerRecord>) {
        let added = server.clone();
        self.members.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(added.clone());
            next
        });
        self.strategy.rebuild(&self.members());
        self.health.watch(server);
    }

    /// Take a server out of the pool and drop every piece of state keyed by it.
    fn detach_member(&self, id: &ServerId) -> Option<Arc<ServerRecord>> {
        let removed = self.find(id)?;
        self.members.rcu(|current| {
            current
                .iter()
                .filter(|s| &s.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
        self.strategy.rebuild(&self.members());
        self.health.unwatch(id);
        self.breakers.remove(id);
        self.limiter.forget(id);
        let unbound = self.sessions.unbind_server(id);
        self.aggregator.forget(id);
        tracing::debug!(pool = %self.id, server = %id, unbound, "Server state discarded");
        Some(removed)
    }

    /// Lifecycle, capacity, breaker and rate-limit checks combined.
    pub fn is_eligible(&self, server: &ServerRecord) -> bool {
        server.is_routable() && self.breakers.would_admit(&server.id) && self.limiter.has_room(server)
    }

    /// Pick a server for one attempt, avoiding `excluded` when anything else is eligible.
    pub fn select(
        &self,
        ctx: &SelectionContext<'_>,
        excluded: &[ServerId],
    ) -> Result<Arc<ServerRecord>, RouteError> {
        let members = self.members();
        let eligible: Vec<Arc<ServerRecord>> = members.iter().filter(|s| self.is_eligible(s)).cloned().collect();
        if eligible.is_empty() {
            return Err(self.classify_empty(&members));
        }

        let fresh: Vec<Arc<ServerRecord>> =
            eligible.iter().filter(|s| !excluded.contains(&s.id)).cloned().collect();
        let candidates = if fresh.is_empty() { &eligible } else { &fresh };

        self.strategy
            .next_server(candidates, ctx)
            .ok_or_else(|| RouteError::NoServerAvailable { pool: self.id.clone() })
    }

    /// Explain an empty eligible set by the first gate that emptied it.
    fn classify_empty(&self, members: &[Arc<ServerRecord>]) -> RouteError {
        let routable: Vec<&Arc<ServerRecord>> = members.iter().filter(|s| s.is_routable()).collect();
        if routable.is_empty() {
            return RouteError::NoServerAvailable { pool: self.id.clone() };
        }
        if !routable.iter().any(|s| self.breakers.would_admit(&s.id)) {
            return RouteError::CircuitOpen { pool: self.id.clone() };
        }
        let scope = if self.limiter.pool_has_room(Instant::now()) {
            routable
                .iter()
                .find(|s| self.breakers.would_admit(&s.id))
                .map(|s| s.id.to_string())
                .unwrap_or_else(|| self.id.clone())
        } else {
            format!("pool:{}", self.id)
        };
        RouteError::RateLimited { scope }
    }

    pub async fn check_once(&self, server: &ServerRecord) -> HealthState {
        self.health.check_once(server).await
    }

    pub fn server_status(&self, server: &ServerRecord) -> ServerStatus {
        let runtime = server.metrics();
        ServerStatus {
            id: server.id.clone(),
            pool: self.id.clone(),
            host: server.host.clone(),
            port: server.port,
            weight: server.weight,
            max_connections: server.max_connections,
            state: server.state(),
            active_connections: server.active_connections(),
            avg_response_ms: runtime.avg_response_ms,
            error_rate: runtime.error_rate,
            availability: runtime.availability,
            cpu_utilization: runtime.cpu_utilization,
            circuit: self.breakers.snapshot(&server.id),
            rate_window: self.limiter.in_window(&server.id),
            stats: self.aggregator.server_stats(&server.id),
            recent_probes: server.recent_probes(),
        }
    }

    pub fn status(&self) -> PoolStatus {
        let members = self.members();
        PoolStatus {
            id: self.id.clone(),
            algorithm: self.strategy.name().to_string(),
            servers: members.iter().map(|s| self.server_status(s)).collect(),
            stats: self.aggregator.stats(&members),
            active_alerts: self.aggregator.active_alerts(),
            session_bindings: self.sessions.len(),
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.aggregator.alert_history()
    }

    /// Stop every background task of this pool.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
        self.health.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!(pool = %self.id, "Pool stopped");
    }
}

/// Every pool plus a global server-id index.
#[derive(Debug)]
pub struct PoolRegistry {
    pools: DashMap<String, Arc<Pool>>,
    servers: DashMap<ServerId, String>,
    strategies: StrategyRegistry,
    probe: Arc<dyn HealthProbe>,
}

impl PoolRegistry {
    pub fn new(strategies: StrategyRegistry, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            pools: DashMap::new(),
            servers: DashMap::new(),
            strategies,
            probe,
        }
    }

    pub fn create_pool(&self, id: &str, settings: PoolSettings) -> Result<Arc<Pool>, ConfigurationError> {
        if id.trim().is_empty() {
            return Err(ConfigurationError::Invalid("pool id must not be empty".to_string()));
        }
        let errors = validate_pool_settings(&settings, &format!("pool '{}'", id));
        if !errors.is_empty() {
            return Err(ConfigurationError::Invalid(join_errors(&errors)));
        }
        let strategy = self.strategies.resolve(&settings)?;

        match self.pools.entry(id.to_string()) {
            Entry::Occupied(_) => Err(ConfigurationError::PoolAlreadyExists(id.to_string())),
            Entry::Vacant(slot) => {
                let pool = Pool::start(id, settings, strategy, self.probe.clone());
                slot.insert(pool.clone());
                Ok(pool)
            }
        }
    }

    /// Stop a pool and forget all of its servers. Returns whether it existed.
    pub fn remove_pool(&self, id: &str) -> bool {
        let Some((_, pool)) = self.pools.remove(id) else {
            return false;
        };
        for server in pool.members().iter() {
            server.begin_drain();
            self.servers.remove(&server.id);
        }
        pool.shutdown();
        true
    }

    pub fn pool(&self, id: &str) -> Result<Arc<Pool>, ConfigurationError> {
        self.pools
            .get(id)
            .map(|p| p.value().clone())
            .ok_or_else(|| ConfigurationError::PoolNotFound(id.to_string()))
    }

    pub fn pool_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pools.iter().map(|p| p.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Register a server in state `unknown`.
    pub fn add_server(&self, pool_id: &str, spec: &ServerSpec) -> Result<ServerId, ConfigurationError> {
        let pool = self.pool(pool_id)?;
        let errors = validate_server(spec, &format!("pool '{}'", pool_id));
        if !errors.is_empty() {
            return Err(ConfigurationError::Invalid(join_errors(&errors)));
        }
        let record = Arc::new(ServerRecord::new(
            pool_id,
            spec,
            pool.settings.health_check.window_size,
        )?);

        match self.servers.entry(record.id.clone()) {
            Entry::Occupied(_) => return Err(ConfigurationError::DuplicateServer(record.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(pool_id.to_string());
            }
        }

        let id = record.id.clone();
        pool.add_member(record);
        tracing::info!(pool = %pool_id, server = %id, host = %spec.host, port = spec.port, "Server added");
        Ok(id)
    }

    /// Owning pool and record for a server id.
    pub fn server(&self, id: &str) -> Result<(Arc<Pool>, Arc<ServerRecord>), ConfigurationError> {
        let pool_id = self
            .servers
            .get(id)
            .map(|p| p.value().clone())
            .ok_or_else(|| ConfigurationError::ServerNotFound(id.to_string()))?;
        let pool = self.pool(&pool_id)?;
        let server = pool
            .find(&ServerId::new(id))
            .ok_or_else(|| ConfigurationError::ServerNotFound(id.to_string()))?;
        Ok((pool, server))
    }

    /// Drain and remove a server.
    ///
    /// The server stops receiving new traffic at once. Without `force` this
    /// waits for its in-flight calls to finish, up to the pool's drain grace.
    /// Returns `true` when the server was idle at removal, `false` when calls
    /// were still in flight (forced, or the grace period ran out).
    pub async fn remove_server(&self, id: &str, force: bool) -> Result<bool, ConfigurationError> {
        let (pool, server) = self.server(id)?;
        server.begin_drain();
        tracing::info!(
            pool = %pool.id,
            server = %server.id,
            force,
            active = server.active_connections(),
            "Draining server"
        );

        let clean = if force {
            server.active_connections() == 0
        } else {
            time::timeout(pool.settings.drain.grace(), server.wait_idle()).await.is_ok()
        };

        pool.detach_member(&server.id);
        self.servers.remove(&server.id);

        if clean {
            tracing::info!(pool = %pool.id, server = %server.id, "Server removed");
        } else {
            tracing::warn!(
                pool = %pool.id,
                server = %server.id,
                active = server.active_connections(),
                "Server removed with calls still in flight"
            );
        }
        Ok(clean)
    }

    pub fn set_maintenance(&self, id: &str, enabled: bool) -> Result<(), ConfigurationError> {
        let (pool, server) = self.server(id)?;
        if !server.set_maintenance(enabled) {
            return Err(ConfigurationError::Invalid(format!("server '{}' is draining", id)));
        }
        tracing::info!(pool = %pool.id, server = %server.id, enabled, "Maintenance mode changed");
        Ok(())
    }

    pub fn pool_status(&self, id: &str) -> Result<PoolStatus, ConfigurationError> {
        Ok(self.pool(id)?.status())
    }

    pub fn server_status(&self, id: &str) -> Result<ServerStatus, ConfigurationError> {
        let (pool, server) = self.server(id)?;
        Ok(pool.server_status(&server))
    }

    /// Probe a server immediately, outside its schedule.
    pub async fn probe_server(&self, id: &str) -> Result<HealthState, ConfigurationError> {
        let (pool, server) = self.server(id)?;
        Ok(pool.check_once(&server).await)
    }

    pub fn shutdown(&self) {
        for pool in self.pools.iter() {
            pool.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::CircuitBreakerConfig;
    use crate::health::probe::ProbeOutcome;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct AlwaysUp;

    #[async_trait]
    impl HealthProbe for AlwaysUp {
        async fn probe(&self, _server: &ServerRecord) -> ProbeOutcome {
            ProbeOutcome::healthy(Duration::from_millis(1))
        }
    }

    fn registry() -> PoolRegistry {
        PoolRegistry::new(StrategyRegistry::builtin(), Arc::new(AlwaysUp))
    }

    fn quiet_settings() -> PoolSettings {
        let mut settings = PoolSettings::default();
        settings.health_check.enabled = false;
        settings
    }

    #[tokio::test]
    async fn test_create_pool_rejects_duplicates_and_unknown_algorithms() {
        let reg = registry();
        reg.create_pool("web", quiet_settings()).unwrap();
        assert_eq!(
            reg.create_pool("web", quiet_settings()).unwrap_err(),
            ConfigurationError::PoolAlreadyExists("web".into())
        );
        let mut unknown = quiet_settings();
        unknown.algorithm = "fastest".to_string();
        assert_eq!(
            reg.create_pool("api", unknown).unwrap_err(),
            ConfigurationError::UnknownAlgorithm("fastest".into())
        );
        assert_eq!(reg.pool_ids(), vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn test_server_ids_unique_across_pools() {
        let reg = registry();
        reg.create_pool("a", quiet_settings()).unwrap();
        reg.create_pool("b", quiet_settings()).unwrap();
        reg.add_server("a", &ServerSpec::new("s1", "10.0.0.1", 80)).unwrap();
        let err = reg.add_server("b", &ServerSpec::new("s1", "10.0.0.2", 80)).unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateServer(ServerId::new("s1")));
        assert!(matches!(
            reg.add_server("missing", &ServerSpec::new("s2", "10.0.0.2", 80)),
            Err(ConfigurationError::PoolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_select_skips_excluded_when_possible() {
        let reg = registry();
        let pool = reg.create_pool("web", quiet_settings()).unwrap();
        reg.add_server("web", &ServerSpec::new("a", "10.0.0.1", 80)).unwrap();
        reg.add_server("web", &ServerSpec::new("b", "10.0.0.2", 80)).unwrap();

        let ctx = SelectionContext::default();
        for _ in 0..4 {
            let picked = pool.select(&ctx, &[ServerId::new("a")]).unwrap();
            assert_eq!(picked.id.as_str(), "b");
        }
        // Everything excluded: fall back to the full eligible set.
        let picked = pool.select(&ctx, &[ServerId::new("a"), ServerId::new("b")]);
        assert!(picked.is_ok());
    }

    #[tokio::test]
    async fn test_empty_eligible_set_is_classified() {
        let reg = registry();
        let mut settings = quiet_settings();
        settings.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        };
        let pool = reg.create_pool("web", settings).unwrap();
        let ctx = SelectionContext::default();

        assert!(matches!(pool.select(&ctx, &[]), Err(RouteError::NoServerAvailable { .. })));

        reg.add_server("web", &ServerSpec::new("a", "10.0.0.1", 80)).unwrap();
        let breaker = pool.breakers.get_or_create(&ServerId::new("a"));
        let permit = breaker.try_acquire().unwrap();
        breaker.record_failure(permit);
        assert!(matches!(pool.select(&ctx, &[]), Err(RouteError::CircuitOpen { .. })));

        reg.set_maintenance("a", true).unwrap();
        assert!(matches!(pool.select(&ctx, &[]), Err(RouteError::NoServerAvailable { .. })));
    }

    #[tokio::test]
    async fn test_remove_server_discards_state() {
        let reg = registry();
        let pool = reg.create_pool("web", quiet_settings()).unwrap();
        reg.add_server("web", &ServerSpec::new("a", "10.0.0.1", 80)).unwrap();
        pool.breakers.get_or_create(&ServerId::new("a"));
        pool.sessions.bind("user-1", ServerId::new("a"));

        assert!(reg.remove_server("a", false).await.unwrap());
        assert!(pool.members().is_empty());
        assert!(pool.breakers.is_empty());
        assert!(pool.sessions.is_empty());
        assert!(matches!(reg.server_status("a"), Err(ConfigurationError::ServerNotFound(_))));
        // The id is free again.
        reg.add_server("web", &ServerSpec::new("a", "10.0.0.1", 80)).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_server_waits_for_in_flight_calls() {
        let reg = Arc::new(registry());
        let pool = reg.create_pool("web", quiet_settings()).unwrap();
        reg.add_server("web", &ServerSpec::new("a", "10.0.0.1", 80)).unwrap();
        let guard = pool.find(&ServerId::new("a")).unwrap().try_create_guard().unwrap();

        let removal = tokio::spawn({
            let reg = reg.clone();
            async move { reg.remove_server("a", false).await }
        });
        time::sleep(Duration::from_secs(1)).await;
        assert!(!removal.is_finished());
        assert!(pool.select(&SelectionContext::default(), &[]).is_err());

        drop(guard);
        assert!(removal.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_remove_pool_frees_server_ids() {
        let reg = registry();
        reg.create_pool("web", quiet_settings()).unwrap();
        reg.add_server("web", &ServerSpec::new("a", "10.0.0.1", 80)).unwrap();
        assert!(reg.remove_pool("web"));
        assert!(!reg.remove_pool("web"));
        reg.create_pool("web", quiet_settings()).unwrap();
        reg.add_server("web", &ServerSpec::new("a", "10.0.0.1", 80)).unwrap();
    }
}
