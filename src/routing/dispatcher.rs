//! Request dispatcher.
//!
//! # Responsibilities
//! - Composition root: registry, upstream, and per-pool resilience state
//! - Run one routed request through session, selection, breaker, rate limit,
//!   connection guard, upstream call and failover
//! - Expose the administrative surface of the balancer
//!
//! # Design Decisions
//! - The downstream call runs in its own task so the connection guard and the
//!   breaker outcome are settled when the call resolves, even after the
//!   request itself has timed out
//! - Every request ends in exactly one response or exactly one `RouteError`

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant};

use crate::config::{BalancerConfig, PoolSettings, ServerSpec};
use crate::error::{AttemptFailure, ConfigurationError, FailureReason, RouteError};
use crate::health::probe::HealthProbe;
use crate::load_balancer::backend::{HealthState, ServerId, ServerRecord};
use crate::load_balancer::pool::{Pool, PoolRegistry, PoolStatus, ServerStatus};
use crate::load_balancer::registry::StrategyRegistry;
use crate::observability::metrics;
use crate::observability::{Alert, OutcomeEvent};
use crate::resilience::{AttemptOutcome, Deadline};
use crate::routing::context::RequestContext;
use crate::routing::upstream::{cancel_pair, Upstream, UpstreamError, UpstreamRequest, UpstreamResponse};

/// Default end-to-end budget for a routed request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A successfully routed request.
#[derive(Debug, Clone)]
pub struct Routed {
    pub server: ServerId,
    /// Attempts made, the successful one included.
    pub attempts: u32,
    /// Failed attempts that preceded the success.
    pub failures: Vec<AttemptFailure>,
    pub response: UpstreamResponse,
}

/// Session binding state for one request.
enum Binding {
    Unbound,
    /// Bound server is eligible; the first attempt goes there.
    Pinned(Arc<ServerRecord>),
    /// Bound server is live but momentarily full; keep the binding.
    Saturated,
}

#[derive(Debug)]
pub struct Dispatcher {
    registry: PoolRegistry,
    upstream: Arc<dyn Upstream>,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(upstream: Arc<dyn Upstream>, probe: Arc<dyn HealthProbe>) -> Self {
        Self::with_strategies(upstream, probe, StrategyRegistry::builtin())
    }

    pub fn with_strategies(
        upstream: Arc<dyn Upstream>,
        probe: Arc<dyn HealthProbe>,
        strategies: StrategyRegistry,
    ) -> Self {
        Self {
            registry: PoolRegistry::new(strategies, probe),
            upstream,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Budget used when a request carries no deadline of its own.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Create every configured pool and register its servers.
    pub fn from_config(
        config: &BalancerConfig,
        upstream: Arc<dyn Upstream>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self, ConfigurationError> {
        let dispatcher = Self::new(upstream, probe).with_request_timeout(config.listener.request_timeout());
        for pool in &config.pools {
            dispatcher.create_pool(&pool.id, pool.settings(&config.defaults))?;
            for server in &pool.servers {
                dispatcher.add_server(&pool.id, server)?;
            }
        }
        Ok(dispatcher)
    }

    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    // --- Administrative surface ---

    pub fn create_pool(&self, id: &str, settings: PoolSettings) -> Result<(), ConfigurationError> {
        self.registry.create_pool(id, settings).map(|_| ())
    }

    pub fn remove_pool(&self, id: &str) -> bool {
        self.registry.remove_pool(id)
    }

    pub fn add_server(&self, pool_id: &str, spec: &ServerSpec) -> Result<ServerId, ConfigurationError> {
        self.registry.add_server(pool_id, spec)
    }

    pub async fn remove_server(&self, id: &str, force: bool) -> Result<bool, ConfigurationError> {
        self.registry.remove_server(id, force).await
    }

    pub fn set_maintenance(&self, id: &str, enabled: bool) -> Result<(), ConfigurationError> {
        self.registry.set_maintenance(id, enabled)
    }

    pub fn pool_status(&self, id: &str) -> Result<PoolStatus, ConfigurationError> {
        self.registry.pool_status(id)
    }

    pub fn server_status(&self, id: &str) -> Result<ServerStatus, ConfigurationError> {
        self.registry.server_status(id)
    }

    pub fn pool_alerts(&self, id: &str) -> Result<Vec<Alert>, ConfigurationError> {
        Ok(self.registry.pool(id)?.alerts())
    }

    pub fn pool_ids(&self) -> Vec<String> {
        self.registry.pool_ids()
    }

    pub async fn probe_server(&self, id: &str) -> Result<HealthState, ConfigurationError> {
        self.registry.probe_server(id).await
    }

    /// Stop every pool's background tasks.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }

    // --- Runtime surface ---

    /// Route one request through `pool_id`.
    pub async fn route(&self, pool_id: &str, ctx: RequestContext) -> Result<Routed, RouteError> {
        let started = Instant::now();
        let pool = self.registry.pool(pool_id)?;
        let deadline = ctx.deadline.unwrap_or_else(|| Deadline::after(self.request_timeout));
        let request = Arc::new(ctx.request.clone());
        let selection = ctx.selection();

        let binding = match ctx.session_key.as_deref() {
            Some(key) => self.bound_server(&pool, key),
            None => Binding::Unbound,
        };
        let pinned = match &binding {
            Binding::Pinned(server) => Some(server.clone()),
            _ => None,
        };

        let result = pool
            .failover
            .execute(deadline, |n, excluded| {
                let pinned = if n == 1 { pinned.clone() } else { None };
                let pool = pool.clone();
                let request = request.clone();
                async move {
                    let server = match pinned {
                        Some(server) => server,
                        None => match pool.select(&selection, &excluded) {
                            Ok(server) => server,
                            Err(err) => return AttemptOutcome::Exhausted(err),
                        },
                    };
                    self.attempt(&pool, server, request, deadline).await
                }
            })
            .await;

        match result {
            Ok(done) => {
                let (server, response) = done.value;
                if let Some(key) = ctx.session_key.as_deref().filter(|_| !matches!(binding, Binding::Saturated)) {
                    if pool.sessions.lookup(key).as_ref() != Some(&server) {
                        pool.sessions.bind(key, server.clone());
                    }
                }
                tracing::debug!(
                    pool = %pool.id,
                    server = %server,
                    attempts = done.attempts,
                    status = response.status,
                    "Request routed"
                );
                Ok(Routed {
                    server,
                    attempts: done.attempts,
                    failures: done.failures,
                    response,
                })
            }
            Err(err) => {
                if matches!(
                    err,
                    RouteError::NoServerAvailable { .. } | RouteError::CircuitOpen { .. } | RouteError::RateLimited { .. }
                ) {
                    metrics::record_request(&pool.id, "none", err.kind(), started.elapsed());
                }
                if let RouteError::RateLimited { scope } = &err {
                    metrics::record_rate_limited(scope);
                }
                tracing::warn!(pool = %pool.id, kind = err.kind(), error = %err, "Request failed");
                Err(err)
            }
        }
    }

    /// Resolve the session binding for `key`.
    ///
    /// A binding is stale when its server left the pool, stopped serving
    /// (unhealthy, draining, maintenance) or has an open breaker; stale
    /// bindings are dropped. A server that is only at capacity, out of
    /// rate-limit room or out of half-open trial slots keeps its binding but
    /// is skipped for this request.
    fn bound_server(&self, pool: &Pool, key: &str) -> Binding {
        let Some(id) = pool.sessions.lookup(key) else {
            return Binding::Unbound;
        };
        match pool.find(&id) {
            Some(server) if pool.is_eligible(&server) => Binding::Pinned(server),
            Some(server) if server.is_serving() && !pool.breakers.is_rejecting(&server.id) => {
                tracing::debug!(pool = %pool.id, server = %id, "Session server saturated, selecting another for this request");
                Binding::Saturated
            }
            _ => {
                pool.sessions.unbind(key);
                tracing::debug!(pool = %pool.id, server = %id, "Dropping stale session binding");
                Binding::Unbound
            }
        }
    }

    /// One attempt against one server.
    async fn attempt(
        &self,
        pool: &Arc<Pool>,
        server: Arc<ServerRecord>,
        request: Arc<UpstreamRequest>,
        deadline: Deadline,
    ) -> AttemptOutcome<(ServerId, UpstreamResponse)> {
        let failed = |reason: FailureReason| {
            AttemptOutcome::Failed(AttemptFailure {
                server: server.id.clone(),
                reason,
            })
        };

        let breaker = pool.breakers.get_or_create(&server.id);
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(reason) => return failed(reason),
        };
        let Some(guard) = server.try_create_guard() else {
            breaker.release(permit);
            return failed(FailureReason::AtCapacity);
        };
        if let Err(scope) = pool.limiter.try_acquire(&server) {
            breaker.release(permit);
            drop(guard);
            metrics::record_rate_limited(&scope);
            return failed(FailureReason::RateLimited);
        }

        let attempt_deadline = deadline.bounded(pool.settings().failover.attempt_timeout());
        let (cancel, signal) = cancel_pair();
        let retry_on_status = pool.settings().failover.retry_on_status.clone();
        let upstream = self.upstream.clone();
        let task_pool = pool.clone();

        let mut call = tokio::spawn(async move {
            let server = guard.server.clone();
            let started = Instant::now();
            let result = upstream.call(&server, &request, signal.clone()).await;
            let latency = started.elapsed();

            let outcome = if signal.is_cancelled() {
                Err(FailureReason::Timeout)
            } else {
                match result {
                    Ok(response) if retry_on_status.contains(&response.status) => Err(FailureReason::Downstream(
                        UpstreamError::Status(response.status).to_string(),
                    )),
                    Ok(response) => Ok(response),
                    Err(err) => Err(FailureReason::Downstream(err.to_string())),
                }
            };

            let success = outcome.is_ok();
            if success {
                breaker.record_success(permit);
            } else {
                breaker.record_failure(permit);
            }
            server.observe_response(latency, success);
            task_pool.aggregator.record(OutcomeEvent {
                server: server.id.clone(),
                success,
                latency,
                outcome: match &outcome {
                    Ok(_) => "success",
                    Err(FailureReason::Timeout) => "timeout",
                    Err(_) => "downstream_error",
                },
            });
            drop(guard);
            outcome
        });

        match time::timeout_at(attempt_deadline.instant(), &mut call).await {
            Ok(Ok(Ok(response))) => AttemptOutcome::Success((server.id.clone(), response)),
            Ok(Ok(Err(reason))) => failed(reason),
            Ok(Err(join)) => failed(FailureReason::Downstream(join.to_string())),
            Err(_) => {
                cancel.cancel();
                tracing::debug!(pool = %pool.id, server = %server.id, "Attempt timed out, call cancelled");
                failed(FailureReason::Timeout)
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.registry.shutdown();
    }
}
