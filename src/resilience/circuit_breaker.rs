//! Circuit breaker for server protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: server assumed down, requests fail fast
//! - Half-Open: testing if server recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold (each success decays the count by one)
//! Open → Half-Open: first evaluation at or after next_attempt
//! Half-Open → Closed: success_threshold trial successes
//! Half-Open → Open: any trial failure
//! ```
//!
//! # Design Decisions
//! - Per-server circuit breaker (not global), created lazily
//! - Fail fast in Open state (no waiting for timeout)
//! - Every transition happens under the breaker's own lock, so exactly one
//!   caller wins the move out of Open
//! - Permits carry the generation they were issued in; outcomes reported
//!   against an older generation are ignored

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::FailureReason;
use crate::load_balancer::backend::ServerId;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`].
///
/// Hand it back through exactly one of `record_success`, `record_failure`
/// or `release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct CallPermit {
    generation: u64,
    trial: bool,
}

impl CallPermit {
    /// Whether this call is a half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// Serializable view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_in_flight: u32,
    /// Time until a trial is allowed, while open.
    pub retry_in_ms: Option<u64>,
}

impl Default for CircuitSnapshot {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_in_flight: 0,
            retry_in_ms: None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    in_flight: u32,
    next_attempt: Option<Instant>,
    generation: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    server: ServerId,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(server: ServerId, config: CircuitBreakerConfig) -> Self {
        Self {
            server,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                in_flight: 0,
                next_attempt: None,
                generation: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether `try_acquire` would currently succeed. Does not transition.
    pub fn would_admit(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner.next_attempt.map_or(true, |at| Instant::now() >= at),
            CircuitState::HalfOpen => inner.in_flight < self.config.half_open_limit,
        }
    }

    /// Open and still inside the recovery timeout.
    pub fn is_rejecting(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == CircuitState::Open && inner.next_attempt.is_some_and(|at| Instant::now() < at)
    }

    /// Admit a call or reject it with `CircuitOpen`.
    pub fn try_acquire(&self) -> Result<CallPermit, FailureReason> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(CallPermit {
                generation: inner.generation,
                trial: false,
            }),
            CircuitState::Open => {
                let ready = inner.next_attempt.map_or(true, |at| Instant::now() >= at);
                if !ready {
                    return Err(FailureReason::CircuitOpen);
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.in_flight = 1;
                Ok(CallPermit {
                    generation: inner.generation,
                    trial: true,
                })
            }
            CircuitState::HalfOpen => {
                if inner.in_flight >= self.config.half_open_limit {
                    return Err(FailureReason::CircuitOpen);
                }
                inner.in_flight += 1;
                Ok(CallPermit {
                    generation: inner.generation,
                    trial: true,
                })
            }
        }
    }

    pub fn record_success(&self, permit: CallPermit) {
        let mut inner = self.inner.lock();
        if permit.generation != inner.generation {
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                inner.in_flight = inner.in_flight.saturating_sub(1);
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold() {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, permit: CallPermit) {
        let mut inner = self.inner.lock();
        if permit.generation != inner.generation {
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Return a permit whose call never reached the server.
    pub fn release(&self, permit: CallPermit) {
        let mut inner = self.inner.lock();
        if permit.trial && permit.generation == inner.generation && inner.state == CircuitState::HalfOpen {
            inner.in_flight = inner.in_flight.saturating_sub(1);
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        let retry_in_ms = match (inner.state, inner.next_attempt) {
            (CircuitState::Open, Some(at)) => {
                Some(at.saturating_duration_since(Instant::now()).as_millis() as u64)
            }
            _ => None,
        };
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_in_flight: inner.in_flight,
            retry_in_ms,
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.success_count = 0;
        inner.in_flight = 0;

        match to {
            CircuitState::Open => {
                inner.next_attempt = Some(Instant::now() + self.config.recovery_timeout());
                tracing::warn!(
                    server = %self.server,
                    from = ?from,
                    failures = inner.failure_count,
                    recovery_ms = self.config.recovery_timeout_ms,
                    "Circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.next_attempt = None;
                tracing::info!(server = %self.server, "Circuit half-open, admitting trial requests");
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.next_attempt = None;
                tracing::info!(server = %self.server, "Circuit closed");
            }
        }
        metrics::record_circuit_state(self.server.as_str(), to);
    }
}

/// Breakers for one pool, created on first reference to a server id.
#[derive(Debug)]
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: DashMap<ServerId, Arc<CircuitBreaker>>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, id: &ServerId) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(id) {
            return breaker.clone();
        }
        self.breakers
            .entry(id.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(id.clone(), self.config.clone())))
            .clone()
    }

    /// Peek without creating state; an unseen server is closed.
    pub fn would_admit(&self, id: &ServerId) -> bool {
        self.breakers.get(id).map_or(true, |b| b.would_admit())
    }

    /// Whether the server's breaker is open and not yet due a trial.
    pub fn is_rejecting(&self, id: &ServerId) -> bool {
        self.breakers.get(id).is_some_and(|b| b.is_rejecting())
    }

    pub fn snapshot(&self, id: &ServerId) -> CircuitSnapshot {
        self.breakers.get(id).map(|b| b.snapshot()).unwrap_or_default()
    }

    pub fn remove(&self, id: &ServerId) {
        self.breakers.remove(id);
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time;

    fn breaker(limit: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            ServerId::new("a"),
            CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout_ms: 1_000,
                half_open_limit: limit,
            },
        )
    }

    fn fail(cb: &CircuitBreaker) {
        let permit = cb.try_acquire().unwrap();
        cb.record_failure(permit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker(2);
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.try_acquire(), Err(FailureReason::CircuitOpen));
        assert!(!cb.would_admit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_decays_instead_of_resetting() {
        let cb = breaker(2);
        fail(&cb);
        fail(&cb);
        let permit = cb.try_acquire().unwrap();
        cb.record_success(permit);
        assert_eq!(cb.snapshot().failure_count, 1);

        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_transition_to_half_open() {
        let cb = breaker(1);
        for _ in 0..3 {
            fail(&cb);
        }
        time::advance(Duration::from_millis(999)).await;
        assert!(cb.try_acquire().is_err());

        time::advance(Duration::from_millis(1)).await;
        assert!(cb.would_admit());
        let trial = cb.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Limit of one: a second concurrent caller cannot also get through.
        assert!(cb.try_acquire().is_err());
        cb.record_success(trial);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_successes_close_and_reset() {
        let cb = breaker(2);
        for _ in 0..3 {
            fail(&cb);
        }
        time::advance(Duration::from_secs(1)).await;

        let first = cb.try_acquire().unwrap();
        let second = cb.try_acquire().unwrap();
        cb.record_success(first);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success(second);

        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_deadline() {
        let cb = breaker(3);
        for _ in 0..3 {
            fail(&cb);
        }
        time::advance(Duration::from_secs(1)).await;
        let trial = cb.try_acquire().unwrap();
        let late = cb.try_acquire().unwrap();
        cb.record_failure(trial);

        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.retry_in_ms, Some(1_000));

        // The other trial belongs to the previous generation.
        cb.record_success(late);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_frees_trial_slot() {
        let cb = breaker(1);
        for _ in 0..3 {
            fail(&cb);
        }
        time::advance(Duration::from_secs(1)).await;
        let trial = cb.try_acquire().unwrap();
        assert!(!cb.would_admit());
        cb.release(trial);
        assert!(cb.would_admit());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_rejecting_only_inside_recovery_timeout() {
        let cb = breaker(1);
        assert!(!cb.is_rejecting());
        for _ in 0..3 {
            fail(&cb);
        }
        assert!(cb.is_rejecting());
        time::advance(Duration::from_secs(1)).await;
        assert!(!cb.is_rejecting());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_transition() {
        const CALLERS: usize = 64;
        let cb = Arc::new(CircuitBreaker::new(
            ServerId::new("a"),
            CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout_ms: 20,
                half_open_limit: 3,
            },
        ));
        for _ in 0..3 {
            fail(&cb);
        }
        time::sleep(Duration::from_millis(40)).await;
        let generation = cb.inner.lock().generation;

        let barrier = Arc::new(tokio::sync::Barrier::new(CALLERS));
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..CALLERS {
            let cb = cb.clone();
            let barrier = barrier.clone();
            tasks.spawn(async move {
                barrier.wait().await;
                let admitted = cb.try_acquire().is_ok();
                assert!(cb.snapshot().half_open_in_flight <= 3);
                admitted
            });
        }

        let mut admitted = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(cb.inner.lock().generation, generation + 1);
        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::HalfOpen);
        assert_eq!(snap.half_open_in_flight, 3);
    }

    #[test]
    fn test_registry_is_lazy() {
        let breakers = CircuitBreakers::new(CircuitBreakerConfig::default());
        let id = ServerId::new("a");
        assert!(breakers.would_admit(&id));
        assert_eq!(breakers.snapshot(&id).state, CircuitState::Closed);
        assert!(breakers.is_empty());

        let a = breakers.get_or_create(&id);
        let b = breakers.get_or_create(&id);
        assert!(Arc::ptr_eq(&a, &b));
        breakers.remove(&id);
        assert!(breakers.is_empty());
    }
}
