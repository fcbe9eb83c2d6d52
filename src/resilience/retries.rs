//! Failover coordination.
//!
//! # Responsibilities
//! - Re-run selection and the downstream call after a failed attempt
//! - Space attempts with jittered exponential backoff
//! - Stop at the attempt bound or the request deadline, whichever comes first
//!
//! # Design Decisions
//! - `max_retries` bounds total attempts, the first one included
//! - Attempts for one request are sequential; requests retry independently
//! - A backoff that would overrun the deadline ends the request with `Timeout`
//!   instead of sleeping into it
//! - Servers that already failed this request are passed back to selection
//!   so it can avoid them where possible

use std::future::Future;

use tokio::time;

use crate::config::FailoverConfig;
use crate::error::{AttemptFailure, FailureReason, RouteError};
use crate::load_balancer::backend::ServerId;
use crate::observability::metrics;
use crate::resilience::backoff::Backoff;
use crate::resilience::timeouts::Deadline;

/// What one attempt produced.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Success(T),
    /// The attempt reached a server (or tried to) and failed; retry.
    Failed(AttemptFailure),
    /// No server could be selected at all; stop.
    Exhausted(RouteError),
}

/// Result of a successful failover sequence.
#[derive(Debug)]
pub struct Completed<T> {
    pub value: T,
    /// Attempts made, the successful one included.
    pub attempts: u32,
    pub failures: Vec<AttemptFailure>,
}

#[derive(Debug)]
pub struct FailoverCoordinator {
    pool: String,
    max_attempts: u32,
    backoff: Backoff,
}

impl FailoverCoordinator {
    pub fn new(pool: impl Into<String>, config: &FailoverConfig) -> Self {
        Self {
            pool: pool.into(),
            max_attempts: config.max_retries.max(1),
            backoff: Backoff::new(config.clone()),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Drive `attempt(n, already_failed)` until it succeeds or the budget runs out.
    pub async fn execute<T, F, Fut>(&self, deadline: Deadline, mut attempt: F) -> Result<Completed<T>, RouteError>
    where
        F: FnMut(u32, Vec<ServerId>) -> Fut,
        Fut: Future<Output = AttemptOutcome<T>>,
    {
        let mut failures: Vec<AttemptFailure> = Vec::new();

        for n in 1..=self.max_attempts {
            if n > 1 {
                let delay = self.backoff.delay(n - 1);
                if deadline.would_expire_after(delay) {
                    tracing::debug!(pool = %self.pool, attempt = n, "Backoff would overrun deadline");
                    return Err(RouteError::Timeout);
                }
                tracing::info!(
                    pool = %self.pool,
                    attempt = n,
                    delay_ms = delay.as_millis() as u64,
                    last_failure = %failures.last().map(ToString::to_string).unwrap_or_default(),
                    "Retrying request"
                );
                metrics::record_retry(&self.pool);
                time::sleep(delay).await;
            }
            if deadline.is_expired() {
                return Err(RouteError::Timeout);
            }

            let excluded = failures.iter().map(|f| f.server.clone()).collect();
            match attempt(n, excluded).await {
                AttemptOutcome::Success(value) => {
                    return Ok(Completed {
                        value,
                        attempts: n,
                        failures,
                    })
                }
                AttemptOutcome::Failed(failure) => {
                    if failure.reason == FailureReason::Timeout && deadline.is_expired() {
                        return Err(RouteError::Timeout);
                    }
                    failures.push(failure);
                }
                AttemptOutcome::Exhausted(err) => {
                    if failures.is_empty() {
                        return Err(err);
                    }
                    break;
                }
            }
        }

        Err(self.aggregate(failures))
    }

    fn aggregate(&self, mut failures: Vec<AttemptFailure>) -> RouteError {
        if failures.len() == 1 {
            if let Some(only) = failures.pop() {
                return RouteError::from_single_failure(&self.pool, only);
            }
        }
        RouteError::AllRetriesFailed { attempts: failures }
    }
}
