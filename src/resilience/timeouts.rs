//! Timeout enforcement.
//!
//! # Responsibilities
//! - Carry a request deadline through selection, backoff and the downstream call
//! - Bound each attempt by `min(deadline, now + attempt timeout)`
//!
//! # Design Decisions
//! - Uses Tokio's clock so paused-time tests apply
//! - Timeout errors are distinct from other errors
//! - Timed-out requests return 504 Gateway Timeout

use std::future::Future;
use std::time::Duration;

use tokio::time::{self, error::Elapsed, Instant};

/// Absolute point in time by which a request must finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// True if waiting `delay` from now would reach or pass the deadline.
    pub fn would_expire_after(&self, delay: Duration) -> bool {
        Instant::now() + delay >= self.at
    }

    /// The earlier of this deadline and `now + limit`.
    pub fn bounded(&self, limit: Duration) -> Deadline {
        Deadline::at(self.at.min(Instant::now() + limit))
    }

    /// Run `fut` until this deadline.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Elapsed> {
        time::timeout_at(self.at, fut).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry() {
        let deadline = Deadline::after(Duration::from_millis(100));
        assert!(!deadline.is_expired());
        assert!(deadline.would_expire_after(Duration::from_millis(100)));
        assert!(!deadline.would_expire_after(Duration::from_millis(99)));

        time::advance(Duration::from_millis(100)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_takes_earlier() {
        let deadline = Deadline::after(Duration::from_secs(10));
        assert_eq!(deadline.bounded(Duration::from_secs(1)).remaining(), Duration::from_secs(1));
        assert_eq!(deadline.bounded(Duration::from_secs(60)), deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let deadline = Deadline::after(Duration::from_millis(50));
        let slow = time::sleep(Duration::from_secs(1));
        assert!(deadline.run(slow).await.is_err());
        assert_eq!(deadline.run(async { 7 }).await.unwrap(), 7);
    }
}
