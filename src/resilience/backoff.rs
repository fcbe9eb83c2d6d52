//! Exponential backoff with jitter.

use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::FailoverConfig;

/// Delay before retry `retry` (1-based):
/// `base × multiplier^(retry−1) + uniform(0, base × jitter_range)`, capped at `max_delay`.
pub fn calculate_backoff<R: Rng>(retry: u32, config: &FailoverConfig, rng: &mut R) -> Duration {
    if retry == 0 {
        return Duration::ZERO;
    }

    let base_ms = config.base_delay_ms as f64;
    let exponential = base_ms * config.backoff_multiplier.powi(retry.saturating_sub(1) as i32);

    let jitter_ms = base_ms * config.jitter_range;
    let jitter = if jitter_ms > 0.0 {
        rng.gen_range(0.0..jitter_ms)
    } else {
        0.0
    };

    let capped = (exponential + jitter).min(config.max_delay_ms as f64);
    Duration::from_micros((capped.max(0.0) * 1000.0).round() as u64)
}

/// Backoff schedule with its own jitter source.
#[derive(Debug)]
pub struct Backoff {
    config: FailoverConfig,
    rng: Mutex<StdRng>,
}

impl Backoff {
    /// Seeded from `jitter_seed` when set, so retry timing is reproducible.
    pub fn new(config: FailoverConfig) -> Self {
        let rng = match config.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    pub fn delay(&self, retry: u32) -> Duration {
        calculate_backoff(retry, &self.config, &mut *self.rng.lock())
    }
}
