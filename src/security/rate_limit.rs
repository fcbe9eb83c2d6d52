//! Sliding-window rate limiting per server, with an optional pool-wide ceiling.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::load_balancer::backend::{ServerId, ServerRecord};
use crate::observability::metrics;

/// Timestamps of admitted requests inside the trailing window.
#[derive(Debug, Default)]
struct SlidingWindow {
    stamps: VecDeque<Instant>,
}

impl SlidingWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.stamps.front() {
            if now.duration_since(*oldest) >= window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn has_room(&mut self, now: Instant, window: Duration, limit: u32) -> bool {
        self.prune(now, window);
        self.stamps.len() < limit as usize
    }

    fn try_acquire(&mut self, now: Instant, window: Duration, limit: u32) -> bool {
        if !self.has_room(now, window, limit) {
            return false;
        }
        self.stamps.push_back(now);
        true
    }
}

/// Rate limiter for one pool.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    pool_key: String,
    windows: DashMap<String, SlidingWindow>,
}

impl RateLimiter {
    pub fn new(pool: &str, config: RateLimitConfig) -> Self {
        Self {
            config,
            pool_key: format!("pool:{}", pool),
            windows: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn limit_for(&self, server: &ServerRecord) -> u32 {
        server.max_requests_per_sec.unwrap_or(self.config.max_requests)
    }

    /// Peek: would a request to `server` be admitted right now? Records nothing.
    pub fn has_room(&self, server: &ServerRecord) -> bool {
        if !self.config.enabled {
            return true;
        }
        let now = Instant::now();
        let window = self.config.window();
        let server_ok = self
            .windows
            .get_mut(server.id.as_str())
            .map_or(true, |mut w| w.has_room(now, window, self.limit_for(server)));
        server_ok && self.pool_has_room(now)
    }

    /// Whether the pool-wide ceiling (if any) has room.
    pub fn pool_has_room(&self, now: Instant) -> bool {
        match self.config.pool_max_requests {
            Some(limit) if self.config.enabled => self
                .windows
                .get_mut(&self.pool_key)
                .map_or(true, |mut w| w.has_room(now, self.config.window(), limit)),
            _ => true,
        }
    }

    /// Admit and record one request, or return the scope that rejected it.
    pub fn try_acquire(&self, server: &ServerRecord) -> Result<(), String> {
        if !self.config.enabled {
            return Ok(());
        }
        let now = Instant::now();
        let window = self.config.window();

        // Never hold two shard guards at once; both keys may share a shard.
        let admitted = self
            .windows
            .entry(server.id.to_string())
            .or_default()
            .try_acquire(now, window, self.limit_for(server));
        if !admitted {
            metrics::record_rate_limited(server.id.as_str());
            return Err(server.id.to_string());
        }

        if let Some(limit) = self.config.pool_max_requests {
            let admitted = self
                .windows
                .entry(self.pool_key.clone())
                .or_default()
                .try_acquire(now, window, limit);
            if !admitted {
                // A pool rejection does not count against the server.
                if let Some(mut server_window) = self.windows.get_mut(server.id.as_str()) {
                    server_window.stamps.pop_back();
                }
                metrics::record_rate_limited(&self.pool_key);
                return Err(self.pool_key.clone());
            }
        }
        Ok(())
    }

    /// Discard a removed server's window.
    pub fn forget(&self, id: &ServerId) {
        self.windows.remove(id.as_str());
    }

    /// Requests currently counted against `id`.
    pub fn in_window(&self, id: &ServerId) -> usize {
        let now = Instant::now();
        self.windows.get_mut(id.as_str()).map_or(0, |mut w| {
            w.prune(now, self.config.window());
            w.stamps.len()
        })
    }
}
