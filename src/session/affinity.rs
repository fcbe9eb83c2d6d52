//! Session affinity store.
//!
//! # Responsibilities
//! - Map a session key to the server that first served it
//! - Expire bindings after a fixed TTL from creation
//! - Purge expired bindings from a single periodic sweep task
//!
//! # Design Decisions
//! - Lookups ignore expired bindings but never delete them; only the sweep does
//! - Eligibility of the bound server is judged by the caller, not the store
//! - Rebinding a key starts a fresh TTL

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::lifecycle::ShutdownSignal;
use crate::load_balancer::backend::ServerId;

#[derive(Debug, Clone)]
pub struct SessionBinding {
    pub server: ServerId,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl SessionBinding {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Serializable view of one binding.
#[derive(Debug, Clone, Serialize)]
pub struct BindingSummary {
    pub key: String,
    pub server: ServerId,
    pub expires_in_secs: u64,
}

#[derive(Debug)]
pub struct SessionStore {
    ttl: Duration,
    bindings: DashMap<String, SessionBinding>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            bindings: DashMap::new(),
        }
    }

    /// Server bound to `key`, if the binding has not expired.
    pub fn lookup(&self, key: &str) -> Option<ServerId> {
        let now = Instant::now();
        self.bindings
            .get(key)
            .filter(|b| !b.is_expired(now))
            .map(|b| b.server.clone())
    }

    /// Bind or rebind `key` to `server`.
    pub fn bind(&self, key: &str, server: ServerId) {
        let now = Instant::now();
        self.bindings.insert(
            key.to_string(),
            SessionBinding {
                server,
                created_at: now,
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn unbind(&self, key: &str) -> Option<SessionBinding> {
        self.bindings.remove(key).map(|(_, b)| b)
    }

    /// Drop every binding that points at `server`.
    pub fn unbind_server(&self, server: &ServerId) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, b| &b.server != server);
        before.saturating_sub(self.bindings.len())
    }

    /// Remove expired bindings; returns how many were purged.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.bindings.len();
        self.bindings.retain(|_, b| !b.is_expired(now));
        before.saturating_sub(self.bindings.len())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn summaries(&self) -> Vec<BindingSummary> {
        let now = Instant::now();
        let mut out: Vec<BindingSummary> = self
            .bindings
            .iter()
            .map(|entry| BindingSummary {
                key: entry.key().clone(),
                server: entry.server.clone(),
                expires_in_secs: entry.expires_at.saturating_duration_since(now).as_secs(),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Start the periodic sweep. Ends when `shutdown` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(store) = store.upgrade() else { break };
                        let purged = store.sweep();
                        if purged > 0 {
                            tracing::debug!(purged, remaining = store.len(), "Expired session bindings purged");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}
