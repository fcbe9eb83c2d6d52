//! Hash-based selection: plain client-key hashing and a consistent hash ring.
//!
//! # Design Decisions
//! - The ring is built from every pool member, not just the eligible ones, so
//!   a server turning unhealthy moves only its own keys to the next point
//!   clockwise and they return once it recovers
//! - Requests carrying no key are served round robin
//! - Placement uses SHA-256, so a key maps to the same point across builds
//!   and toolchain upgrades

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::load_balancer::{
    backend::{ServerId, ServerRecord},
    round_robin::RoundRobin,
    LoadBalancer, SelectionContext,
};

/// First eight bytes of the SHA-256 digest, big-endian.
fn stable_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// `hash(key) mod |eligible|`.
#[derive(Debug, Default)]
pub struct ClientHash {
    fallback: RoundRobin,
}

impl ClientHash {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for ClientHash {
    fn next_server(
        &self,
        servers: &[Arc<ServerRecord>],
        ctx: &SelectionContext<'_>,
    ) -> Option<Arc<ServerRecord>> {
        if servers.is_empty() {
            return None;
        }
        match ctx.hash_key() {
            Some(key) => {
                let index = (stable_hash(key) % servers.len() as u64) as usize;
                Some(servers[index].clone())
            }
            None => self.fallback.next_server(servers, ctx),
        }
    }

    fn name(&self) -> &'static str {
        "client_hash"
    }
}

/// Hash ring with a fixed number of virtual points per server.
#[derive(Debug)]
pub struct ConsistentHash {
    virtual_nodes: usize,
    ring: RwLock<BTreeMap<u64, ServerId>>,
    fallback: RoundRobin,
}

impl ConsistentHash {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            ring: RwLock::new(BTreeMap::new()),
            fallback: RoundRobin::new(),
        }
    }

    pub fn ring_size(&self) -> usize {
        self.ring.read().len()
    }
}

impl LoadBalancer for ConsistentHash {
    fn next_server(
        &self,
        servers: &[Arc<ServerRecord>],
        ctx: &SelectionContext<'_>,
    ) -> Option<Arc<ServerRecord>> {
        if servers.is_empty() {
            return None;
        }
        let Some(key) = ctx.hash_key() else {
            return self.fallback.next_server(servers, ctx);
        };

        let eligible: HashMap<&str, &Arc<ServerRecord>> =
            servers.iter().map(|s| (s.id.as_str(), s)).collect();
        let point = stable_hash(key);

        let ring = self.ring.read();
        let found = ring
            .range(point..)
            .chain(ring.range(..point))
            .find_map(|(_, id)| eligible.get(id.as_str()).map(|s| (*s).clone()));

        // Candidates that never made it onto the ring (not rebuilt yet)
        found.or_else(|| self.fallback.next_server(servers, ctx))
    }

    fn name(&self) -> &'static str {
        "consistent_hash"
    }

    fn rebuild(&self, members: &[Arc<ServerRecord>]) {
        let mut ring = BTreeMap::new();
        for server in members {
            for i in 0..self.virtual_nodes {
                ring.insert(stable_hash(&format!("{}:{}", server.id, i)), server.id.clone());
            }
        }
        *self.ring.write() = ring;
    }
}
