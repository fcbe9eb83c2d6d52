//! Strategy registry.
//!
//! Maps algorithm ids to factories. A pool resolves its strategy once, at
//! creation time; the registry is passed to the dispatcher explicitly so
//! tests and embedders can register their own algorithms.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::PoolSettings;
use crate::error::ConfigurationError;
use crate::load_balancer::{
    adaptive::Adaptive,
    geo::Geolocation,
    hashing::{ClientHash, ConsistentHash},
    least_conn::LeastConnections,
    response_time::LeastResponseTime,
    round_robin::RoundRobin,
    weighted::WeightedRoundRobin,
    LoadBalancer,
};

pub const ROUND_ROBIN: &str = "round_robin";
pub const WEIGHTED_ROUND_ROBIN: &str = "weighted_round_robin";
pub const LEAST_CONNECTIONS: &str = "least_connections";
pub const LEAST_RESPONSE_TIME: &str = "least_response_time";
pub const CLIENT_HASH: &str = "client_hash";
pub const CONSISTENT_HASH: &str = "consistent_hash";
pub const GEOLOCATION: &str = "geolocation";
pub const ADAPTIVE: &str = "adaptive";

pub const BUILTIN_ALGORITHMS: &[&str] = &[
    ROUND_ROBIN,
    WEIGHTED_ROUND_ROBIN,
    LEAST_CONNECTIONS,
    LEAST_RESPONSE_TIME,
    CLIENT_HASH,
    CONSISTENT_HASH,
    GEOLOCATION,
    ADAPTIVE,
];

pub type StrategyFactory = Arc<dyn Fn(&PoolSettings) -> Box<dyn LoadBalancer> + Send + Sync>;

#[derive(Clone)]
pub struct StrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        f.debug_struct("StrategyRegistry").field("algorithms", &ids).finish()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl StrategyRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in algorithm.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(ROUND_ROBIN, |_| Box::new(RoundRobin::new()));
        registry.register(WEIGHTED_ROUND_ROBIN, |_| Box::new(WeightedRoundRobin::new()));
        registry.register(LEAST_CONNECTIONS, |_| Box::new(LeastConnections::new()));
        registry.register(LEAST_RESPONSE_TIME, |_| Box::new(LeastResponseTime::new()));
        registry.register(CLIENT_HASH, |_| Box::new(ClientHash::new()));
        registry.register(CONSISTENT_HASH, |s| {
            Box::new(ConsistentHash::new(s.consistent_hash.virtual_nodes))
        });
        registry.register(GEOLOCATION, |s| Box::new(Geolocation::new(s.geo.fallback_distance_km)));
        registry.register(ADAPTIVE, |s| Box::new(Adaptive::new(s.adaptive.clone())));
        registry
    }

    /// Add or replace an algorithm.
    pub fn register<F>(&mut self, id: &str, factory: F)
    where
        F: Fn(&PoolSettings) -> Box<dyn LoadBalancer> + Send + Sync + 'static,
    {
        self.factories.insert(id.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Instantiate the strategy named by `settings.algorithm`.
    pub fn resolve(&self, settings: &PoolSettings) -> Result<Box<dyn LoadBalancer>, ConfigurationError> {
        self.factories
            .get(&settings.algorithm)
            .map(|factory| factory(settings))
            .ok_or_else(|| ConfigurationError::UnknownAlgorithm(settings.algorithm.clone()))
    }
}
