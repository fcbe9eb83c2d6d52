//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use adaptive_lb::config::{PoolSettings, ServerSpec};
use adaptive_lb::health::{HealthProbe, ProbeOutcome};
use adaptive_lb::load_balancer::backend::ServerRecord;
use adaptive_lb::routing::{
    CancelSignal, Dispatcher, RequestContext, Upstream, UpstreamError, UpstreamRequest, UpstreamResponse,
};
use async_trait::async_trait;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::time::Instant;

/// How a scripted server answers.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// 200 with the server id as body.
    Ok,
    Status(u16),
    Fail,
    /// Answer 200 after the delay, ignoring cancellation.
    Slow(Duration),
}

/// In-memory upstream with per-server behavior and a call log.
#[derive(Debug, Default)]
pub struct ScriptedUpstream {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, server: &str, behavior: Behavior) {
        self.behaviors.lock().insert(server.to_string(), behavior);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().iter().map(|(_, at)| *at).collect()
    }

    pub fn count(&self, server: &str) -> usize {
        self.calls.lock().iter().filter(|(id, _)| id == server).count()
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn call(
        &self,
        server: &ServerRecord,
        _request: &UpstreamRequest,
        _cancel: CancelSignal,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let id = server.id.to_string();
        self.calls.lock().push((id.clone(), Instant::now()));
        let behavior = self.behaviors.lock().get(&id).cloned().unwrap_or(Behavior::Ok);
        match behavior {
            Behavior::Ok => Ok(UpstreamResponse::new(200, id)),
            Behavior::Status(status) => Ok(UpstreamResponse::new(status, "scripted")),
            Behavior::Fail => Err(UpstreamError::Connect("connection refused".into())),
            Behavior::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(UpstreamResponse::new(200, id))
            }
        }
    }
}

/// Probe that fails for the server ids marked down.
#[derive(Debug, Default)]
pub struct StaticProbe {
    down: Mutex<HashSet<String>>,
}

impl StaticProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, server: &str) {
        self.down.lock().insert(server.to_string());
    }

    pub fn recover(&self, server: &str) {
        self.down.lock().remove(server);
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn probe(&self, server: &ServerRecord) -> ProbeOutcome {
        if self.down.lock().contains(server.id.as_str()) {
            ProbeOutcome::failed(Duration::from_millis(1), "scripted failure")
        } else {
            ProbeOutcome::healthy(Duration::from_millis(1))
        }
    }
}

/// Pool rules for deterministic tests: no probing, seeded jitter.
pub fn settings() -> PoolSettings {
    let mut settings = PoolSettings::default();
    settings.health_check.enabled = false;
    settings.failover.jitter_seed = Some(42);
    settings
}

pub fn dispatcher(upstream: Arc<ScriptedUpstream>) -> Dispatcher {
    Dispatcher::new(upstream, StaticProbe::new())
}

/// Create `pool` with `settings` and servers on 10.0.0.x:80.
pub fn pool_with(d: &Dispatcher, pool: &str, settings: PoolSettings, servers: &[&str]) {
    d.create_pool(pool, settings).unwrap();
    for (i, id) in servers.iter().enumerate() {
        d.add_server(pool, &ServerSpec::new(*id, format!("10.0.0.{}", i + 1), 80))
            .unwrap();
    }
}

pub fn get() -> RequestContext {
    RequestContext::new(UpstreamRequest::get("/"))
}

/// Serve `app` on an ephemeral local port.
pub async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    addr
}
