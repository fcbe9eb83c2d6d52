//! Health probe capability and the probes shipped with the daemon.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::load_balancer::backend::ServerRecord;

/// Header an HTTP health endpoint may use to report CPU utilization (0..=1).
pub const CPU_UTILIZATION_HEADER: &str = "x-cpu-utilization";

/// Result of probing one server.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub success: bool,
    pub latency: Duration,
    pub cpu_utilization: Option<f64>,
    pub details: Option<String>,
}

impl ProbeOutcome {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            success: true,
            latency,
            cpu_utilization: None,
            details: None,
        }
    }

    pub fn failed(latency: Duration, details: impl Into<String>) -> Self {
        Self {
            success: false,
            latency,
            cpu_utilization: None,
            details: Some(details.into()),
        }
    }

    pub fn with_cpu(mut self, cpu: f64) -> Self {
        self.cpu_utilization = Some(cpu);
        self
    }
}

/// Asks a server whether it is healthy. Supplied by the embedding system.
///
/// Implementations should not apply their own timeout; the monitor bounds
/// every probe with the configured health timeout.
#[async_trait]
pub trait HealthProbe: Send + Sync + fmt::Debug {
    async fn probe(&self, server: &ServerRecord) -> ProbeOutcome;
}

/// Healthy when a TCP connection can be established.
#[derive(Debug, Default, Clone)]
pub struct TcpProbe;

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self, server: &ServerRecord) -> ProbeOutcome {
        let started = Instant::now();
        match TcpStream::connect((server.host.as_str(), server.port)).await {
            Ok(_) => ProbeOutcome::healthy(started.elapsed()),
            Err(e) => ProbeOutcome::failed(started.elapsed(), format!("connect failed: {}", e)),
        }
    }
}

/// Healthy when `GET <path>` answers with a 2xx status.
pub struct HttpProbe {
    path: String,
    client: Client<HttpConnector, Body>,
}

impl fmt::Debug for HttpProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProbe").field("path", &self.path).finish()
    }
}

impl HttpProbe {
    pub fn new(path: impl Into<String>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            path: path.into(),
            client,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, server: &ServerRecord) -> ProbeOutcome {
        let started = Instant::now();
        let uri = match server.base_url.join(&self.path) {
            Ok(url) => url.to_string(),
            Err(e) => return ProbeOutcome::failed(Duration::ZERO, format!("invalid probe url: {}", e)),
        };

        let request = match Request::builder()
            .method("GET")
            .uri(uri)
            .header("user-agent", "adaptive-lb-health-check")
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => return ProbeOutcome::failed(Duration::ZERO, format!("invalid probe request: {}", e)),
        };

        match self.client.request(request).await {
            Ok(response) => {
                let latency = started.elapsed();
                let cpu = response
                    .headers()
                    .get(CPU_UTILIZATION_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<f64>().ok());
                let outcome = if response.status().is_success() {
                    ProbeOutcome::healthy(latency)
                } else {
                    ProbeOutcome::failed(latency, format!("status {}", response.status()))
                };
                match cpu {
                    Some(cpu) => outcome.with_cpu(cpu.clamp(0.0, 1.0)),
                    None => outcome,
                }
            }
            Err(e) => ProbeOutcome::failed(started.elapsed(), format!("request failed: {}", e)),
        }
    }
}
