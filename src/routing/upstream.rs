//! Proxied-call capability.
//!
//! The balancer never moves bytes itself. It hands the chosen server and the
//! buffered request to an [`Upstream`] supplied by the embedding system
//! (the daemon uses `http::client::HttpUpstream`).

use std::fmt;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use thiserror::Error;

use crate::lifecycle::{Shutdown, ShutdownSignal};
use crate::load_balancer::backend::ServerRecord;

/// A request buffered for forwarding; reused across failover attempts.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Path and query forwarded to the server, always starting with '/'.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') { path } else { format!("/{}", path) };
        Self {
            method,
            path,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("call cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Performs the proxied call against one server.
#[async_trait]
pub trait Upstream: Send + Sync + fmt::Debug {
    async fn call(
        &self,
        server: &ServerRecord,
        request: &UpstreamRequest,
        cancel: CancelSignal,
    ) -> Result<UpstreamResponse, UpstreamError>;
}

/// Trips the paired [`CancelSignal`].
#[derive(Debug)]
pub struct CancelHandle(Shutdown);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.trigger();
    }
}

/// Best-effort cancellation notice handed to an in-flight call.
#[derive(Debug, Clone)]
pub struct CancelSignal(ShutdownSignal);

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        self.0.is_triggered()
    }

    /// Resolve once the caller has given up on this call.
    pub async fn cancelled(&mut self) {
        self.0.recv().await
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let shutdown = Shutdown::new();
    let signal = CancelSignal(shutdown.subscribe());
    (CancelHandle(shutdown), signal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_pair() {
        let (handle, mut signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        handle.cancel();
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }

    #[test]
    fn test_request_path_normalized() {
        assert_eq!(UpstreamRequest::get("api/users").path, "/api/users");
        assert_eq!(UpstreamRequest::get("/").path, "/");
    }
}
