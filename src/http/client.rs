//! Forwarding client.
//!
//! `HttpUpstream` is the daemon's `Upstream`: it replays the buffered request
//! against `http://host:port` and buffers the answer for the front door.

use std::fmt;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};

use crate::http::request::strip_hop_by_hop;
use crate::load_balancer::backend::ServerRecord;
use crate::routing::{CancelSignal, Upstream, UpstreamError, UpstreamRequest, UpstreamResponse};

/// Largest upstream response body buffered for the client.
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

pub struct HttpUpstream {
    client: Client<HttpConnector, Body>,
    max_response_bytes: usize,
}

impl fmt::Debug for HttpUpstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpUpstream")
            .field("max_response_bytes", &self.max_response_bytes)
            .finish()
    }
}

impl Default for HttpUpstream {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RESPONSE_BYTES)
    }
}

impl HttpUpstream {
    pub fn new(max_response_bytes: usize) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            client,
            max_response_bytes,
        }
    }

    async fn forward(
        &self,
        server: &ServerRecord,
        request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let uri = server
            .base_url
            .join(&request.path)
            .map_err(|e| UpstreamError::Other(format!("invalid upstream url: {}", e)))?;

        let mut builder = Request::builder().method(request.method.clone()).uri(uri.as_str());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers.clone());
        }
        let outgoing = builder
            .body(Body::from(request.body.clone()))
            .map_err(|e| UpstreamError::Other(format!("invalid upstream request: {}", e)))?;

        let response = self.client.request(outgoing).await.map_err(|e| {
            if e.is_connect() {
                UpstreamError::Connect(e.to_string())
            } else {
                UpstreamError::Other(e.to_string())
            }
        })?;

        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(Body::new(body), self.max_response_bytes)
            .await
            .map_err(|e| UpstreamError::Other(format!("reading upstream body: {}", e)))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        Ok(UpstreamResponse {
            status: parts.status.as_u16(),
            headers,
            body,
        })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn call(
        &self,
        server: &ServerRecord,
        request: &UpstreamRequest,
        mut cancel: CancelSignal,
    ) -> Result<UpstreamResponse, UpstreamError> {
        tokio::select! {
            result = self.forward(server, request) => result,
            _ = cancel.cancelled() => {
                tracing::debug!(server = %server.id, "Upstream call cancelled");
                Err(UpstreamError::Cancelled)
            }
        }
    }
}
