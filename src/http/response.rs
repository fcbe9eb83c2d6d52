//! Response handling and transformation.
//!
//! # Responsibilities
//! - Turn an upstream response into the client response
//! - Map `RouteError` variants to HTTP status codes
//!
//! # Design Decisions
//! - Error bodies are JSON: `{"error": kind, "message": text}`
//! - Hop-by-hop headers stripped automatically
//! - Deadline exhaustion results in 504 Gateway Timeout

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::{ConfigurationError, RouteError};
use crate::http::request::strip_hop_by_hop;
use crate::routing::UpstreamResponse;

pub const X_UPSTREAM_SERVER: &str = "x-upstream-server";

pub fn status_for(err: &RouteError) -> StatusCode {
    match err {
        RouteError::NoServerAvailable { .. } | RouteError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RouteError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        RouteError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        RouteError::Downstream { .. } | RouteError::AllRetriesFailed { .. } => StatusCode::BAD_GATEWAY,
        RouteError::Configuration(ConfigurationError::PoolNotFound(_)) => StatusCode::NOT_FOUND,
        RouteError::Configuration(_) => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let body = match &self {
            RouteError::AllRetriesFailed { attempts } => json!({
                "error": self.kind(),
                "message": self.to_string(),
                "attempts": attempts,
            }),
            _ => json!({ "error": self.kind(), "message": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

/// Client response for a routed request, tagged with the server that answered.
pub fn from_upstream(response: UpstreamResponse, server: &str) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = response.headers;
    strip_hop_by_hop(&mut headers);
    if let Ok(value) = HeaderValue::from_str(server) {
        headers.insert(X_UPSTREAM_SERVER, value);
    }

    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AttemptFailure, FailureReason};
    use crate::load_balancer::backend::ServerId;

    #[test]
    fn test_error_status_mapping() {
        let pool = || "web".to_string();
        assert_eq!(status_for(&RouteError::NoServerAvailable { pool: pool() }), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&RouteError::CircuitOpen { pool: pool() }), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&RouteError::RateLimited { scope: pool() }), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(&RouteError::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(&RouteError::AllRetriesFailed {
                attempts: vec![AttemptFailure {
                    server: ServerId::new("a"),
                    reason: FailureReason::Timeout,
                }],
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&ConfigurationError::PoolNotFound("x".into()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&ConfigurationError::Invalid("bad".into()).into()),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_from_upstream_tags_server() {
        let response = from_upstream(UpstreamResponse::new(201, "ok"), "a");
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get(X_UPSTREAM_SERVER).unwrap(), "a");
    }
}
