//! Request handling and transformation.
//!
//! # Responsibilities
//! - Generate a unique request ID (UUID v4)
//! - Extract routing inputs from front-door headers
//! - Prepare the buffered request for forwarding
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - Malformed routing headers are ignored, never rejected
//! - Hop-by-hop headers are stripped before forwarding

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request};
use bytes::Bytes;
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

use crate::load_balancer::geo::GeoPoint;
use crate::routing::{RequestContext, UpstreamRequest};

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_SESSION_ID: &str = "x-session-id";
pub const X_CLIENT_ID: &str = "x-client-id";
/// Client coordinate as `"lat,lon"` in decimal degrees.
pub const X_CLIENT_GEO: &str = "x-client-geo";
pub const X_REQUEST_TIMEOUT_MS: &str = "x-request-timeout-ms";

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
];

/// Assigns a fresh UUID to requests that arrive without an `x-request-id`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Remove connection-scoped headers (and `Host`) before forwarding.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

pub fn parse_geo(value: &str) -> Option<GeoPoint> {
    let (lat, lon) = value.split_once(',')?;
    let point = GeoPoint::new(lat.trim().parse().ok()?, lon.trim().parse().ok()?);
    point.is_valid().then_some(point)
}

pub fn parse_timeout(value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(ms) => Some(Duration::from_millis(ms)),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Build the routing context for one front-door request.
///
/// The client id falls back to the peer IP, the timeout to `default_timeout`.
pub fn build_context(
    method: Method,
    path: String,
    headers: &HeaderMap,
    body: Bytes,
    peer: Option<SocketAddr>,
    default_timeout: Duration,
) -> RequestContext {
    let timeout = header_str(headers, X_REQUEST_TIMEOUT_MS)
        .and_then(parse_timeout)
        .unwrap_or(default_timeout);

    let mut forwarded = headers.clone();
    strip_hop_by_hop(&mut forwarded);

    let mut request = UpstreamRequest::new(method, path).with_body(body);
    request.headers = forwarded;

    let mut ctx = RequestContext::new(request).timeout(timeout);
    if let Some(session) = header_str(headers, X_SESSION_ID) {
        ctx = ctx.session(session);
    }
    match header_str(headers, X_CLIENT_ID) {
        Some(client) => ctx = ctx.client(client),
        None => {
            if let Some(peer) = peer {
                ctx = ctx.client(peer.ip().to_string());
            }
        }
    }
    if let Some(point) = header_str(headers, X_CLIENT_GEO).and_then(parse_geo) {
        ctx = ctx.location(point);
    }
    ctx
}
