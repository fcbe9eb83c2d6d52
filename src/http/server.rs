//! Front-door HTTP server.
//!
//! # Responsibilities
//! - Create the Axum router: `ANY /{pool}` and `ANY /{pool}/{*path}`
//! - Wire up middleware (request ID, tracing)
//! - Buffer the request body and build the routing context
//! - Dispatch through `Dispatcher::route` and map the outcome to HTTP

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::ListenerConfig;
use crate::http::request::{build_context, UuidRequestId, X_REQUEST_ID};
use crate::http::response::from_upstream;
use crate::lifecycle::ShutdownSignal;
use crate::routing::Dispatcher;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub config: ListenerConfig,
}

/// HTTP server for routed traffic.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(dispatcher: Arc<Dispatcher>, config: ListenerConfig) -> Self {
        let router = Self::build_router(AppState { dispatcher, config });
        Self { router }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/{pool}", any(pool_root_handler))
            .route("/{pool}/{*path}", any(pool_path_handler))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id()),
            )
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server, accepting connections on the given listener, until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, mut shutdown: ShutdownSignal) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.recv().await })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn pool_root_handler(
    State(state): State<AppState>,
    Path(pool): Path<String>,
    request: Request<Body>,
) -> Response {
    proxy(state, pool, String::new(), request).await
}

async fn pool_path_handler(
    State(state): State<AppState>,
    Path((pool, path)): Path<(String, String)>,
    request: Request<Body>,
) -> Response {
    proxy(state, pool, path, request).await
}

/// Buffer the request, route it through `pool`, and relay the answer.
async fn proxy(state: AppState, pool: String, path: String, request: Request<Body>) -> Response {
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let forwarded_path = match request.uri().query() {
        Some(query) => format!("/{}?{}", path, query),
        None => format!("/{}", path),
    };

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Request body rejected");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
    };

    tracing::debug!(
        request_id = %request_id,
        pool = %pool,
        method = %parts.method,
        path = %forwarded_path,
        "Routing request"
    );

    let ctx = build_context(
        parts.method,
        forwarded_path,
        &parts.headers,
        body,
        peer,
        state.config.request_timeout(),
    );

    match state.dispatcher.route(&pool, ctx).await {
        Ok(routed) => {
            tracing::debug!(
                request_id = %request_id,
                pool = %pool,
                server = %routed.server,
                attempts = routed.attempts,
                "Request completed"
            );
            from_upstream(routed.response, routed.server.as_str())
        }
        Err(err) => {
            tracing::info!(request_id = %request_id, pool = %pool, error = %err, "Request not served");
            err.into_response()
        }
    }
}
