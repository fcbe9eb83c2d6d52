//! Administrative HTTP API.
//!
//! Every route sits behind the bearer-token middleware in `auth.rs`.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::config::PoolSettings;
use crate::routing::Dispatcher;

#[derive(Clone)]
pub struct AdminState {
    pub dispatcher: Arc<Dispatcher>,
    pub api_key: Arc<str>,
    /// Rules applied to sections a created pool does not override.
    pub defaults: Arc<PoolSettings>,
}

impl AdminState {
    pub fn new(dispatcher: Arc<Dispatcher>, api_key: &str, defaults: PoolSettings) -> Self {
        Self {
            dispatcher,
            api_key: Arc::from(api_key),
            defaults: Arc::new(defaults),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/pools", get(list_pools).post(create_pool))
        .route("/admin/pools/{id}", get(get_pool).delete(delete_pool))
        .route("/admin/pools/{id}/servers", post(add_server))
        .route("/admin/pools/{id}/alerts", get(get_alerts))
        .route("/admin/servers/{id}", get(get_server).delete(remove_server))
        .route("/admin/servers/{id}/maintenance", put(set_maintenance))
        .route("/admin/servers/{id}/probe", post(probe_server))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
