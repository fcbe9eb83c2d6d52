use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::admin::AdminState;
use crate::config::{PoolConfig, ServerSpec};
use crate::error::ConfigurationError;
use crate::load_balancer::backend::ServerId;
use crate::load_balancer::pool::{PoolStatus, ServerStatus};
use crate::observability::Alert;

/// Admin-call failure rendered as JSON with a matching status code.
#[derive(Debug)]
pub struct AdminError(pub ConfigurationError);

impl From<ConfigurationError> for AdminError {
    fn from(err: ConfigurationError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ConfigurationError::PoolNotFound(_) | ConfigurationError::ServerNotFound(_) => StatusCode::NOT_FOUND,
            ConfigurationError::PoolAlreadyExists(_) | ConfigurationError::DuplicateServer(_) => StatusCode::CONFLICT,
            ConfigurationError::UnknownAlgorithm(_) | ConfigurationError::Invalid(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type AdminResult<T> = Result<T, AdminError>;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub pools: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddedServer {
    pub id: ServerId,
    pub pool: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemovedServer {
    pub id: String,
    /// False when calls were still in flight at removal.
    pub clean: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct MaintenanceRequest {
    pub enabled: bool,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        pools: state.dispatcher.pool_ids(),
    })
}

pub async fn list_pools(State(state): State<AdminState>) -> Json<Vec<PoolStatus>> {
    let pools = state
        .dispatcher
        .pool_ids()
        .iter()
        .filter_map(|id| state.dispatcher.pool_status(id).ok())
        .collect();
    Json(pools)
}

/// Create a pool and its initial servers. A failing server rolls the pool back.
pub async fn create_pool(
    State(state): State<AdminState>,
    Json(config): Json<PoolConfig>,
) -> AdminResult<(StatusCode, Json<PoolStatus>)> {
    let settings = config.settings(&state.defaults);
    state.dispatcher.create_pool(&config.id, settings)?;

    for server in &config.servers {
        if let Err(err) = state.dispatcher.add_server(&config.id, server) {
            state.dispatcher.remove_pool(&config.id);
            return Err(err.into());
        }
    }

    tracing::info!(pool = %config.id, servers = config.servers.len(), "Pool created via admin API");
    Ok((StatusCode::CREATED, Json(state.dispatcher.pool_status(&config.id)?)))
}

pub async fn get_pool(State(state): State<AdminState>, Path(id): Path<String>) -> AdminResult<Json<PoolStatus>> {
    Ok(Json(state.dispatcher.pool_status(&id)?))
}

pub async fn delete_pool(State(state): State<AdminState>, Path(id): Path<String>) -> AdminResult<StatusCode> {
    if state.dispatcher.remove_pool(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ConfigurationError::PoolNotFound(id).into())
    }
}

pub async fn add_server(
    State(state): State<AdminState>,
    Path(pool): Path<String>,
    Json(spec): Json<ServerSpec>,
) -> AdminResult<(StatusCode, Json<AddedServer>)> {
    let id = state.dispatcher.add_server(&pool, &spec)?;
    Ok((StatusCode::CREATED, Json(AddedServer { id, pool })))
}

pub async fn get_server(State(state): State<AdminState>, Path(id): Path<String>) -> AdminResult<Json<ServerStatus>> {
    Ok(Json(state.dispatcher.server_status(&id)?))
}

pub async fn remove_server(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> AdminResult<Json<RemovedServer>> {
    let clean = state.dispatcher.remove_server(&id, query.force).await?;
    Ok(Json(RemovedServer { id, clean }))
}

pub async fn set_maintenance(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<MaintenanceRequest>,
) -> AdminResult<Json<ServerStatus>> {
    state.dispatcher.set_maintenance(&id, body.enabled)?;
    Ok(Json(state.dispatcher.server_status(&id)?))
}

/// Probe a server now and report its refreshed status.
pub async fn probe_server(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> AdminResult<Json<ServerStatus>> {
    state.dispatcher.probe_server(&id).await?;
    Ok(Json(state.dispatcher.server_status(&id)?))
}

pub async fn get_alerts(State(state): State<AdminState>, Path(id): Path<String>) -> AdminResult<Json<Vec<Alert>>> {
    Ok(Json(state.dispatcher.pool_alerts(&id)?))
}
