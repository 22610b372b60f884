use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::super::IPCServer;
use crate::supervisor::error::SupervisorError;

/// GET /api/health
pub async fn health(State(state): State<IPCServer>) -> impl IntoResponse {
    let running = state.supervisor.running_ids().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "running": running,
    }))
}

/// POST /api/instances/:id/install: returns as soon as the job is accepted.
pub async fn install_instance(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    Ok(Json(state.supervisor.install(&id).await?))
}

/// GET /api/instances/:id/install
pub async fn install_status(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    Ok(Json(state.supervisor.install_status(&id).await?))
}

/// POST /api/instances/:id/start
pub async fn start_instance(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    Ok(Json(state.supervisor.start(&id).await?))
}

/// POST /api/instances/:id/stop
pub async fn stop_instance(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    Ok(Json(state.supervisor.stop(&id).await?))
}

/// GET /api/instances/:id/stats: 400 when the server is not running.
pub async fn instance_stats(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let stats = state.supervisor.stats(&id).await?;
    if !stats.running {
        return Err(SupervisorError::NotRunning(id));
    }
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
pub struct ConsoleQuery {
    pub since: Option<u64>,
}

/// GET /api/instances/:id/console?since=N: lines with id > N.
pub async fn instance_console(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
    Query(query): Query<ConsoleQuery>,
) -> Result<impl IntoResponse, SupervisorError> {
    let lines = state.supervisor.console(&id, query.since).await?;
    Ok(Json(json!({ "serverId": id, "lines": lines })))
}

/// GET /api/steamcmd
pub async fn steamcmd_status(State(state): State<IPCServer>) -> impl IntoResponse {
    Json(state.supervisor.steamcmd_status())
}

/// POST /api/steamcmd/install: bootstraps SteamCMD if missing.
pub async fn steamcmd_install(State(state): State<IPCServer>) -> Result<impl IntoResponse, SupervisorError> {
    Ok(Json(state.supervisor.install_steamcmd().await?))
}
