use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::super::IPCServer;
use crate::supervisor::error::SupervisorError;

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct WriteBody {
    pub content: String,
}

/// GET /api/instances/:id/files?path=...: directory listing or file content.
pub async fn read_path(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
    Query(query): Query<PathQuery>,
) -> Result<impl IntoResponse, SupervisorError> {
    Ok(Json(state.supervisor.read_path(&id, &query.path).await?))
}

/// PUT /api/instances/:id/files?path=... with `{"content": "..."}`.
pub async fn write_file(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
    Query(query): Query<PathQuery>,
    Json(body): Json<WriteBody>,
) -> Result<impl IntoResponse, SupervisorError> {
    state
        .supervisor
        .write_file(&id, &query.path, &body.content)
        .await?;
    Ok(Json(json!({ "success": true, "path": query.path })))
}

/// DELETE /api/instances/:id/files?path=...
pub async fn delete_path(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
    Query(query): Query<PathQuery>,
) -> Result<impl IntoResponse, SupervisorError> {
    state.supervisor.delete_file(&id, &query.path).await?;
    Ok(Json(json!({ "success": true })))
}
