use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

use super::super::IPCServer;
use crate::instance::{ConfigPatch, ServerConfig};
use crate::supervisor::error::SupervisorError;

/// GET /api/instances
pub async fn list_instances(State(state): State<IPCServer>) -> Result<impl IntoResponse, SupervisorError> {
    let instances = state.supervisor.list().await?;
    Ok(Json(instances))
}

/// GET /api/instances/:id
pub async fn get_instance(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    Ok(Json(state.supervisor.get(&id).await?))
}

/// Split a create body into id and config. Accepts `{id, config: {...}}` as
/// well as the flat `{id, name, port, ...}` form.
fn parse_create(payload: Value) -> Result<(String, ServerConfig), SupervisorError> {
    let mut obj = match payload {
        Value::Object(obj) => obj,
        _ => return Err(SupervisorError::InvalidRequest("Body must be a JSON object".into())),
    };

    let id = match obj.remove("id") {
        Some(Value::String(id)) if !id.is_empty() => id,
        _ => return Err(SupervisorError::InvalidRequest("Missing id".into())),
    };

    let config_value = match obj.remove("config") {
        Some(config @ Value::Object(_)) => config,
        Some(_) => return Err(SupervisorError::InvalidRequest("config must be an object".into())),
        None => Value::Object(obj),
    };

    let config: ServerConfig = serde_json::from_value(config_value)
        .map_err(|e| SupervisorError::InvalidRequest(format!("Invalid config: {}", e)))?;
    Ok((id, config))
}

/// POST /api/instances
pub async fn create_instance(
    State(state): State<IPCServer>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, SupervisorError> {
    let (id, config) = parse_create(payload)?;
    let instance = state.supervisor.create(&id, config).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

/// PUT /api/instances/:id
pub async fn update_instance(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
    Json(patch): Json<ConfigPatch>,
) -> Result<impl IntoResponse, SupervisorError> {
    let config = state.supervisor.update_config(&id, patch).await?;
    Ok(Json(config))
}

/// DELETE /api/instances/:id
pub async fn delete_instance(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    state.supervisor.delete(&id).await?;
    Ok(Json(json!({ "success": true })))
}
