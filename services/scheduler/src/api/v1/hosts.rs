//! Host endpoints.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use shepherd_id::HostId;

use super::ListResponse;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::control;
use crate::state::AppState;

/// /v1/hosts
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_hosts))
        .route("/{host_id}/instances", get(list_host_instances))
}

/// GET /v1/hosts
async fn list_hosts(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let hosts = control::load_hosts(state.records())
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;
    Ok(Json(ListResponse::from(hosts)))
}

/// GET /v1/hosts/{host_id}/instances
async fn list_host_instances(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(host_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let host_id = HostId::parse(&host_id).map_err(|e| {
        ApiError::bad_request("invalid_host_id", e.to_string())
            .with_request_id(ctx.request_id.clone())
    })?;

    let instances = control::load_running_services_by_host(state.records(), &host_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;
    Ok(Json(ListResponse::from(instances)))
}
