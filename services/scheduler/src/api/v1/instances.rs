//! Instance listing across all services.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};

use super::ListResponse;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::control;
use crate::state::AppState;

/// /v1/instances
pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(list_instances))
}

/// GET /v1/instances
async fn list_instances(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let instances = control::load_running_services(state.records())
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;
    Ok(Json(ListResponse::from(instances)))
}
