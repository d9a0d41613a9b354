//! Service endpoints.
//!
//! Declaring a service only writes its record; the listener picks the
//! change up and converges the instance set.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use shepherd_id::{InstanceId, ServiceId};
use shepherd_reconcile::RunState;

use super::ListResponse;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::control;
use crate::records::{Service, ServiceEndpoint};
use crate::state::AppState;

/// /v1/services
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_services))
        .route(
            "/{service_id}",
            get(get_service).put(put_service).delete(delete_service),
        )
        .route("/{service_id}/stop", post(stop_service))
        .route("/{service_id}/instances", get(list_service_instances))
        .route(
            "/{service_id}/instances/{instance_id}",
            delete(remove_instance),
        )
}

// =============================================================================
// Request Types
// =============================================================================

/// Body of `PUT /v1/services/{service_id}`.
#[derive(Debug, Deserialize)]
pub struct PutServiceRequest {
    /// Display name; defaults to the service ID.
    #[serde(default)]
    pub name: Option<String>,

    pub desired_state: RunState,

    pub instances: u32,

    #[serde(default)]
    pub change_options: Vec<String>,

    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,
}

impl PutServiceRequest {
    fn into_service(self, id: ServiceId) -> Service {
        Service {
            name: self.name.unwrap_or_else(|| id.to_string()),
            id,
            desired_state: self.desired_state,
            instances: self.instances,
            change_options: self.change_options,
            endpoints: self.endpoints,
        }
    }
}

fn parse_service_id(raw: &str, ctx: &RequestContext) -> Result<ServiceId, ApiError> {
    ServiceId::parse(raw).map_err(|e| {
        ApiError::bad_request("invalid_service_id", e.to_string())
            .with_request_id(ctx.request_id.clone())
    })
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /v1/services
async fn list_services(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let services = control::list_services(state.records())
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;
    Ok(Json(ListResponse::from(services)))
}

/// GET /v1/services/{service_id}
async fn get_service(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(service_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let service_id = parse_service_id(&service_id, &ctx)?;
    let service = control::get_service(state.records(), &service_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;
    Ok(Json(service))
}

/// PUT /v1/services/{service_id}
async fn put_service(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(service_id): Path<String>,
    Json(req): Json<PutServiceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let service = req.into_service(parse_service_id(&service_id, &ctx)?);
    control::update_service(state.records(), &service)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;
    Ok(Json(service))
}

/// DELETE /v1/services/{service_id}
///
/// Refused with 409 while the service still has instances.
async fn delete_service(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(service_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let service_id = parse_service_id(&service_id, &ctx)?;
    control::remove_service(state.records(), &service_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/services/{service_id}/stop
async fn stop_service(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(service_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let service_id = parse_service_id(&service_id, &ctx)?;
    let service = control::stop_service(state.records(), &service_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;
    Ok(Json(service))
}

/// GET /v1/services/{service_id}/instances
async fn list_service_instances(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(service_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let service_id = parse_service_id(&service_id, &ctx)?;
    let instances = control::load_running_services_by_service(state.records(), &service_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;
    Ok(Json(ListResponse::from(instances)))
}

/// DELETE /v1/services/{service_id}/instances/{instance_id}
///
/// Removes the instance's records outright. The listener starts a
/// replacement on its next pass if the service still wants one.
async fn remove_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((service_id, instance_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let service_id = parse_service_id(&service_id, &ctx)?;
    let instance_id: InstanceId = instance_id.parse().map_err(|_| {
        ApiError::bad_request("invalid_instance_id", "Invalid instance ID format")
            .with_request_id(ctx.request_id.clone())
    })?;

    let record = state
        .records()
        .get_service_state(&service_id, &instance_id)
        .await
        .map_err(|e| {
            let err = if e.is_not_found() {
                ApiError::not_found(
                    "instance_not_found",
                    format!("Instance {instance_id} not found in service {service_id}"),
                )
            } else {
                ApiError::from(control::ControlError::from(e))
            };
            err.with_request_id(ctx.request_id.clone())
        })?;

    state
        .reconciler()
        .remove_instance(&service_id, &record.host_id, instance_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_service_request_defaults() {
        let req: PutServiceRequest =
            serde_json::from_str(r#"{"desired_state":"run","instances":3}"#).unwrap();
        let service = req.into_service(ServiceId::parse("web").unwrap());
        assert_eq!(service.name, "web");
        assert_eq!(service.instances, 3);
        assert!(service.endpoints.is_empty());
    }

    #[test]
    fn test_put_service_request_rejects_unknown_state() {
        let result: Result<PutServiceRequest, _> =
            serde_json::from_str(r#"{"desired_state":"restart","instances":1}"#);
        assert!(result.is_err());
    }
}
