//! Probe endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use shepherd_coord::path::ROOT;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok` or `degraded`.
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
    /// Reported by `/readyz` only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreStatus>,
}

#[derive(Debug, Serialize)]
pub struct StoreStatus {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

fn response(status: &'static str, store: Option<StoreStatus>) -> HealthResponse {
    HealthResponse {
        status,
        service: "scheduler",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
        store,
    }
}

async fn healthz() -> impl IntoResponse {
    Json(response("ok", None))
}

/// Ready once the coordination store answers a read.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let (code, status, store) = match state.records().conn().exists(ROOT).await {
        Ok(_) => (StatusCode::OK, "ok", StoreStatus { status: "ok", error: None }),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "degraded",
            StoreStatus {
                status: "unavailable",
                error: Some(e.to_string()),
            },
        ),
    };
    (code, Json(response(status, Some(store))))
}

async fn livez() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let response = healthz().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_livez_returns_ok() {
        let response = livez().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_health_response_omits_store() {
        let json = serde_json::to_value(response("ok", None)).unwrap();
        assert_eq!(json["service"], "scheduler");
        assert!(json.get("store").is_none());
    }
}
