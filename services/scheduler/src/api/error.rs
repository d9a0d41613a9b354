//! Problem-details error responses (RFC 7807).

use axum::{
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::control::ControlError;
use crate::error::{EngineError, RecordError};

const PROBLEM_BASE: &str = "https://shepherd.dev/problems";

/// Body returned for every failed request.
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: &'static str,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    /// Stable machine-readable error code.
    pub code: &'static str,
    pub request_id: String,
    /// Whether the same request may succeed if sent again.
    pub retryable: bool,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        let problem = ProblemDetails {
            r#type: format!("{PROBLEM_BASE}/{code}"),
            title: status.canonical_reason().unwrap_or("Error"),
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: String::new(),
            retryable: status == StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            problem: Box::new(problem),
        }
    }

    pub fn bad_request(code: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, detail)
    }

    pub fn not_found(code: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, detail)
    }

    pub fn conflict(code: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, detail)
    }

    pub fn internal(code: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, detail)
    }

    pub fn service_unavailable(code: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, code, detail)
    }

    #[must_use]
    pub fn retryable(mut self) -> Self {
        self.problem.retryable = true;
        self
    }

    /// Tags the problem with the caller's request ID, which also serves as
    /// the problem instance unless one was set.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        let request_id = request_id.into();
        self.problem
            .instance
            .get_or_insert_with(|| request_id.clone());
        self.problem.request_id = request_id;
        self
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        match &err {
            ControlError::NotFound(_) => Self::not_found("service_not_found", err.to_string()),
            ControlError::Busy { .. } => Self::conflict("service_busy", err.to_string()),
            ControlError::Conflict(_) => {
                Self::conflict("concurrent_modification", err.to_string()).retryable()
            }
            ControlError::Records(e) => {
                error!(error = %e, "Record store request failed");
                Self::service_unavailable("store_error", "Coordination store request failed")
            }
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        error!(error = %err, "Reconciliation request failed");
        match &err {
            EngineError::Records(RecordError::Decode { .. } | RecordError::Encode(_)) => {
                Self::internal("record_corrupt", err.to_string())
            }
            _ => Self::service_unavailable("reconcile_error", err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            [(CONTENT_TYPE, "application/problem+json")],
            Json(self.problem),
        )
            .into_response()
    }
}
