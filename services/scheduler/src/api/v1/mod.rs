//! API v1 routes.

mod hosts;
mod instances;
mod services;

use axum::Router;
use serde::Serialize;

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/services", services::routes())
        .nest("/instances", instances::routes())
        .nest("/hosts", hosts::routes())
}

/// Response body for list endpoints.
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        Self { items }
    }
}
