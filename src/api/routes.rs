//! API route definitions.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::{json, Value};

use super::state::AppState;
use crate::model::{HealthCheck, NewHealthCheck};
use crate::service::ServiceError;

/// Identity recorded on runs triggered without an `X-Triggered-By` header.
pub const DEFAULT_TRIGGERED_BY: &str = "api-user";
pub const TRIGGERED_BY_HEADER: &str = "x-triggered-by";

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health-checks", get(list_checks).put(create_check))
        .route("/health-checks/{id}", get(get_check).delete(delete_check))
        .route("/health-checks/{id}/run", put(run_check))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "backend": state.service.backend_kind(),
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339()
        }
    }))
}

async fn list_checks(State(state): State<AppState>) -> Result<Json<Vec<HealthCheck>>, ServiceError> {
    Ok(Json(state.service.list().await?))
}

async fn get_check(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HealthCheck>, ServiceError> {
    Ok(Json(state.service.get(&id).await?))
}

async fn create_check(
    State(state): State<AppState>,
    Json(req): Json<NewHealthCheck>,
) -> Result<impl IntoResponse, ServiceError> {
    let created = state.service.create(req).await?;
    let location = format!("/api/health-checks/{}", created.id.as_deref().unwrap_or_default());
    Ok((StatusCode::CREATED, [(header::LOCATION, location)], Json(created)))
}

async fn delete_check(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ServiceError> {
    state.service.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_check(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<HealthCheck>, ServiceError> {
    let triggered_by = headers
        .get(TRIGGERED_BY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_TRIGGERED_BY);
    Ok(Json(state.service.run(&id, triggered_by).await?))
}
