//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub database: &'static str,
    pub payments: &'static str,
    pub assistant: &'static str,
}

async fn database_ok(state: &AppState) -> bool {
    // The settings row must exist for booking to work at all
    sqlx::query_scalar::<_, i32>("SELECT id FROM site_settings WHERE id = 1")
        .fetch_optional(&state.pool)
        .await
        .map(|row| row.is_some())
        .unwrap_or(false)
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_ok = database_ok(&state).await;
    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if db_ok { "healthy" } else { "unhealthy" },
            version: env!("CARGO_PKG_VERSION"),
            database: if db_ok { "healthy" } else { "unhealthy" },
            payments: if state.billing.is_stripe_enabled() {
                "enabled"
            } else {
                "disabled"
            },
            assistant: if state.assistant.llm_enabled() {
                "llm"
            } else {
                "knowledge_only"
            },
        }),
    )
}

/// Liveness check (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness check (is the service ready to accept traffic)
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if database_ok(&state).await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
