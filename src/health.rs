use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub database: String,
    pub assistants: String,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let mut db_ok = true;
    let mut assistants_ok = true;

    if let Err(e) = sqlx::query("SELECT 1").fetch_one(state.store.pool()).await {
        tracing::error!("Readiness check: DB error: {}", e);
        db_ok = false;
    }

    if state.assistants.is_empty() {
        tracing::error!("Readiness check: no assistants configured");
        assistants_ok = false;
    }

    let status_code = if db_ok && assistants_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if db_ok && assistants_ok { "ready" } else { "unready" }.to_string(),
            database: if db_ok { "ok" } else { "error" }.to_string(),
            assistants: if assistants_ok { "ok" } else { "empty" }.to_string(),
        }),
    )
}
