use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::warn;

use sketch_gateway::store::blocking;
use sketch_types::api::HealthResponse;

use crate::AppState;

/// Liveness plus a trivial store round-trip. No credential required.
pub async fn health(State(hub): State<AppState>) -> impl IntoResponse {
    match blocking(&hub.db, |db| db.ping()).await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".into(),
                database: "connected".into(),
            }),
        ),
        Err(e) => {
            warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "error".into(),
                    database: "unreachable".into(),
                }),
            )
        }
    }
}
