//! Health check endpoint. Modeled on this codebase's database-ping-with-
//! timeout pattern, extended with queue and quote-source reachability so the
//! probe reflects the three dependencies the collector actually needs.

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use crate::kernel::Kernel;
use crate::queue::JobQueue;

#[derive(Clone)]
pub struct HealthState {
    pub kernel: Arc<Kernel>,
    pub queue: Arc<dyn JobQueue>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    healthy: bool,
    database: bool,
    queue: bool,
    quote_source: bool,
}

/// Builds the `/health` router. Returns `200` when every dependency check
/// passes, `503` otherwise.
pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = tokio::time::timeout(
        Duration::from_secs(5),
        sqlx::query("SELECT 1").execute(&state.kernel.db_pool),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false);

    let queue = state.queue.is_connected();

    let quote_source = tokio::time::timeout(
        Duration::from_secs(5),
        state.kernel.quote_source.health_check(),
    )
    .await
    .unwrap_or(false);

    let healthy = database && queue && quote_source;

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            healthy,
            database,
            queue,
            quote_source,
        }),
    )
}
