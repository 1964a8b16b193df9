//! Pool status endpoint

use axum::extract::State;
use axum::Json;

use crate::api::server::AppState;
use crate::models::RelayStatus;

/// Uptime, rotation position and per-upstream counters
pub async fn relay_status(State(state): State<AppState>) -> Json<RelayStatus> {
    let pool = &state.pool;

    Json(RelayStatus {
        status: "running".to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        started_at: state.started_at_utc,
        pool_size: pool.len(),
        cursor: pool.cursor(),
        upstreams: pool.snapshot(),
    })
}
