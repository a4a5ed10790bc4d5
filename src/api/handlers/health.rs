//! Health and status endpoints

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::api::server::AppState;
use crate::error::PoolError;
use crate::models::ProxyQuery;

/// Liveness
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "proxylist"
        })),
    )
}

/// Uptime, store counts and the latest cycle statistics
pub async fn status(State(state): State<AppState>) -> Result<impl IntoResponse, PoolError> {
    let total = state.store.count(&ProxyQuery::new()).await?;
    let active = state.store.count(&ProxyQuery::new().active(true)).await?;
    let last_cycle = state.cycle_stats.borrow().clone();

    Ok(Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "proxies": {
            "total": total,
            "active": active,
        },
        "last_cycle": last_cycle,
    })))
}
