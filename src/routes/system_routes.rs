use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use serde_json::json;

use crate::services::broker::BrokerStats;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/alive", get(is_alive))
        .route("/version", get(version))
        .route("/stats", get(stats))
        .with_state(state)
}

/// GET /system/alive
async fn is_alive() -> &'static str {
    "OK"
}

/// GET /system/version
async fn version(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "version": state.config.server_version,
        "started_at": state.started_at.to_rfc3339(),
    }))
}

/// GET /system/stats
///
/// Pending channels, subscriptions and publisher waiters right now.
async fn stats(State(state): State<AppState>) -> Json<BrokerStats> {
    Json(state.broker.stats())
}
