use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::GatewayState;

pub async fn health(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "concurrency": state.slots.in_use(),
        "max_concurrency": state.slots.max(),
    }))
}
