use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::state::GatewayState;

#[derive(Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Serialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

/// Union of every registered model, local and remote alike.
pub async fn list_models(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let created = chrono::Utc::now().timestamp();
    let data = state
        .router
        .list_all_models()
        .into_iter()
        .map(|id| ModelInfo {
            id,
            object: "model".to_string(),
            created,
            owned_by: state.config.owner.clone(),
        })
        .collect();

    Json(ModelList {
        object: "list".to_string(),
        data,
    })
}
