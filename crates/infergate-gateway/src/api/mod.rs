pub mod audio;
pub mod chat;
pub mod embeddings;
pub mod health;
pub mod images;
pub mod models;

use std::sync::Arc;

use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use infergate_common::ApiError;

use crate::encoder::error_body;
use crate::state::GatewayState;

/// Assemble the public API. Every endpoint is mounted both at the root
/// and under `/v1`.
pub fn app(state: Arc<GatewayState>) -> Router {
    let api = Router::new()
        .route("/health", get(health::health))
        .route("/models", get(models::list_models))
        .route("/chat/completions", post(chat::chat_completions))
        .route("/embeddings", post(embeddings::create_embeddings))
        .route("/audio/transcriptions", post(audio::transcriptions))
        .route("/audio/translations", post(audio::translations))
        .route("/audio/speech", post(audio::speech))
        .route("/images/generations", post(images::generations))
        .with_state(state);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .merge(api.clone())
        .nest("/v1", api)
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Serve the public API until the shutdown signal flips.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<GatewayState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn not_found() -> Response {
    error_response(&ApiError::NotFound(
        "The requested resource was not found".to_string(),
    ))
}

pub(crate) fn error_response(err: &ApiError) -> Response {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        error_body(err.code(), &err.to_string()),
    )
        .into_response()
}

/// 400 carrying the error event's own code as the OpenAI error type.
pub(crate) fn chunk_error_response(code: &str, message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        [(header::CONTENT_TYPE, "application/json")],
        error_body(code, message),
    )
        .into_response()
}

pub(crate) fn json_response(body: String) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

pub(crate) fn parse_json(body: &Bytes) -> Result<Value, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid JSON: {e}")))
}

/// Rejection for a known family but unknown name, enumerating what is
/// actually registered.
pub(crate) fn unknown_model(model: &str, available: &[String]) -> ApiError {
    let mut msg = format!("Model '{model}' is not available");
    if !available.is_empty() {
        msg.push_str(". Available models: ");
        msg.push_str(&available.join(", "));
    }
    ApiError::InvalidRequest(msg)
}
