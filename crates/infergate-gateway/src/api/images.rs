use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::Bytes;

use infergate_common::{ApiError, ImageGenRequest, OutputChunk};

use crate::api::{chunk_error_response, error_response, json_response, parse_json, unknown_model};
use crate::encoder::{Encoder, ImagesJsonEncoder};
use crate::state::GatewayState;

pub async fn generations(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(err) = state.authorize(&headers) {
        return error_response(&err);
    }
    let Some(_permit) = state.slots.acquire(state.config.wait_timeout()).await else {
        return error_response(&ApiError::RateLimited);
    };

    let json = match parse_json(&body) {
        Ok(v) => v,
        Err(err) => return error_response(&err),
    };
    let request = match ImageGenRequest::from_value(&json) {
        Ok(r) => r,
        Err(err) => return error_response(&err),
    };
    if request.prompt.is_empty() {
        return error_response(&ApiError::InvalidRequest(
            "Missing 'prompt' field".to_string(),
        ));
    }

    if !state.router.has_image_model(&request.model) {
        return error_response(&unknown_model(
            &request.model,
            &state.router.list_image_models(),
        ));
    }

    let channel = state.new_channel();
    if !state.router.route_image(request, channel.clone()) {
        return error_response(&ApiError::Server("Failed to route request".to_string()));
    }

    match channel.wait_pop_for(state.config.default_timeout()).await {
        None => error_response(&ApiError::Timeout("Request timeout".to_string())),
        Some(OutputChunk::Error { code, message }) => chunk_error_response(&code, &message),
        Some(chunk) => json_response(ImagesJsonEncoder.encode(&chunk)),
    }
}
