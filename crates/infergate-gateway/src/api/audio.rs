use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use infergate_common::{ApiError, AsrRequest, OutputChunk, TtsRequest};

use crate::api::{chunk_error_response, error_response, json_response, parse_json, unknown_model};
use crate::encoder::{
    AsrJsonEncoder, AsrTextEncoder, AsrVerboseJsonEncoder, Encoder, TtsBinaryEncoder,
};
use crate::state::GatewayState;

/// `POST /audio/transcriptions`: multipart form with `file` and
/// `model` plus optional whisper parameters.
pub async fn transcriptions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    run_asr(state, headers, multipart).await
}

/// Translations share the transcription pipeline; the handler decides
/// what to do with the language field.
pub async fn translations(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    run_asr(state, headers, multipart).await
}

async fn run_asr(
    state: Arc<GatewayState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    if let Err(err) = state.authorize(&headers) {
        return error_response(&err);
    }
    let Some(_permit) = state.slots.acquire(state.config.wait_timeout()).await else {
        return error_response(&ApiError::RateLimited);
    };

    let request = match parse_asr_form(multipart).await {
        Ok(r) => r,
        Err(err) => return error_response(&err),
    };
    if request.model.is_empty() {
        return error_response(&ApiError::InvalidRequest(
            "Missing 'model' field".to_string(),
        ));
    }

    if !state.router.has_asr_model(&request.model) {
        return error_response(&unknown_model(
            &request.model,
            &state.router.list_asr_models(),
        ));
    }

    let response_format = request.response_format.clone();
    let channel = state.new_channel();
    if !state.router.route_asr(request, channel.clone()) {
        return error_response(&ApiError::Server("Failed to route request".to_string()));
    }

    let chunk = match channel.wait_pop_for(state.config.default_timeout()).await {
        None => return error_response(&ApiError::Timeout("Request timeout".to_string())),
        Some(OutputChunk::Error { code, message }) => {
            return chunk_error_response(&code, &message)
        }
        Some(chunk) => chunk,
    };

    match response_format.as_str() {
        "text" => (
            [(header::CONTENT_TYPE, "text/plain")],
            AsrTextEncoder.encode(&chunk),
        )
            .into_response(),
        "verbose_json" => json_response(AsrVerboseJsonEncoder.encode(&chunk)),
        _ => json_response(AsrJsonEncoder.encode(&chunk)),
    }
}

async fn parse_asr_form(mut multipart: Multipart) -> Result<AsrRequest, ApiError> {
    let mut request = AsrRequest {
        response_format: "json".to_string(),
        ..AsrRequest::default()
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                request.filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::InvalidRequest(format!("Invalid 'file' field: {e}")))?;
                request.audio_data = bytes.to_vec();
            }
            "model" => request.model = read_text(field).await?,
            "language" => request.language = read_text(field).await?,
            "prompt" => request.prompt = read_text(field).await?,
            "response_format" => request.response_format = read_text(field).await?,
            "temperature" => {
                request.temperature = read_text(field).await?.parse().unwrap_or(0.0);
            }
            _ => {}
        }
    }
    Ok(request)
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid form field: {e}")))
}

/// `POST /audio/speech`: JSON in, raw audio bytes out.
pub async fn speech(
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
    let request = match TtsRequest::from_value(&json) {
        Ok(r) => r,
        Err(err) => return error_response(&err),
    };
    if request.input.is_empty() {
        return error_response(&ApiError::InvalidRequest(
            "Missing 'input' field".to_string(),
        ));
    }

    if !state.router.has_tts_model(&request.model) {
        return error_response(&unknown_model(
            &request.model,
            &state.router.list_tts_models(),
        ));
    }

    let channel = state.new_channel();
    if !state.router.route_tts(request, channel.clone()) {
        return error_response(&ApiError::Server("Failed to route request".to_string()));
    }

    match channel.wait_pop_for(state.config.default_timeout()).await {
        None => error_response(&ApiError::Timeout("Request timeout".to_string())),
        Some(OutputChunk::Error { code, message }) => chunk_error_response(&code, &message),
        Some(OutputChunk::AudioBytes { bytes, mime, .. }) => {
            let mime = TtsBinaryEncoder::mime_or_default(&mime);
            ([(header::CONTENT_TYPE, mime)], bytes).into_response()
        }
        Some(_) => error_response(&ApiError::Server(
            "Model produced no audio output".to_string(),
        )),
    }
}
