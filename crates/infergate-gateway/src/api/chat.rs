use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::debug;

use infergate_common::{ApiError, ChatRequest, OutputChunk, StreamChannel};

use crate::api::{chunk_error_response, error_response, json_response, parse_json, unknown_model};
use crate::encoder::{ChatJsonEncoder, ChatSseEncoder, Encoder};
use crate::state::GatewayState;

pub async fn chat_completions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(err) = state.authorize(&headers) {
        return error_response(&err);
    }
    let Some(permit) = state.slots.acquire(state.config.wait_timeout()).await else {
        return error_response(&ApiError::RateLimited);
    };

    let json = match parse_json(&body) {
        Ok(v) => v,
        Err(err) => return error_response(&err),
    };
    let request = match ChatRequest::from_value(&json) {
        Ok(r) => r,
        Err(err) => return error_response(&err),
    };

    if !state.router.has_chat_model(&request.model) {
        return error_response(&unknown_model(
            &request.model,
            &state.router.list_chat_models(),
        ));
    }

    let channel = state.new_channel();
    let stream = request.stream;
    if !state.router.route_chat(request, channel.clone()) {
        return error_response(&ApiError::Server("Failed to route request".to_string()));
    }

    if stream {
        stream_response(state, channel, permit)
    } else {
        let response = unary_response(&state, &channel).await;
        drop(permit);
        response
    }
}

async fn unary_response(state: &GatewayState, channel: &StreamChannel) -> Response {
    match channel.wait_pop_for(state.config.default_timeout()).await {
        None => error_response(&ApiError::Timeout("Request timeout".to_string())),
        Some(OutputChunk::Error { code, message }) => chunk_error_response(&code, &message),
        Some(chunk) => json_response(ChatJsonEncoder.encode(&chunk)),
    }
}

/// SSE drain loop. Polls the channel in short steps so the overall
/// request timeout, channel termination and client disconnect are all
/// observed promptly; every exit path writes the `[DONE]` marker first.
fn stream_response(
    state: Arc<GatewayState>,
    channel: Arc<StreamChannel>,
    permit: OwnedSemaphorePermit,
) -> Response {
    let (tx, rx) = mpsc::channel::<String>(32);
    let timeout = state.config.default_timeout();

    tokio::spawn(async move {
        let _permit = permit;
        let encoder = ChatSseEncoder::new();
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout || channel.is_ended() {
                let _ = tx.send(encoder.done_marker().to_string()).await;
                break;
            }
            match channel.wait_pop_for(Duration::from_millis(10)).await {
                None => continue,
                Some(chunk) if chunk.is_end() => {
                    let _ = tx.send(encoder.done_marker().to_string()).await;
                    break;
                }
                Some(chunk) => {
                    let frame = encoder.encode(&chunk);
                    if frame.is_empty() {
                        continue;
                    }
                    if tx.send(frame).await.is_err() {
                        debug!("client went away mid-stream");
                        channel.disconnect();
                        break;
                    }
                }
            }
        }
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}
