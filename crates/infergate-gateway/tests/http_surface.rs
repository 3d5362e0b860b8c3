use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use infergate_common::{
    ChatRequest, EmbeddingRequest, GatewayConfig, ImageGenRequest, OutputChunk, StreamChannel,
    TtsRequest,
};
use infergate_gateway::{app, GatewayState};
use infergate_router::ModelRouter;

fn demo_router() -> Arc<ModelRouter> {
    let router = Arc::new(ModelRouter::new());

    router.register_chat("gpt-4", |req: ChatRequest, out: Arc<StreamChannel>| async move {
        if req.stream {
            for part in ["Hello", " ", "World"] {
                out.push(OutputChunk::text_delta(part, &req.model));
            }
        }
        out.push(OutputChunk::final_text("Hello World", &req.model));
        out.end();
        Ok(())
    });

    router.register_embedding(
        "embed-1",
        |req: EmbeddingRequest, out: Arc<StreamChannel>| async move {
            let vectors = (0..req.inputs.len())
                .map(|i| vec![i as f32, 1.0])
                .collect();
            out.push(OutputChunk::embeddings(vectors, &req.model));
            out.end();
            Ok(())
        },
    );

    router.register_tts("tts-1", |req: TtsRequest, out: Arc<StreamChannel>| async move {
        out.push(OutputChunk::audio(vec![1, 2, 3, 4], "audio/wav", &req.model));
        out.end();
        Ok(())
    });

    router.register_image(
        "dall-e-2",
        |req: ImageGenRequest, out: Arc<StreamChannel>| async move {
            out.push(OutputChunk::image(vec![9, 9], "image/png", &req.model));
            out.end();
            Ok(())
        },
    );

    router
}

fn test_app(api_key: &str) -> Router {
    let config = GatewayConfig {
        api_key: api_key.to_string(),
        ..GatewayConfig::default()
    };
    app(GatewayState::new(demo_router(), config))
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_concurrency() {
    let response = test_app("")
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["max_concurrency"], 10);
}

#[tokio::test]
async fn models_lists_the_union_under_both_prefixes() {
    for uri in ["/models", "/v1/models"] {
        let response = test_app("")
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let ids: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["dall-e-2", "embed-1", "gpt-4", "tts-1"]);
        assert_eq!(body["data"][0]["object"], "model");
        assert_eq!(body["data"][0]["owned_by"], "infergate");
    }
}

#[tokio::test]
async fn missing_bearer_is_rejected() {
    let response = test_app("sk-test")
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"model": "gpt-4", "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "unauthorized");
}

#[tokio::test]
async fn bearer_is_accepted() {
    let mut request = post_json(
        "/v1/chat/completions",
        json!({"model": "gpt-4", "messages": []}),
    );
    request.headers_mut().insert(
        header::AUTHORIZATION,
        header::HeaderValue::from_static("Bearer sk-test"),
    );
    let response = test_app("sk-test").oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn invalid_json_is_a_400() {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = test_app("").oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn missing_model_field_is_a_400() {
    let response = test_app("")
        .oneshot(post_json("/v1/chat/completions", json!({"messages": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("model"));
}

#[tokio::test]
async fn unknown_model_names_the_available_ones() {
    let response = test_app("")
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"model": "gpt-99", "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    let msg = body["error"]["message"].as_str().unwrap();
    assert!(msg.contains("gpt-99"));
    assert!(msg.contains("Available models"));
    assert!(msg.contains("gpt-4"));
}

#[tokio::test]
async fn chat_completion_unary() {
    let response = test_app("")
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "gpt-4");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello World");
}

#[tokio::test]
async fn chat_completion_streams_sse_frames() {
    let response = test_app("")
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"model": "gpt-4", "messages": [], "stream": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let frames: Vec<&str> = text
        .split("\n\n")
        .filter(|f| !f.is_empty())
        .collect();

    // Three deltas, one finish frame, then the terminator.
    assert_eq!(frames.len(), 5);
    let expected = ["Hello", " ", "World"];
    for (frame, want) in frames.iter().zip(expected) {
        let v: Value =
            serde_json::from_str(frame.strip_prefix("data: ").unwrap()).unwrap();
        assert_eq!(v["choices"][0]["delta"]["content"], want);
        assert!(v["choices"][0]["finish_reason"].is_null());
    }
    let finish: Value =
        serde_json::from_str(frames[3].strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(finish["choices"][0]["finish_reason"], "stop");
    assert_eq!(frames[4], "data: [DONE]");
}

#[tokio::test]
async fn embeddings_preserve_order_and_count() {
    let response = test_app("")
        .oneshot(post_json(
            "/v1/embeddings",
            json!({"model": "embed-1", "input": ["a", "b", "c"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 3);
    for (i, item) in data.iter().enumerate() {
        assert_eq!(item["index"], i as u64);
        assert_eq!(item["embedding"][0], i as f64);
    }
}

#[tokio::test]
async fn embeddings_require_input() {
    let response = test_app("")
        .oneshot(post_json("/v1/embeddings", json!({"model": "embed-1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"]["message"].as_str().unwrap().contains("input"));
}

#[tokio::test]
async fn speech_returns_audio_bytes_with_mime() {
    let response = test_app("")
        .oneshot(post_json(
            "/v1/audio/speech",
            json!({"model": "tts-1", "input": "hello"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/wav");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(bytes.as_ref(), &[1, 2, 3, 4]);
}

#[tokio::test]
async fn image_generation_returns_base64() {
    let response = test_app("")
        .oneshot(post_json(
            "/v1/images/generations",
            json!({"model": "dall-e-2", "prompt": "a tiny square"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["data"][0]["b64_json"].is_string());
}

#[tokio::test]
async fn image_generation_requires_prompt() {
    let response = test_app("")
        .oneshot(post_json("/v1/images/generations", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_route_is_openai_shaped_404() {
    let response = test_app("")
        .oneshot(Request::get("/v1/does-not-exist").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "not_found");
}
