use base64::{engine::general_purpose, Engine as _};
use serde_json::json;

use infergate_common::OutputChunk;

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

fn epoch_or_now(created: i64) -> i64 {
    if created > 0 {
        created
    } else {
        now_epoch()
    }
}

fn model_or(model: &str, default: &str) -> String {
    if model.is_empty() {
        default.to_string()
    } else {
        model.to_string()
    }
}

/// 24 lowercase hex chars behind the given prefix, e.g. `chatcmpl-xxxx`.
pub fn generate_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &hex[..24])
}

/// Maps output chunks onto one specific HTTP wire shape.
pub trait Encoder {
    /// Encode a single chunk. An empty string means "nothing to write
    /// for this chunk kind".
    fn encode(&self, chunk: &OutputChunk) -> String;

    /// Terminator written after the last frame. Non-empty only for SSE.
    fn done_marker(&self) -> &'static str {
        ""
    }
}

/// `chat.completion.chunk` frames in Server-Sent-Events form. All
/// frames of one response stream share a generated id.
pub struct ChatSseEncoder {
    id: String,
}

impl ChatSseEncoder {
    pub fn new() -> Self {
        Self {
            id: generate_id("chatcmpl"),
        }
    }
}

impl Default for ChatSseEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for ChatSseEncoder {
    fn encode(&self, chunk: &OutputChunk) -> String {
        let data = match chunk {
            OutputChunk::TextDelta {
                text,
                model,
                created,
                ..
            } => json!({
                "id": self.id,
                "object": "chat.completion.chunk",
                "created": epoch_or_now(*created),
                "model": model_or(model, "gpt-4"),
                "choices": [{
                    "index": 0,
                    "delta": {"role": "assistant", "content": text},
                    "finish_reason": null,
                }],
            }),
            OutputChunk::FinalText { model, created, .. } => json!({
                "id": self.id,
                "object": "chat.completion.chunk",
                "created": epoch_or_now(*created),
                "model": model_or(model, "gpt-4"),
                "choices": [{
                    "index": 0,
                    "delta": {},
                    "finish_reason": "stop",
                }],
            }),
            OutputChunk::Error { code, message } => json!({
                "error": {"message": message, "type": code},
            }),
            OutputChunk::End => return "data: [DONE]\n\n".to_string(),
            _ => return String::new(),
        };
        format!("data: {data}\n\n")
    }

    fn done_marker(&self) -> &'static str {
        "data: [DONE]\n\n"
    }
}

/// Single non-streaming `chat.completion` envelope.
pub struct ChatJsonEncoder;

impl Encoder for ChatJsonEncoder {
    fn encode(&self, chunk: &OutputChunk) -> String {
        let (text, model, created) = match chunk {
            OutputChunk::FinalText {
                text,
                model,
                created,
                ..
            }
            | OutputChunk::TextDelta {
                text,
                model,
                created,
                ..
            } => (text.as_str(), model.as_str(), *created),
            _ => ("", "", 0),
        };
        json!({
            "id": generate_id("chatcmpl"),
            "object": "chat.completion",
            "created": epoch_or_now(created),
            "model": model_or(model, "gpt-4"),
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0},
        })
        .to_string()
    }
}

/// `{object: "list", data: [{embedding, index}, ..]}` handling both the
/// single and the batch event uniformly.
pub struct EmbeddingsJsonEncoder;

impl Encoder for EmbeddingsJsonEncoder {
    fn encode(&self, chunk: &OutputChunk) -> String {
        let (data, model) = match chunk {
            OutputChunk::Embedding {
                vector,
                model,
                index,
                ..
            } => (
                vec![json!({"object": "embedding", "index": index, "embedding": vector})],
                model.as_str(),
            ),
            OutputChunk::Embeddings { vectors, model, .. } => (
                vectors
                    .iter()
                    .enumerate()
                    .map(|(i, v)| json!({"object": "embedding", "index": i, "embedding": v}))
                    .collect(),
                model.as_str(),
            ),
            _ => (Vec::new(), ""),
        };
        json!({
            "object": "list",
            "data": data,
            "model": model_or(model, "text-embedding-ada-002"),
            "usage": {"prompt_tokens": 0, "total_tokens": 0},
        })
        .to_string()
    }
}

/// Whisper-style `{text}` body.
pub struct AsrJsonEncoder;

impl Encoder for AsrJsonEncoder {
    fn encode(&self, chunk: &OutputChunk) -> String {
        let text = match chunk {
            OutputChunk::FinalText { text, .. } | OutputChunk::TextDelta { text, .. } => {
                text.as_str()
            }
            _ => "",
        };
        json!({"text": text}).to_string()
    }
}

/// Plain-text transcription body.
pub struct AsrTextEncoder;

impl Encoder for AsrTextEncoder {
    fn encode(&self, chunk: &OutputChunk) -> String {
        match chunk {
            OutputChunk::FinalText { text, .. } | OutputChunk::TextDelta { text, .. } => {
                text.clone()
            }
            _ => String::new(),
        }
    }
}

/// Whisper verbose body. A `JsonObject` chunk may supply `language`,
/// `duration` and `segments`; a plain text chunk gets defaults.
pub struct AsrVerboseJsonEncoder;

impl Encoder for AsrVerboseJsonEncoder {
    fn encode(&self, chunk: &OutputChunk) -> String {
        let mut body = json!({
            "task": "transcribe",
            "language": "",
            "duration": 0.0,
            "text": "",
            "segments": [],
        });
        match chunk {
            OutputChunk::FinalText { text, .. } | OutputChunk::TextDelta { text, .. } => {
                body["text"] = json!(text);
            }
            OutputChunk::JsonObject { value, .. } => {
                for key in ["language", "duration", "text", "segments"] {
                    if let Some(v) = value.get(key) {
                        body[key] = v.clone();
                    }
                }
            }
            _ => {}
        }
        body.to_string()
    }
}

/// Raw audio passthrough. Bytes travel out-of-band of [`Encoder`]; this
/// type only resolves the response MIME.
pub struct TtsBinaryEncoder;

impl TtsBinaryEncoder {
    pub fn mime_or_default(mime: &str) -> String {
        if mime.is_empty() {
            "audio/mpeg".to_string()
        } else {
            mime.to_string()
        }
    }
}

impl Encoder for TtsBinaryEncoder {
    fn encode(&self, _chunk: &OutputChunk) -> String {
        String::new()
    }
}

/// DALL-E style body: base64 for byte events, passthrough for
/// URL-shaped JSON objects.
pub struct ImagesJsonEncoder;

impl Encoder for ImagesJsonEncoder {
    fn encode(&self, chunk: &OutputChunk) -> String {
        match chunk {
            OutputChunk::ImageBytes { bytes, created, .. } => json!({
                "created": epoch_or_now(*created),
                "data": [{
                    "b64_json": general_purpose::STANDARD.encode(bytes),
                    "revised_prompt": "",
                }],
            })
            .to_string(),
            OutputChunk::JsonObject { value, .. } => value.to_string(),
            _ => String::new(),
        }
    }
}

/// OpenAI error body `{"error": {"message", "type", "code"}}`.
pub fn error_body(code: &str, message: &str) -> String {
    json!({"error": {"message": message, "type": code, "code": code}}).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn parse_sse(frame: &str) -> Value {
        let frame = frame.strip_prefix("data: ").unwrap();
        serde_json::from_str(frame.trim_end()).unwrap()
    }

    #[test]
    fn sse_delta_round_trips_text() {
        let enc = ChatSseEncoder::new();
        let frame = enc.encode(&OutputChunk::text_delta("Hello", "gpt-4"));
        let v = parse_sse(&frame);
        assert_eq!(v["object"], "chat.completion.chunk");
        assert_eq!(v["choices"][0]["delta"]["content"], "Hello");
        assert_eq!(v["choices"][0]["delta"]["role"], "assistant");
        assert!(v["choices"][0]["finish_reason"].is_null());
        assert!(v["id"].as_str().unwrap().starts_with("chatcmpl-"));
        assert_eq!(v["id"].as_str().unwrap().len(), "chatcmpl-".len() + 24);
    }

    #[test]
    fn sse_final_has_stop_and_empty_delta() {
        let enc = ChatSseEncoder::new();
        let v = parse_sse(&enc.encode(&OutputChunk::final_text("Hello World", "gpt-4")));
        assert_eq!(v["choices"][0]["finish_reason"], "stop");
        assert_eq!(v["choices"][0]["delta"], serde_json::json!({}));
    }

    #[test]
    fn sse_ids_are_stable_within_stream() {
        let enc = ChatSseEncoder::new();
        let a = parse_sse(&enc.encode(&OutputChunk::text_delta("a", "gpt-4")));
        let b = parse_sse(&enc.encode(&OutputChunk::text_delta("b", "gpt-4")));
        assert_eq!(a["id"], b["id"]);
    }

    #[test]
    fn sse_end_and_done_marker() {
        let enc = ChatSseEncoder::new();
        assert_eq!(enc.encode(&OutputChunk::end()), "data: [DONE]\n\n");
        assert_eq!(enc.done_marker(), "data: [DONE]\n\n");
    }

    #[test]
    fn sse_error_carries_code_as_type() {
        let enc = ChatSseEncoder::new();
        let v = parse_sse(&enc.encode(&OutputChunk::error("model_error", "boom")));
        assert_eq!(v["error"]["type"], "model_error");
        assert_eq!(v["error"]["message"], "boom");
    }

    #[test]
    fn sse_skips_non_chat_chunks() {
        let enc = ChatSseEncoder::new();
        assert!(enc
            .encode(&OutputChunk::embeddings(vec![vec![0.0]], "e"))
            .is_empty());
    }

    #[test]
    fn chat_json_envelope() {
        let body: Value =
            serde_json::from_str(&ChatJsonEncoder.encode(&OutputChunk::final_text("hi", "gpt-4")))
                .unwrap();
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "hi");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["total_tokens"], 0);
    }

    #[test]
    fn embeddings_batch_keeps_order_and_indices() {
        let vectors = vec![vec![1.0f32], vec![2.0], vec![3.0]];
        let body: Value = serde_json::from_str(
            &EmbeddingsJsonEncoder.encode(&OutputChunk::embeddings(vectors, "embed-1")),
        )
        .unwrap();
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 3);
        for (i, item) in data.iter().enumerate() {
            assert_eq!(item["index"], i as u64);
            assert_eq!(item["object"], "embedding");
        }
        assert_eq!(data[2]["embedding"][0], 3.0);
        assert_eq!(body["model"], "embed-1");
    }

    #[test]
    fn embeddings_single_uses_event_index() {
        let body: Value = serde_json::from_str(
            &EmbeddingsJsonEncoder.encode(&OutputChunk::embedding(vec![0.5], "embed-1", 4)),
        )
        .unwrap();
        assert_eq!(body["data"][0]["index"], 4);
    }

    #[test]
    fn asr_encoders() {
        let chunk = OutputChunk::final_text("ahoy", "whisper-1");
        let v: Value = serde_json::from_str(&AsrJsonEncoder.encode(&chunk)).unwrap();
        assert_eq!(v["text"], "ahoy");
        assert_eq!(AsrTextEncoder.encode(&chunk), "ahoy");
        let v: Value = serde_json::from_str(&AsrVerboseJsonEncoder.encode(&chunk)).unwrap();
        assert_eq!(v["task"], "transcribe");
        assert_eq!(v["text"], "ahoy");
        assert!(v["segments"].as_array().unwrap().is_empty());
    }

    #[test]
    fn tts_mime_defaults() {
        assert_eq!(TtsBinaryEncoder::mime_or_default("audio/wav"), "audio/wav");
        assert_eq!(TtsBinaryEncoder::mime_or_default(""), "audio/mpeg");
    }

    #[test]
    fn images_b64_and_url_passthrough() {
        let body: Value = serde_json::from_str(
            &ImagesJsonEncoder.encode(&OutputChunk::image(vec![1, 2, 3], "image/png", "d")),
        )
        .unwrap();
        let b64 = body["data"][0]["b64_json"].as_str().unwrap();
        assert_eq!(general_purpose::STANDARD.decode(b64).unwrap(), vec![1, 2, 3]);

        let url = serde_json::json!({"created": 1, "data": [{"url": "http://x/y.png"}]});
        let out: Value =
            serde_json::from_str(&ImagesJsonEncoder.encode(&OutputChunk::json(url.clone(), "d")))
                .unwrap();
        assert_eq!(out, url);
    }

    #[test]
    fn error_body_shape() {
        let v: Value = serde_json::from_str(&error_body("not_found", "nope")).unwrap();
        assert_eq!(v["error"]["type"], "not_found");
        assert_eq!(v["error"]["code"], "not_found");
        assert_eq!(v["error"]["message"], "nope");
    }
}
