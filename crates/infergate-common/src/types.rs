use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ApiError;

/// The five request families a model name can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Chat,
    Embedding,
    Asr,
    Tts,
    Image,
}

impl ModelFamily {
    /// Wire numbering of the internal cluster protocol.
    pub fn as_u32(self) -> u32 {
        match self {
            ModelFamily::Chat => 1,
            ModelFamily::Embedding => 2,
            ModelFamily::Asr => 3,
            ModelFamily::Tts => 4,
            ModelFamily::Image => 5,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(ModelFamily::Chat),
            2 => Some(ModelFamily::Embedding),
            3 => Some(ModelFamily::Asr),
            4 => Some(ModelFamily::Tts),
            5 => Some(ModelFamily::Image),
            _ => None,
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelFamily::Chat => "chat",
            ModelFamily::Embedding => "embedding",
            ModelFamily::Asr => "asr",
            ModelFamily::Tts => "tts",
            ModelFamily::Image => "image",
        };
        f.write_str(s)
    }
}

fn missing(field: &str) -> ApiError {
    ApiError::InvalidRequest(format!("Missing '{field}' field"))
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn f32_field(v: &Value, key: &str, default: f32) -> f32 {
    v.get(key).and_then(Value::as_f64).map(|f| f as f32).unwrap_or(default)
}

/// Accepts both `"stop": "x"` and `"stop": ["x", "y"]` shapes.
fn string_or_array(v: &Value) -> Vec<String> {
    match v {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    }
}

/// Parsed `/chat/completions` request. The raw body is kept because
/// `messages` and any extension fields are opaque to this layer and must
/// survive a cluster forward untouched.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Value,
    pub stream: bool,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub n: u32,
    pub stop: Vec<String>,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub raw: Value,
}

impl ChatRequest {
    pub fn from_value(v: &Value) -> Result<Self, ApiError> {
        let model = str_field(v, "model").filter(|m| !m.is_empty()).ok_or_else(|| missing("model"))?;
        let messages = match v.get("messages") {
            Some(m @ Value::Array(_)) => m.clone(),
            _ => Value::Array(Vec::new()),
        };
        Ok(Self {
            model,
            messages,
            stream: v.get("stream").and_then(Value::as_bool).unwrap_or(false),
            temperature: f32_field(v, "temperature", 1.0),
            top_p: f32_field(v, "top_p", 1.0),
            max_tokens: v.get("max_tokens").and_then(Value::as_u64).unwrap_or(2048) as u32,
            n: v.get("n").and_then(Value::as_u64).unwrap_or(1) as u32,
            stop: v.get("stop").map(string_or_array).unwrap_or_default(),
            presence_penalty: f32_field(v, "presence_penalty", 0.0),
            frequency_penalty: f32_field(v, "frequency_penalty", 0.0),
            raw: v.clone(),
        })
    }

    /// Body sent across the internal hop; chat keeps the raw request so
    /// extension fields reach the worker intact.
    pub fn forward_payload(&self) -> Value {
        self.raw.clone()
    }
}

/// Parsed `/embeddings` request. `input` may be a string or an array of
/// strings; both normalise into `inputs`.
#[derive(Debug, Clone)]
pub struct EmbeddingRequest {
    pub model: String,
    pub inputs: Vec<String>,
    pub encoding_format: String,
    pub dimensions: Option<u32>,
}

impl EmbeddingRequest {
    pub fn from_value(v: &Value) -> Result<Self, ApiError> {
        let model = str_field(v, "model").filter(|m| !m.is_empty()).ok_or_else(|| missing("model"))?;
        Ok(Self {
            model,
            inputs: v.get("input").map(string_or_array).unwrap_or_default(),
            encoding_format: str_field(v, "encoding_format").unwrap_or_else(|| "float".to_owned()),
            dimensions: v.get("dimensions").and_then(Value::as_u64).map(|d| d as u32),
        })
    }

    pub fn forward_payload(&self) -> Value {
        let mut body = json!({
            "model": self.model,
            "input": self.inputs,
            "encoding_format": self.encoding_format,
        });
        if let Some(d) = self.dimensions {
            body["dimensions"] = json!(d);
        }
        body
    }
}

/// Parsed `/audio/transcriptions` (or translations) request. The audio
/// blob comes from the multipart form; forwarded requests carry only the
/// scalar fields.
#[derive(Debug, Clone, Default)]
pub struct AsrRequest {
    pub model: String,
    pub audio_data: Vec<u8>,
    pub filename: String,
    pub language: String,
    pub prompt: String,
    pub response_format: String,
    pub temperature: f32,
}

impl AsrRequest {
    pub fn from_value(v: &Value) -> Result<Self, ApiError> {
        let model = str_field(v, "model").filter(|m| !m.is_empty()).ok_or_else(|| missing("model"))?;
        Ok(Self {
            model,
            audio_data: Vec::new(),
            filename: String::new(),
            language: str_field(v, "language").unwrap_or_default(),
            prompt: str_field(v, "prompt").unwrap_or_default(),
            response_format: str_field(v, "response_format").unwrap_or_else(|| "json".to_owned()),
            temperature: f32_field(v, "temperature", 0.0),
        })
    }

    pub fn forward_payload(&self) -> Value {
        json!({
            "model": self.model,
            "language": self.language,
            "prompt": self.prompt,
            "response_format": self.response_format,
            "temperature": self.temperature,
        })
    }
}

/// Parsed `/audio/speech` request.
#[derive(Debug, Clone)]
pub struct TtsRequest {
    pub model: String,
    pub input: String,
    pub voice: String,
    pub response_format: String,
    pub speed: f32,
}

impl TtsRequest {
    pub fn from_value(v: &Value) -> Result<Self, ApiError> {
        let model = str_field(v, "model").filter(|m| !m.is_empty()).ok_or_else(|| missing("model"))?;
        Ok(Self {
            model,
            input: str_field(v, "input").unwrap_or_default(),
            voice: str_field(v, "voice").unwrap_or_else(|| "alloy".to_owned()),
            response_format: str_field(v, "response_format").unwrap_or_else(|| "mp3".to_owned()),
            speed: f32_field(v, "speed", 1.0),
        })
    }

    pub fn forward_payload(&self) -> Value {
        json!({
            "model": self.model,
            "input": self.input,
            "voice": self.voice,
            "response_format": self.response_format,
            "speed": self.speed,
        })
    }
}

/// Parsed `/images/generations` request. Keeps the raw body: size,
/// style and any extension fields pass through to the handler.
#[derive(Debug, Clone)]
pub struct ImageGenRequest {
    pub prompt: String,
    pub model: String,
    pub n: u32,
    pub quality: String,
    pub response_format: String,
    pub size: String,
    pub style: String,
    pub raw: Value,
}

impl ImageGenRequest {
    pub fn from_value(v: &Value) -> Result<Self, ApiError> {
        Ok(Self {
            prompt: str_field(v, "prompt").unwrap_or_default(),
            model: str_field(v, "model")
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "dall-e-2".to_owned()),
            n: v.get("n").and_then(Value::as_u64).unwrap_or(1) as u32,
            quality: str_field(v, "quality").unwrap_or_else(|| "standard".to_owned()),
            response_format: str_field(v, "response_format").unwrap_or_else(|| "url".to_owned()),
            size: str_field(v, "size").unwrap_or_else(|| "1024x1024".to_owned()),
            style: str_field(v, "style").unwrap_or_else(|| "vivid".to_owned()),
            raw: v.clone(),
        })
    }

    pub fn forward_payload(&self) -> Value {
        self.raw.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_requires_model() {
        let err = ChatRequest::from_value(&json!({"messages": []})).unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)));
    }

    #[test]
    fn chat_stop_accepts_string_and_array() {
        let req = ChatRequest::from_value(&json!({"model": "m", "stop": "a"})).unwrap();
        assert_eq!(req.stop, vec!["a"]);
        let req = ChatRequest::from_value(&json!({"model": "m", "stop": ["a", "b"]})).unwrap();
        assert_eq!(req.stop, vec!["a", "b"]);
    }

    #[test]
    fn chat_defaults() {
        let req = ChatRequest::from_value(&json!({"model": "m"})).unwrap();
        assert!(!req.stream);
        assert_eq!(req.max_tokens, 2048);
        assert_eq!(req.n, 1);
        assert_eq!(req.temperature, 1.0);
    }

    #[test]
    fn chat_keeps_raw_for_forwarding() {
        let body = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}], "custom": 7});
        let req = ChatRequest::from_value(&body).unwrap();
        assert_eq!(req.forward_payload(), body);
    }

    #[test]
    fn embedding_input_shapes() {
        let req = EmbeddingRequest::from_value(&json!({"model": "e", "input": "one"})).unwrap();
        assert_eq!(req.inputs, vec!["one"]);
        let req =
            EmbeddingRequest::from_value(&json!({"model": "e", "input": ["one", "two"]})).unwrap();
        assert_eq!(req.inputs, vec!["one", "two"]);
        assert_eq!(req.encoding_format, "float");
    }

    #[test]
    fn embedding_forward_round_trip() {
        let req =
            EmbeddingRequest::from_value(&json!({"model": "e", "input": ["a"], "dimensions": 8}))
                .unwrap();
        let back = EmbeddingRequest::from_value(&req.forward_payload()).unwrap();
        assert_eq!(back.inputs, req.inputs);
        assert_eq!(back.dimensions, Some(8));
    }

    #[test]
    fn tts_defaults() {
        let req = TtsRequest::from_value(&json!({"model": "t", "input": "say"})).unwrap();
        assert_eq!(req.voice, "alloy");
        assert_eq!(req.response_format, "mp3");
        assert_eq!(req.speed, 1.0);
    }

    #[test]
    fn image_defaults_model() {
        let req = ImageGenRequest::from_value(&json!({"prompt": "a cat"})).unwrap();
        assert_eq!(req.model, "dall-e-2");
        assert_eq!(req.size, "1024x1024");
    }

    #[test]
    fn family_wire_numbering() {
        for family in [
            ModelFamily::Chat,
            ModelFamily::Embedding,
            ModelFamily::Asr,
            ModelFamily::Tts,
            ModelFamily::Image,
        ] {
            assert_eq!(ModelFamily::from_u32(family.as_u32()), Some(family));
        }
        assert_eq!(ModelFamily::from_u32(0), None);
        assert_eq!(ModelFamily::from_u32(6), None);
    }
}
