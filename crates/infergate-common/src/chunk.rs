use serde_json::Value;

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Semantic output event produced by model handlers.
///
/// Handlers emit these into a [`crate::StreamChannel`]; the HTTP layer
/// encodes them into the concrete wire format. Every producer finishes
/// with [`OutputChunk::End`], and an [`OutputChunk::Error`] is always
/// terminal.
#[derive(Debug, Clone)]
pub enum OutputChunk {
    /// Incremental piece of streamed text.
    TextDelta {
        text: String,
        model: String,
        finish_reason: Option<String>,
        created: i64,
    },
    /// Complete final text of a response.
    FinalText {
        text: String,
        model: String,
        finish_reason: Option<String>,
        created: i64,
    },
    /// A single embedding vector with its position in the batch.
    Embedding {
        vector: Vec<f32>,
        model: String,
        index: usize,
        created: i64,
    },
    /// A batch of embedding vectors, in input order.
    Embeddings {
        vectors: Vec<Vec<f32>>,
        model: String,
        created: i64,
    },
    /// Arbitrary JSON payload passed through to the client.
    JsonObject {
        value: Value,
        model: String,
        created: i64,
    },
    /// Synthesised audio.
    AudioBytes {
        bytes: Vec<u8>,
        mime: String,
        model: String,
        created: i64,
    },
    /// Generated image.
    ImageBytes {
        bytes: Vec<u8>,
        mime: String,
        model: String,
        created: i64,
    },
    /// Terminal error. The channel is ended after this.
    Error { code: String, message: String },
    /// End-of-stream marker.
    End,
}

impl OutputChunk {
    pub fn text_delta(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self::TextDelta {
            text: text.into(),
            model: model.into(),
            finish_reason: None,
            created: now_epoch(),
        }
    }

    pub fn final_text(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self::FinalText {
            text: text.into(),
            model: model.into(),
            finish_reason: None,
            created: now_epoch(),
        }
    }

    pub fn embedding(vector: Vec<f32>, model: impl Into<String>, index: usize) -> Self {
        Self::Embedding {
            vector,
            model: model.into(),
            index,
            created: now_epoch(),
        }
    }

    pub fn embeddings(vectors: Vec<Vec<f32>>, model: impl Into<String>) -> Self {
        Self::Embeddings {
            vectors,
            model: model.into(),
            created: now_epoch(),
        }
    }

    pub fn json(value: Value, model: impl Into<String>) -> Self {
        Self::JsonObject {
            value,
            model: model.into(),
            created: now_epoch(),
        }
    }

    pub fn audio(bytes: Vec<u8>, mime: impl Into<String>, model: impl Into<String>) -> Self {
        Self::AudioBytes {
            bytes,
            mime: mime.into(),
            model: model.into(),
            created: now_epoch(),
        }
    }

    pub fn image(bytes: Vec<u8>, mime: impl Into<String>, model: impl Into<String>) -> Self {
        Self::ImageBytes {
            bytes,
            mime: mime.into(),
            model: model.into(),
            created: now_epoch(),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn end() -> Self {
        Self::End
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// The model name this chunk was produced for, if any.
    pub fn model(&self) -> Option<&str> {
        match self {
            Self::TextDelta { model, .. }
            | Self::FinalText { model, .. }
            | Self::Embedding { model, .. }
            | Self::Embeddings { model, .. }
            | Self::JsonObject { model, .. }
            | Self::AudioBytes { model, .. }
            | Self::ImageBytes { model, .. } => Some(model),
            Self::Error { .. } | Self::End => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_tag_variants() {
        assert!(OutputChunk::end().is_end());
        assert!(OutputChunk::error("model_error", "boom").is_error());
        assert!(!OutputChunk::text_delta("hi", "gpt-4").is_end());

        match OutputChunk::text_delta("hi", "gpt-4") {
            OutputChunk::TextDelta { text, model, .. } => {
                assert_eq!(text, "hi");
                assert_eq!(model, "gpt-4");
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn embedding_keeps_index() {
        match OutputChunk::embedding(vec![0.1, 0.2], "embed-1", 3) {
            OutputChunk::Embedding { vector, index, .. } => {
                assert_eq!(vector.len(), 2);
                assert_eq!(index, 3);
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn model_accessor() {
        assert_eq!(OutputChunk::final_text("x", "m").model(), Some("m"));
        assert_eq!(OutputChunk::end().model(), None);
    }
}
