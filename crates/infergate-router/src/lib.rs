pub mod router;

pub use router::{
    AsrHandler, ChatHandler, EmbeddingHandler, ImageHandler, ModelRouter, TtsHandler,
};
