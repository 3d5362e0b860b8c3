pub mod channel;
pub mod chunk;
pub mod config;
pub mod error;
pub mod types;

pub use channel::{ChannelStatus, StreamChannel};
pub use chunk::OutputChunk;
pub use config::{ClusterConfig, GatewayConfig, NodeConfig};
pub use error::ApiError;
pub use types::{
    AsrRequest, ChatRequest, EmbeddingRequest, ImageGenRequest, ModelFamily, TtsRequest,
};
