//! Streaming text generation.

pub mod bedrock;
pub mod prompt;

pub use bedrock::{model_family, BedrockClient, ModelFamily, MAX_REQUEST_BYTES, SUPPORTED_MODELS};
pub use prompt::GenerationParams;

use crate::history::ChatMessage;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// One generation request. `history` is oldest first.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub prompt: String,
    pub role: String,
    pub conversation_id: String,
    pub history: Vec<ChatMessage>,
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model_id {0} is not supported")]
    UnsupportedModel(String),
    #[error("request of {size} bytes exceeds the {limit} byte input limit")]
    InputTooLarge { size: usize, limit: usize },
    #[error("model upstream error: {0}")]
    Upstream(String),
}

/// Finite, single-use sequence of text fragments. Upstream failures surface
/// as an `Err` item at the point of iteration.
pub type FragmentStream = BoxStream<'static, Result<String, ModelError>>;

#[async_trait]
pub trait ModelClient: Send + Sync {
    fn model_id(&self) -> &str;

    /// Fails before any network call when the model is unsupported or the
    /// request is too large.
    async fn stream(&self, request: ModelRequest) -> Result<FragmentStream, ModelError>;
}
