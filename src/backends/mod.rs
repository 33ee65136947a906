use crate::error::{AppError, BackendError};
use crate::models::{ChatMessage, Generation, GenerationParams};
use async_trait::async_trait;

pub mod lambda;
pub mod openai_compat;
pub mod openrouter;
pub mod portkey;

pub use openai_compat::{Auth, OpenAiCompatibleClient};

/// Uniform adapter over one inference surface.
///
/// Implementations build the provider request, extract token and latency
/// metadata, and map every provider failure into [`BackendError`]. They do not
/// write usage records; the router or gateway that called them does.
#[async_trait]
pub trait BackendClient: Send + Sync {
    fn name(&self) -> &str;

    fn default_model(&self) -> &str;

    async fn generate(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
        params: &GenerationParams,
    ) -> Result<Generation, BackendError>;

    /// Offers an accepted answer to any response cache the client keeps.
    /// Callers invoke it only once the answer has passed validation.
    fn remember(&self, _messages: &[ChatMessage], _generation: &Generation) {}

    async fn test_connection(&self) -> Result<Option<u16>, AppError> {
        Ok(None)
    }
}
