use async_trait::async_trait;

use crate::error::Failure;
use crate::message::Message;
use crate::model::ModelId;
use crate::usage::TokenUsage;

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub stop_reason: Option<String>,
}

/// Remote model endpoint. Implementations report failures unclassified
/// (or pre-classified) and never retry on their own.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn send(&self, messages: &[Message]) -> Result<ProviderResponse, Failure>;

    fn model(&self) -> &ModelId;
}
