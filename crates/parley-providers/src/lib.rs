mod anthropic;

pub use anthropic::AnthropicProvider;

use parley_core::config::AppConfig;
use parley_core::error::ConfigError;
use parley_core::model::ModelId;
use parley_core::provider::Provider;
use std::sync::Arc;

/// Build the provider for `model_id` (or the configured model).
pub fn create_provider(
    config: &AppConfig,
    model_id: Option<&ModelId>,
) -> Result<Arc<dyn Provider>, ConfigError> {
    let model = model_id.cloned().unwrap_or_else(|| config.model.clone());
    let api_key = config.require_api_key()?;

    let provider = AnthropicProvider::new(api_key.to_string(), model, config)
        .map_err(|e| ConfigError::Invalid(format!("HTTP client: {e}")))?;
    Ok(Arc::new(provider))
}
