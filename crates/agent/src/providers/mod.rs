use std::sync::Arc;

use credeval_core::config::{LlmConfig, LlmProvider};

use crate::llm::{AdapterSettings, ProviderAdapter, ProviderError, ProviderErrorKind};

pub mod anthropic;
pub mod gemini;
pub mod scripted;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use scripted::{ScriptedAdapter, ScriptedCall};

/// Builds the adapter selected by `config.provider`.
pub fn build_adapter(config: &LlmConfig) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
    let settings = AdapterSettings::from_config(config).map_err(|error| {
        ProviderError::new(ProviderErrorKind::Configuration, error.to_string()).with_retryable(false)
    })?;
    let adapter: Arc<dyn ProviderAdapter> = match config.provider {
        LlmProvider::Anthropic => Arc::new(AnthropicAdapter::new(settings)?),
        LlmProvider::Gemini => Arc::new(GeminiAdapter::new(settings)?),
    };
    Ok(adapter)
}

pub(crate) fn http_client(settings: &AdapterSettings) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder().timeout(settings.timeout).build().map_err(|error| {
        ProviderError::new(ProviderErrorKind::Configuration, error.to_string()).with_retryable(false)
    })
}

/// Stands in for an empty model message in the provider history. Both APIs
/// reject a turn with no content, which would turn the corrective prompt into
/// a request error.
pub(crate) const EMPTY_REPLY_PLACEHOLDER: &str = "(no content)";

/// Non-empty text joined from a provider's text parts.
pub(crate) fn joined_text<'a>(parts: impl Iterator<Item = &'a str>) -> Option<String> {
    let text = parts.collect::<Vec<_>>().join("\n");
    (!text.trim().is_empty()).then_some(text)
}
