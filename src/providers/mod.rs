//! Provider module for Chatflow
//!
//! This module contains the model transport and summarization abstractions,
//! the stream frame decoder, and the OpenAI-compatible implementation.

pub mod base;
pub mod openai;
pub mod sse;

pub use base::{
    ChatStream, HistoryMessage, ModelProvider, StreamEvent, StreamRequest, Summarizer, TokenUsage,
};
pub use openai::OpenAiProvider;

use crate::config::ProviderConfig;
use crate::error::{ChatflowError, Result};
use std::sync::Arc;

/// Create a provider instance based on configuration
///
/// The returned provider serves both as the streaming transport and as
/// the summarizer used for titles.
///
/// # Arguments
///
/// * `config` - Provider configuration
///
/// # Errors
///
/// Returns error if provider type is invalid or initialization fails
///
/// # Examples
///
/// ```no_run
/// use chatflow::config::Config;
/// use chatflow::providers::create_provider;
///
/// let config = Config::default();
/// let provider = create_provider(&config.provider).unwrap();
/// ```
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<OpenAiProvider>> {
    match config.provider_type.as_str() {
        "openai" => Ok(Arc::new(OpenAiProvider::new(config.openai.clone())?)),
        other => Err(ChatflowError::Provider(format!("Unknown provider type: {}", other)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpenAiConfig;

    #[test]
    fn test_create_provider_rejects_unknown_type() {
        let config = ProviderConfig {
            provider_type: "carrier-pigeon".to_string(),
            openai: OpenAiConfig::default(),
        };
        let err = create_provider(&config).unwrap_err();
        assert!(err.to_string().contains("Unknown provider type"));
    }

    #[test]
    fn test_create_provider_openai() {
        let config = ProviderConfig {
            provider_type: "openai".to_string(),
            openai: OpenAiConfig {
                model: "gpt-test".to_string(),
                ..Default::default()
            },
        };
        let provider = create_provider(&config).expect("provider");
        assert_eq!(provider.default_model(), "gpt-test");
    }
}
