//! Provider implementations for Strata.
//!
//! All providers implement the `strata_core` completion/embedding traits.
//! Two families:
//! - [`OpenAiCompatProvider`] — any OpenAI-compatible HTTP endpoint
//! - [`LocalProvider`] — deterministic, offline (hashing embeddings +
//!   extractive summaries); the default, and what every test runs on

pub mod local;
pub mod openai_compat;

pub use local::LocalProvider;
pub use openai_compat::OpenAiCompatProvider;

use std::sync::Arc;
use strata_config::{EngineConfig, ProviderEndpointConfig};
use strata_core::error::Error;
use strata_core::provider::{CompletionProvider, EmbeddingProvider};

/// Build the completion provider selected by configuration.
pub fn completion_from_config(
    config: &EngineConfig,
) -> Result<Arc<dyn CompletionProvider>, Error> {
    match config.providers.completion.kind.as_str() {
        "local" => Ok(Arc::new(LocalProvider::new())),
        "http" => Ok(Arc::new(http_provider(config, &config.providers.completion))),
        other => Err(Error::Config(format!(
            "unknown completion provider kind: {other}"
        ))),
    }
}

/// Build the embedding provider selected by configuration.
pub fn embedding_from_config(
    config: &EngineConfig,
) -> Result<Arc<dyn EmbeddingProvider>, Error> {
    match config.providers.embedding.kind.as_str() {
        "local" => Ok(Arc::new(LocalProvider::new())),
        "http" => Ok(Arc::new(http_provider(config, &config.providers.embedding))),
        other => Err(Error::Config(format!(
            "unknown embedding provider kind: {other}"
        ))),
    }
}

fn http_provider(
    config: &EngineConfig,
    endpoint: &ProviderEndpointConfig,
) -> OpenAiCompatProvider {
    let base_url = endpoint
        .base_url
        .clone()
        .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
    OpenAiCompatProvider::new(
        "openai-compat",
        base_url,
        endpoint.api_key.clone().unwrap_or_default(),
    )
    .with_embedding_model(config.model.embedding_model.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_local_providers() {
        let config = EngineConfig::default();
        let completion = completion_from_config(&config).unwrap();
        let embedding = embedding_from_config(&config).unwrap();
        assert_eq!(completion.name(), "local");
        assert_eq!(embedding.name(), "local");
    }

    #[test]
    fn unknown_kind_is_a_config_error() {
        let mut config = EngineConfig::default();
        config.providers.completion.kind = "carrier-pigeon".into();
        assert!(completion_from_config(&config).is_err());
    }
}
