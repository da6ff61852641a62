//! Provider traits — the completion and embedding seams.
//!
//! Providers are black boxes to the engine: text in, text or vectors
//! out. Structured output is requested via a JSON schema hint and
//! validated by the *caller* with serde — provider output is untrusted
//! by design, so malformed proposals are discarded at the call site,
//! never stored.

use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Token usage reported by a provider, when available.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// When set, the provider is asked for JSON conforming to this
    /// schema. Callers still validate the response before use.
    #[serde(default)]
    pub json_schema: Option<serde_json::Value>,
}

fn default_temperature() -> f32 {
    0.3
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            max_tokens: None,
            temperature: default_temperature(),
            json_schema: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn structured(mut self, schema: serde_json::Value) -> Self {
        self.json_schema = Some(schema);
        self
    }
}

/// A completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub model: String,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Input to the embedding provider. Image inputs are embedded by
/// implementations that support them; others return
/// [`ProviderError::Unsupported`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EmbeddingInput {
    Text(String),
    Image { media_type: String, data: Vec<u8> },
}

impl EmbeddingInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

/// The completion seam. Implementations live in `strata-providers`.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Short identifier used in logs and metadata.
    fn name(&self) -> &str;

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> std::result::Result<CompletionResponse, ProviderError>;
}

/// The embedding seam.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Embed a batch of inputs; the output is index-aligned with the
    /// input batch.
    async fn embed(
        &self,
        inputs: Vec<EmbeddingInput>,
    ) -> std::result::Result<Vec<Vec<f32>>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_chain() {
        let req = CompletionRequest::new("test-model", "summarize this")
            .with_system("you are a summarizer")
            .with_max_tokens(128)
            .structured(serde_json::json!({"type": "object"}));

        assert_eq!(req.model, "test-model");
        assert_eq!(req.max_tokens, Some(128));
        assert!(req.system.is_some());
        assert!(req.json_schema.is_some());
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let req: CompletionRequest =
            serde_json::from_str(r#"{"model": "m", "prompt": "p"}"#).unwrap();
        assert_eq!(req.temperature, 0.3);
        assert!(req.max_tokens.is_none());
    }
}
