//! Deterministic local provider — offline completions and embeddings.
//!
//! No model, no network, no keys. Completions are extractive (the
//! highest-signal sentences of the prompt, in original order) and
//! embeddings are sha256 feature hashes, so identical input always
//! produces identical output. This is the default provider and what the
//! whole test suite runs on; it is also a reasonable degraded mode for
//! air-gapped deployments.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use strata_core::error::ProviderError;
use strata_core::provider::{
    CompletionProvider, CompletionRequest, CompletionResponse, EmbeddingInput,
    EmbeddingProvider,
};
use strata_core::token::{TokenCounter, terms};

/// Dimension of locally produced embeddings.
pub const EMBEDDING_DIM: usize = 256;

/// The deterministic offline provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProvider;

impl LocalProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CompletionProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> std::result::Result<CompletionResponse, ProviderError> {
        // Schema-constrained calls get an empty object: valid JSON that
        // deserializes to "no proposals" under serde defaults.
        let text = if request.json_schema.is_some() {
            "{}".to_string()
        } else {
            let target = request.max_tokens.unwrap_or(128) as usize;
            extractive_summary(&request.prompt, target)
        };

        Ok(CompletionResponse {
            text,
            model: "local".into(),
            usage: None,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn embed(
        &self,
        inputs: Vec<EmbeddingInput>,
    ) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        Ok(inputs
            .iter()
            .map(|input| match input {
                EmbeddingInput::Text(t) => embed_text(t),
                EmbeddingInput::Image { data, .. } => embed_bytes(data),
            })
            .collect())
    }
}

/// Pick the highest-signal sentences of `text`, in original order,
/// until `max_tokens` is spent. Sentences are scored by the frequency
/// of their terms across the whole text, normalized by length so long
/// sentences don't win by volume.
fn extractive_summary(text: &str, max_tokens: usize) -> String {
    let counter = TokenCounter::default();
    if counter.count(text) <= max_tokens {
        return text.trim().to_string();
    }

    let mut freq: HashMap<String, usize> = HashMap::new();
    for term in terms(text) {
        *freq.entry(term).or_insert(0) += 1;
    }

    let sentences: Vec<&str> = text
        .split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let mut scored: Vec<(usize, f64)> = sentences
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let sentence_terms = terms(s);
            let raw: usize = sentence_terms
                .iter()
                .map(|t| freq.get(t).copied().unwrap_or(0))
                .sum();
            let score = raw as f64 / (sentence_terms.len() + 1) as f64;
            (i, score)
        })
        .collect();
    // Stable: equal scores keep document order.
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut picked: Vec<usize> = Vec::new();
    let mut spent = 0;
    for (i, _) in scored {
        let cost = counter.count(sentences[i]) + 1;
        if spent + cost > max_tokens {
            continue;
        }
        spent += cost;
        picked.push(i);
    }
    picked.sort_unstable();

    if picked.is_empty() {
        // Every sentence alone exceeds the target; hard-truncate.
        return counter.truncate(text, max_tokens).trim().to_string();
    }

    picked
        .iter()
        .map(|&i| sentences[i])
        .collect::<Vec<_>>()
        .join(". ")
}

fn embed_text(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    for term in terms(text) {
        let digest = Sha256::digest(term.as_bytes());
        let bucket = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
            as usize
            % EMBEDDING_DIM;
        let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign;
    }
    l2_normalize(&mut v);
    v
}

fn embed_bytes(data: &[u8]) -> Vec<f32> {
    let mut v = Vec::with_capacity(EMBEDDING_DIM);
    let mut block: [u8; 32] = Sha256::digest(data).into();
    while v.len() < EMBEDDING_DIM {
        for byte in block {
            if v.len() == EMBEDDING_DIM {
                break;
            }
            v.push(byte as f32 / 255.0 - 0.5);
        }
        block = Sha256::digest(block).into();
    }
    l2_normalize(&mut v);
    v
}

fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if norm > 1e-10 {
        for x in v.iter_mut() {
            *x = (*x as f64 / norm) as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f64 {
        let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
        dot
    }

    #[tokio::test]
    async fn embeddings_are_deterministic() {
        let provider = LocalProvider::new();
        let a = EmbeddingProvider::embed(
            &provider,
            vec![EmbeddingInput::text("rust is a systems language")],
        )
        .await
        .unwrap();
        let b = EmbeddingProvider::embed(
            &provider,
            vec![EmbeddingInput::text("rust is a systems language")],
        )
        .await
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), EMBEDDING_DIM);
    }

    #[tokio::test]
    async fn overlapping_text_is_closer_than_disjoint() {
        let provider = LocalProvider::new();
        let out = EmbeddingProvider::embed(
            &provider,
            vec![
                EmbeddingInput::text("tokio async runtime for rust"),
                EmbeddingInput::text("async rust runtime internals"),
                EmbeddingInput::text("baking sourdough bread recipes"),
            ],
        )
        .await
        .unwrap();
        let close = cosine(&out[0], &out[1]);
        let far = cosine(&out[0], &out[2]);
        assert!(close > far, "expected {close} > {far}");
    }

    #[tokio::test]
    async fn image_bytes_embed_deterministically() {
        let provider = LocalProvider::new();
        let out = EmbeddingProvider::embed(
            &provider,
            vec![
                EmbeddingInput::Image {
                    media_type: "image/png".into(),
                    data: vec![7; 64],
                },
                EmbeddingInput::Image {
                    media_type: "image/png".into(),
                    data: vec![7; 64],
                },
            ],
        )
        .await
        .unwrap();
        assert_eq!(out[0], out[1]);
    }

    #[tokio::test]
    async fn summary_respects_token_target() {
        let provider = LocalProvider::new();
        let long_text = "Rust ships a borrow checker. The borrow checker prevents data races. \
                         Cargo builds projects. Crates come from the registry. \
                         The compiler emits helpful errors. Lifetimes describe borrows. \
                         Traits describe shared behavior. Enums model alternatives."
            .to_string();
        let response = CompletionProvider::complete(
            &provider,
            CompletionRequest::new("local", long_text.clone()).with_max_tokens(12),
        )
        .await
        .unwrap();

        assert!(TokenCounter::default().count(&response.text) <= 12);
        // Extractive: output sentences come from the input.
        for sentence in response.text.split(". ") {
            assert!(long_text.contains(sentence.trim_end_matches('.')));
        }
    }

    #[tokio::test]
    async fn schema_requests_get_empty_object() {
        let provider = LocalProvider::new();
        let response = CompletionProvider::complete(
            &provider,
            CompletionRequest::new("local", "extract entities")
                .structured(serde_json::json!({"type": "object"})),
        )
        .await
        .unwrap();
        assert_eq!(response.text, "{}");
    }
}
