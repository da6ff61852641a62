//! Entity and relationship extraction from conversation turns.
//!
//! The completion provider proposes graph updates as JSON. Provider
//! output is untrusted: proposals are validated with serde, sanitized,
//! and filtered by confidence before anything reaches a graph store.
//! A malformed proposal is an [`ExtractionError`], which the caller
//! logs and skips.

use serde::{Deserialize, Serialize};
use strata_core::error::ExtractionError;
use strata_core::provider::{CompletionProvider, CompletionRequest};

const EXTRACTION_SYSTEM: &str = "You extract entities and relationships from \
conversation turns. Respond with JSON only, in this shape: \
{\"entities\": [{\"name\": \"...\", \"type\": \"person|organization|project|concept\", \
\"confidence\": 0.9, \"attributes\": {}}], \
\"relationships\": [{\"from\": \"...\", \"to\": \"...\", \"kind\": \"works_at\", \
\"confidence\": 0.8}]}. Only include things the text actually states. \
Return {} when there is nothing to extract.";

fn extraction_prompt(turn_text: &str) -> String {
    format!("Extract entities and relationships from this turn:\n\n{turn_text}")
}

fn extraction_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "type": {"type": "string"},
                        "confidence": {"type": "number"},
                        "attributes": {"type": "object"}
                    },
                    "required": ["name"]
                }
            },
            "relationships": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "from": {"type": "string"},
                        "to": {"type": "string"},
                        "kind": {"type": "string"},
                        "confidence": {"type": "number"}
                    },
                    "required": ["from", "to", "kind"]
                }
            }
        }
    })
}

/// A validated provider proposal. `{}` deserializes to an empty
/// proposal, which is the correct reading of "nothing to extract".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionProposal {
    #[serde(default)]
    pub entities: Vec<ProposedEntity>,
    #[serde(default)]
    pub relationships: Vec<ProposedRelationship>,
}

impl ExtractionProposal {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }

    /// Drop blank names and anything below the confidence threshold.
    pub fn filtered(mut self, threshold: f32) -> Self {
        self.entities
            .retain(|e| !e.name.trim().is_empty() && e.confidence >= threshold);
        self.relationships.retain(|r| {
            !r.from.trim().is_empty()
                && !r.to.trim().is_empty()
                && !r.kind.trim().is_empty()
                && r.confidence >= threshold
        });
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedEntity {
    pub name: String,
    #[serde(rename = "type", default = "default_entity_type")]
    pub entity_type: String,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedRelationship {
    pub from: String,
    pub to: String,
    pub kind: String,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_entity_type() -> String {
    "unknown".to_string()
}

/// A proposal that states no confidence sits exactly at the default
/// threshold, so it survives default filtering but nothing stricter.
fn default_confidence() -> f32 {
    0.5
}

/// Models fond of markdown wrap their JSON in a fence.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse a raw provider response into a proposal.
pub fn parse_proposal(text: &str) -> Result<ExtractionProposal, ExtractionError> {
    let body = strip_code_fences(text);
    serde_json::from_str(body).map_err(|e| {
        let snippet: String = body.chars().take(120).collect();
        ExtractionError::Schema(format!("{e}; raw: {snippet}"))
    })
}

/// One extraction call: completion, validation, confidence filtering.
pub async fn run_extraction(
    provider: &dyn CompletionProvider,
    model: &str,
    turn_text: &str,
    confidence_threshold: f32,
) -> Result<ExtractionProposal, ExtractionError> {
    let request = CompletionRequest::new(model, extraction_prompt(turn_text))
        .with_system(EXTRACTION_SYSTEM)
        .with_max_tokens(512)
        .structured(extraction_schema());
    let response = provider.complete(request).await?;
    let proposal = parse_proposal(&response.text)?;
    Ok(proposal.filtered(confidence_threshold))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::error::ProviderError;
    use strata_core::provider::CompletionResponse;

    struct CannedCompletion(String);

    #[async_trait::async_trait]
    impl CompletionProvider for CannedCompletion {
        fn name(&self) -> &str {
            "canned"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                text: self.0.clone(),
                model: "canned".into(),
                usage: None,
            })
        }
    }

    #[test]
    fn empty_object_is_an_empty_proposal() {
        let proposal = parse_proposal("{}").unwrap();
        assert!(proposal.is_empty());
    }

    #[test]
    fn fenced_json_parses() {
        let raw = "```json\n{\"entities\": [{\"name\": \"Sarah\"}]}\n```";
        let proposal = parse_proposal(raw).unwrap();
        assert_eq!(proposal.entities.len(), 1);
        assert_eq!(proposal.entities[0].name, "Sarah");
    }

    #[test]
    fn missing_fields_take_defaults() {
        let proposal = parse_proposal(r#"{"entities": [{"name": "Sarah"}]}"#).unwrap();
        let entity = &proposal.entities[0];
        assert_eq!(entity.entity_type, "unknown");
        assert!((entity.confidence - 0.5).abs() < 1e-6);
        assert!(entity.attributes.is_empty());
    }

    #[test]
    fn malformed_json_is_a_schema_error() {
        let err = parse_proposal("the user mentioned Sarah").unwrap_err();
        assert!(matches!(err, ExtractionError::Schema(_)));
    }

    #[test]
    fn filtering_drops_low_confidence_and_blank_names() {
        let proposal = parse_proposal(
            r#"{
                "entities": [
                    {"name": "Sarah", "type": "person", "confidence": 0.9},
                    {"name": "maybe-a-place", "type": "location", "confidence": 0.2},
                    {"name": "   ", "type": "person", "confidence": 0.9}
                ],
                "relationships": [
                    {"from": "Sarah", "to": "Acme", "kind": "works_at", "confidence": 0.8},
                    {"from": "Sarah", "to": "", "kind": "knows", "confidence": 0.9},
                    {"from": "Sarah", "to": "Bob", "kind": "knows", "confidence": 0.1}
                ]
            }"#,
        )
        .unwrap()
        .filtered(0.5);

        assert_eq!(proposal.entities.len(), 1);
        assert_eq!(proposal.entities[0].name, "Sarah");
        assert_eq!(proposal.relationships.len(), 1);
        assert_eq!(proposal.relationships[0].kind, "works_at");
    }

    #[tokio::test]
    async fn run_extraction_validates_and_filters() {
        let provider = CannedCompletion(
            r#"{
                "entities": [
                    {"name": "Acme", "type": "organization", "confidence": 0.95,
                     "attributes": {"industry": "robotics"}},
                    {"name": "noise", "confidence": 0.1}
                ],
                "relationships": [
                    {"from": "Sarah", "to": "Acme", "kind": "works_at", "confidence": 0.9}
                ]
            }"#
            .to_string(),
        );

        let proposal = run_extraction(&provider, "test-model", "Sarah works at Acme", 0.5)
            .await
            .unwrap();
        assert_eq!(proposal.entities.len(), 1);
        assert_eq!(proposal.entities[0].attributes["industry"], "robotics");
        assert_eq!(proposal.relationships.len(), 1);
    }

    #[tokio::test]
    async fn non_json_response_surfaces_as_error() {
        let provider = CannedCompletion("I could not find any entities.".to_string());
        let result = run_extraction(&provider, "test-model", "hello", 0.5).await;
        assert!(result.is_err());
    }
}
