//! Ingested knowledge chunks served by the retrieval tier.

use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content modality of an ingested chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    #[default]
    Text,
    Image,
}

/// What a caller hands to `ingest_document`.
///
/// Image documents are embedded directly when the provider supports
/// image input. A supplied caption becomes the chunk's searchable text,
/// and the embedding fallback when the provider is text-only. Raw image
/// bytes are never stored past ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DocumentContent {
    Text(String),
    Image {
        media_type: String,
        data: Vec<u8>,
        caption: Option<String>,
    },
}

/// Ingestion request for the retrieval tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInput {
    pub content: DocumentContent,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Present when the deployment scopes retrieval per session.
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

impl DocumentInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: DocumentContent::Text(text.into()),
            metadata: serde_json::Map::new(),
            session_id: None,
        }
    }
}

/// A chunk as held by the retrieval tier — immutable once indexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    /// Dense vector; kept in memory, not serialized (re-derived on
    /// re-ingestion, never exported).
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    /// Lowercased alphanumeric terms for the sparse pass.
    pub sparse_terms: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub modality: Modality,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    pub fn new(text: impl Into<String>, modality: Modality) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            embedding: None,
            sparse_terms: Vec::new(),
            metadata: serde_json::Map::new(),
            modality,
            session_id: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_is_not_serialized() {
        let mut chunk = Chunk::new("some text", Modality::Text);
        chunk.embedding = Some(vec![0.1, 0.2]);
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(!json.contains("0.1"));
    }

    #[test]
    fn text_input_constructor_defaults() {
        let input = DocumentInput::text("hello");
        assert!(matches!(input.content, DocumentContent::Text(ref t) if t == "hello"));
        assert!(input.session_id.is_none());
    }

    #[test]
    fn modality_defaults_to_text() {
        let chunk = Chunk::new("x", Modality::default());
        assert_eq!(chunk.modality, Modality::Text);
    }
}
