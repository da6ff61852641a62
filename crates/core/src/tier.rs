//! The memory-tier abstraction the orchestrator fans out over.

use crate::error::Result;
use crate::retrieval::{ReflectionOutcome, ServeSource};
use crate::session::SessionId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The four memory tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    ActiveWindow,
    Compression,
    Retrieval,
    EntityGraph,
}

impl TierKind {
    /// All tiers, in assembly section order (after the system preamble).
    pub fn all() -> [TierKind; 4] {
        [
            TierKind::ActiveWindow,
            TierKind::EntityGraph,
            TierKind::Compression,
            TierKind::Retrieval,
        ]
    }

    pub fn label(self) -> &'static str {
        match self {
            TierKind::ActiveWindow => "active_window",
            TierKind::Compression => "compression",
            TierKind::Retrieval => "retrieval",
            TierKind::EntityGraph => "entity_graph",
        }
    }
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One fetch request, fanned out to every tier.
#[derive(Debug, Clone)]
pub struct ContextQuery {
    pub session_id: SessionId,
    pub text: String,
    /// Result-count hint for ranked tiers.
    pub top_k: usize,
}

/// One renderable unit of tier content.
///
/// Items are atomic for budgeting: the assembler drops whole items,
/// never part of one. `tokens` is the tier's own count of the rendered
/// text — the orchestrator trusts it and never recounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: String,
    pub text: String,
    pub tokens: usize,
    /// Relevance score for ranked tiers; `None` for recency content.
    #[serde(default)]
    pub score: Option<f32>,
    /// Creation time for recency content; `None` for ranked content.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// What one tier returned for one query.
///
/// Ranked tiers order `items` best-first; the active window orders
/// chronologically (oldest first).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierFetch {
    pub tier: TierKind,
    pub items: Vec<ContextItem>,
    pub source: ServeSource,
    /// Present when the tier served degraded content (fallback path,
    /// queued raw turns, partial backend failure). The value is a short
    /// reason for metadata; the call itself still succeeded.
    #[serde(default)]
    pub degraded: Option<String>,
    /// Set by the retrieval tier only.
    #[serde(default)]
    pub reflection: Option<ReflectionOutcome>,
}

impl TierFetch {
    pub fn new(tier: TierKind, items: Vec<ContextItem>, source: ServeSource) -> Self {
        Self {
            tier,
            items,
            source,
            degraded: None,
            reflection: None,
        }
    }

    /// An empty, healthy result (tier had nothing for this query).
    pub fn empty(tier: TierKind) -> Self {
        Self::new(tier, Vec::new(), ServeSource::Local)
    }

    /// An empty result for a tier that failed or timed out.
    pub fn degraded_empty(tier: TierKind, reason: impl Into<String>) -> Self {
        let mut fetch = Self::empty(tier);
        fetch.degraded = Some(reason.into());
        fetch
    }

    pub fn with_degraded(mut self, reason: impl Into<String>) -> Self {
        self.degraded = Some(reason.into());
        self
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    pub fn total_tokens(&self) -> usize {
        self.items.iter().map(|i| i.tokens).sum()
    }
}

/// A memory tier the orchestrator can fan out to.
///
/// `fetch` must be side-effect free on tier state. An `Err` means the
/// tier failed *entirely* (even its fallback); the orchestrator maps
/// that to an empty degraded result rather than failing the call.
#[async_trait]
pub trait MemoryTier: Send + Sync {
    fn kind(&self) -> TierKind;

    async fn fetch(&self, query: &ContextQuery) -> Result<TierFetch>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_order_is_assembly_order() {
        let order = TierKind::all();
        assert_eq!(order[0], TierKind::ActiveWindow);
        assert_eq!(order[1], TierKind::EntityGraph);
        assert_eq!(order[2], TierKind::Compression);
        assert_eq!(order[3], TierKind::Retrieval);
    }

    #[test]
    fn degraded_empty_carries_reason() {
        let fetch = TierFetch::degraded_empty(TierKind::Retrieval, "timeout");
        assert!(fetch.is_degraded());
        assert!(fetch.items.is_empty());
        assert_eq!(fetch.degraded.as_deref(), Some("timeout"));
    }

    #[test]
    fn total_tokens_sums_items() {
        let mut fetch = TierFetch::empty(TierKind::ActiveWindow);
        fetch.items = vec![
            ContextItem {
                id: "a".into(),
                text: "one".into(),
                tokens: 3,
                score: None,
                timestamp: None,
            },
            ContextItem {
                id: "b".into(),
                text: "two".into(),
                tokens: 4,
                score: None,
                timestamp: None,
            },
        ];
        assert_eq!(fetch.total_tokens(), 7);
    }
}
