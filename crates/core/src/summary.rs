//! Summaries — compressed history produced by the compression tier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Compression density. History moves toward `Coarse` as it ages:
/// freshly evicted turns become `Fine` summaries, batches of old fine
/// summaries are merged into `Medium`, and so on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SummaryDensity {
    Fine,
    Medium,
    Coarse,
}

impl SummaryDensity {
    /// The next density a merge re-compresses into, if any.
    pub fn coarser(self) -> Option<SummaryDensity> {
        match self {
            SummaryDensity::Fine => Some(SummaryDensity::Medium),
            SummaryDensity::Medium => Some(SummaryDensity::Coarse),
            SummaryDensity::Coarse => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SummaryDensity::Fine => "fine",
            SummaryDensity::Medium => "medium",
            SummaryDensity::Coarse => "coarse",
        }
    }
}

/// A compressed span of history.
///
/// Read-only once produced. Re-compression at a coarser density creates
/// a *new* summary that supersedes the merged ones; the old ones are
/// removed from serving, never mutated. `source_turn_ids` is the
/// at-least-once de-duplication key: two compression attempts over the
/// same turn set must not both be stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: String,
    pub density: SummaryDensity,
    pub source_turn_ids: BTreeSet<String>,
    pub text: String,
    pub token_count: usize,
    /// Retention score in [0, 1]; lowest (importance, created_at) is
    /// evicted first when the store exceeds capacity.
    pub importance: f32,
    pub created_at: DateTime<Utc>,
}

impl Summary {
    pub fn new(
        density: SummaryDensity,
        source_turn_ids: BTreeSet<String>,
        text: impl Into<String>,
        token_count: usize,
        importance: f32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            density,
            source_turn_ids,
            text: text.into(),
            token_count,
            importance: importance.clamp(0.0, 1.0),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn density_coarsening_ladder_terminates() {
        assert_eq!(SummaryDensity::Fine.coarser(), Some(SummaryDensity::Medium));
        assert_eq!(
            SummaryDensity::Medium.coarser(),
            Some(SummaryDensity::Coarse)
        );
        assert_eq!(SummaryDensity::Coarse.coarser(), None);
    }

    #[test]
    fn importance_is_clamped() {
        let s = Summary::new(
            SummaryDensity::Fine,
            BTreeSet::from(["t1".to_string()]),
            "text",
            1,
            1.7,
        );
        assert_eq!(s.importance, 1.0);
    }

    #[test]
    fn source_ids_are_ordered() {
        let s = Summary::new(
            SummaryDensity::Fine,
            BTreeSet::from(["b".to_string(), "a".to_string()]),
            "text",
            1,
            0.5,
        );
        let ids: Vec<_> = s.source_turn_ids.iter().cloned().collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
