//! Read-only session statistics and export snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use strata_core::entity::Preference;
use strata_core::summary::Summary;
use strata_core::turn::Turn;

/// Point-in-time counters for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub window_turns: usize,
    pub window_tokens: usize,
    pub window_max_tokens: usize,
    /// `window_tokens / window_max_tokens`.
    pub window_utilization: f32,
    /// Summary count per density label.
    pub summaries: BTreeMap<String, usize>,
    /// Evicted turns accepted but not yet summarized.
    pub pending_compression_turns: usize,
    pub entities: usize,
    pub relationships: usize,
    pub preferences: usize,
}

/// Snapshot of a session's recoverable state. Serializes to JSON for
/// offline audit; building one never mutates engine state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionExport {
    pub session_id: String,
    pub exported_at: DateTime<Utc>,
    /// Active window, oldest first.
    pub turns: Vec<Turn>,
    /// Stored summaries, oldest first.
    pub summaries: Vec<Summary>,
    /// Turns awaiting compression.
    pub pending_turns: Vec<Turn>,
    pub preferences: Vec<Preference>,
}
