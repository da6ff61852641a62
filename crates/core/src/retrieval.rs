//! Retrieval results and reflection reporting.

use serde::{Deserialize, Serialize};

/// Which implementation served a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServeSource {
    /// The external backend answered.
    Primary,
    /// The in-process fallback answered because the primary was
    /// unavailable or the circuit was open.
    Fallback,
    /// The tier is in-process only (active window, compression).
    Local,
}

/// One ranked retrieval hit. Ephemeral, produced per query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub score: f32,
    pub source: ServeSource,
    /// Position in the pass that produced this result; the
    /// deterministic tie-breaker during merge de-duplication.
    pub rank: usize,
}

/// What the reflection loop did for one fetch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReflectionOutcome {
    /// True when confidence fell below threshold and expansions ran.
    pub fired: bool,
    /// The adequacy score of the *initial* result set, in [0, 1].
    pub confidence: f32,
    /// Expansion queries actually issued (0 when not fired).
    pub expansions_issued: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_source_serde_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&ServeSource::Fallback).unwrap(),
            "\"fallback\""
        );
    }

    #[test]
    fn reflection_outcome_defaults_quiet() {
        let outcome = ReflectionOutcome::default();
        assert!(!outcome.fired);
        assert_eq!(outcome.expansions_issued, 0);
    }
}
