//! Pure logic for the retrieval reflection loop.
//!
//! Everything here is deterministic and side-effect free; the retrieval
//! tier supplies scores, texts, and provider responses and gets back
//! decisions. Keeping this separate makes the loop's guarantees (ties
//! broken by original rank, bounded expansion count) unit-testable
//! without a backend.

use std::collections::{HashMap, HashSet};
use strata_core::retrieval::RetrievalResult;
use strata_core::token::terms;

/// Adequacy of a result set for a query, in [0, 1].
///
/// Blends the top score (is the best hit good), the mean of the top
/// three (is there depth behind it), and query-term coverage (did the
/// hits actually mention what was asked). An empty result set scores
/// zero.
pub fn score_confidence(scores: &[f32], coverage: f32) -> f32 {
    let Some(&top) = scores.first() else {
        return 0.0;
    };
    let depth = scores.len().min(3);
    let mean_top: f32 = scores[..depth].iter().sum::<f32>() / depth as f32;
    (0.5 * top + 0.2 * mean_top + 0.3 * coverage).clamp(0.0, 1.0)
}

/// Fraction of the query's unique terms that appear in at least one
/// candidate text. A query with no extractable terms counts as fully
/// covered so it cannot fire reflection on its own.
pub fn term_coverage(query: &str, texts: &[&str]) -> f32 {
    let wanted: HashSet<String> = terms(query).into_iter().collect();
    if wanted.is_empty() {
        return 1.0;
    }
    let mut present: HashSet<&str> = HashSet::new();
    for text in texts {
        for term in terms(text) {
            if wanted.contains(&term) {
                if let Some(hit) = wanted.get(&term) {
                    present.insert(hit.as_str());
                }
            }
        }
    }
    present.len() as f32 / wanted.len() as f32
}

/// Per-chunk overlap: fraction of the query's unique terms found in
/// this text. Zero when the query has no terms, so overlap is a no-op
/// in the rerank blend rather than a uniform boost.
pub fn term_overlap(query_terms: &HashSet<String>, text: &str) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let present: HashSet<String> = terms(text).into_iter().collect();
    let hits = query_terms.iter().filter(|t| present.contains(*t)).count();
    hits as f32 / query_terms.len() as f32
}

/// Parse expansion queries out of a completion, one per line.
///
/// Strips list markers, drops blanks, the original query, and
/// case-insensitive duplicates, and caps the count.
pub fn parse_expansions(text: &str, original: &str, max: usize) -> Vec<String> {
    let original_lower = original.trim().to_lowercase();
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    for line in text.lines() {
        let cleaned = line
            .trim()
            .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')' || c == '-' || c == '*')
            .trim();
        if cleaned.is_empty() {
            continue;
        }
        let lower = cleaned.to_lowercase();
        if lower == original_lower || !seen.insert(lower) {
            continue;
        }
        out.push(cleaned.to_string());
        if out.len() == max {
            break;
        }
    }
    out
}

/// First number in [0, 1] found in a judge response, if any. `None`
/// means the caller falls back to the heuristic.
pub fn parse_judged_confidence(text: &str) -> Option<f32> {
    text.split_whitespace()
        .map(|token| {
            token
                .trim_matches(|c: char| !c.is_ascii_digit() && c != '.')
                .trim_end_matches('.')
        })
        .filter_map(|token| token.parse::<f32>().ok())
        .find(|value| (0.0..=1.0).contains(value))
}

/// Merge the initial results with expansion results.
///
/// De-duplicates by chunk id, keeping the highest score; on equal
/// scores the lower original rank wins. Output is sorted by score
/// descending, then rank, then id, so the merge is deterministic
/// regardless of expansion completion order.
pub fn merge_ranked(
    initial: Vec<RetrievalResult>,
    expansions: Vec<RetrievalResult>,
) -> Vec<RetrievalResult> {
    let mut best: HashMap<String, RetrievalResult> = HashMap::new();
    for result in initial.into_iter().chain(expansions) {
        match best.get(&result.chunk_id) {
            Some(kept)
                if kept.score > result.score
                    || (kept.score == result.score && kept.rank <= result.rank) => {}
            _ => {
                best.insert(result.chunk_id.clone(), result);
            }
        }
    }

    let mut merged: Vec<RetrievalResult> = best.into_values().collect();
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.rank.cmp(&b.rank))
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
    merged
}

/// Final rerank: blend each result's fused score with its query-term
/// overlap, re-sort, truncate to `k`. Weights normalize to sum 1; a
/// degenerate pair falls back to an even split.
pub fn rerank(
    candidates: Vec<(RetrievalResult, f32)>,
    fused_weight: f32,
    overlap_weight: f32,
    k: usize,
) -> Vec<RetrievalResult> {
    let sum = fused_weight + overlap_weight;
    let (fw, ow) = if sum > 0.0 && sum.is_finite() {
        (fused_weight / sum, overlap_weight / sum)
    } else {
        (0.5, 0.5)
    };

    let mut reranked: Vec<RetrievalResult> = candidates
        .into_iter()
        .map(|(mut result, overlap)| {
            result.score = fw * result.score + ow * overlap;
            result
        })
        .collect();
    reranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.rank.cmp(&b.rank))
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
    reranked.truncate(k);
    reranked
}
