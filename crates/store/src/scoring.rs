//! Relevance scoring for hybrid retrieval.
//!
//! The retrieval tier runs two passes over the corpus and fuses them:
//!
//! - a dense pass scored by [`cosine_similarity`] over embeddings
//! - a sparse pass scored by [`keyword_score`] over extracted terms
//!
//! [`weighted_fusion`] combines both rankings into one list using the
//! configured dense/sparse weights. Scores are fused directly (not by
//! reciprocal rank), so a strong match in one pass can outrank a weak
//! match present in both.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Cosine similarity between two vectors, in `[-1, 1]`.
///
/// Mismatched lengths and empty or zero-magnitude vectors score `0.0`
/// rather than erroring; a degenerate embedding should never sink a
/// whole retrieval pass.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    // Accumulate in f64: embedding dims in the hundreds lose real
    // precision in f32 sums.
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    ((dot / denom) as f32).clamp(-1.0, 1.0)
}

/// Term-frequency keyword score in `[0, 1]`.
///
/// Blends coverage (how many distinct query terms the document hits)
/// with a dampened frequency component, so a document mentioning every
/// query term once beats one repeating a single term many times.
pub fn keyword_score(query_terms: &[String], doc_terms: &[String]) -> f32 {
    if query_terms.is_empty() || doc_terms.is_empty() {
        return 0.0;
    }

    let wanted: HashSet<&str> = query_terms.iter().map(String::as_str).collect();
    let mut occurrences = 0usize;
    let mut matched: HashSet<&str> = HashSet::new();
    for term in doc_terms {
        if wanted.contains(term.as_str()) {
            occurrences += 1;
            matched.insert(term.as_str());
        }
    }
    if occurrences == 0 {
        return 0.0;
    }

    let coverage = matched.len() as f32 / wanted.len() as f32;
    // Diminishing returns on repeated hits of the same terms.
    let frequency = 1.0 - 1.0 / (1.0 + occurrences as f32);
    (0.7 * coverage + 0.3 * frequency).clamp(0.0, 1.0)
}

/// Fuse a dense and a sparse ranking into one scored list.
///
/// Both inputs are `(id, score)` pairs in rank order with scores in
/// `[0, 1]`. The fused score is the weight-normalized sum, so it stays
/// in `[0, 1]` and an id present in only one list is scored as zero in
/// the other. Ties break by the best rank the id held in either input,
/// then lexically by id, which keeps the output deterministic.
pub fn weighted_fusion(
    dense: &[(String, f32)],
    sparse: &[(String, f32)],
    dense_weight: f32,
    sparse_weight: f32,
) -> Vec<(String, f32)> {
    let total = dense_weight + sparse_weight;
    let (dense_weight, sparse_weight) = if total > 0.0 {
        (dense_weight / total, sparse_weight / total)
    } else {
        (0.5, 0.5)
    };

    struct Accum {
        dense: f32,
        sparse: f32,
        best_rank: usize,
    }

    let mut by_id: HashMap<String, Accum> = HashMap::new();
    for (rank, (id, score)) in dense.iter().enumerate() {
        by_id
            .entry(id.clone())
            .and_modify(|acc| {
                acc.dense = acc.dense.max(*score);
                acc.best_rank = acc.best_rank.min(rank);
            })
            .or_insert(Accum {
                dense: *score,
                sparse: 0.0,
                best_rank: rank,
            });
    }
    for (rank, (id, score)) in sparse.iter().enumerate() {
        by_id
            .entry(id.clone())
            .and_modify(|acc| {
                acc.sparse = acc.sparse.max(*score);
                acc.best_rank = acc.best_rank.min(rank);
            })
            .or_insert(Accum {
                dense: 0.0,
                sparse: *score,
                best_rank: rank,
            });
    }

    let mut fused: Vec<(String, f32, usize)> = by_id
        .into_iter()
        .map(|(id, acc)| {
            let score = dense_weight * acc.dense + sparse_weight * acc.sparse;
            (id, score, acc.best_rank)
        })
        .collect();

    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.2.cmp(&b.2))
            .then_with(|| a.0.cmp(&b.0))
    });

    fused.into_iter().map(|(id, score, _)| (id, score)).collect()
}
