//! Token budgeting across the four tiers.
//!
//! A request's `max_tokens` is split into per-tier allocations from
//! configured priority weights, after reserving room for the system
//! preamble. Two floors are hard: the system reserve and the
//! active-window minimum. A budget too small for the floors is the
//! caller's error, never a silent truncation.

use std::collections::HashMap;
use strata_config::BudgetConfig;
use strata_core::error::BudgetError;
use strata_core::tier::TierKind;

/// Multiplier applied to a tier's weight when the query shape points
/// at it.
const ADAPTIVE_BOOST: f64 = 1.25;

/// Phrases suggesting the answer lives in summarized history.
const HISTORY_PHRASES: [&str; 7] = [
    "earlier",
    "before",
    "previously",
    "last time",
    "we discussed",
    "you said",
    "remember",
];

/// Question openers suggesting a knowledge lookup.
const INTERROGATIVES: [&str; 12] = [
    "what", "who", "where", "when", "why", "how", "which", "does", "do",
    "can", "did", "are",
];

/// Query-shape signals that nudge tier weights before normalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryShape {
    pub references_history: bool,
    pub interrogative: bool,
    pub mentions_known_entity: bool,
}

impl QueryShape {
    /// Derive the textual signals from the query. Entity mentions need
    /// a graph lookup, so that signal is the caller's to supply.
    pub fn of(query: &str, mentions_known_entity: bool) -> Self {
        let lowered = query.to_lowercase();
        let first = lowered
            .split(|c: char| !c.is_alphanumeric())
            .find(|t| !t.is_empty())
            .unwrap_or_default();
        Self {
            references_history: HISTORY_PHRASES.iter().any(|p| lowered.contains(p)),
            interrogative: INTERROGATIVES.contains(&first),
            mentions_known_entity,
        }
    }
}

/// Per-tier token allocations for one `generate_context` call.
///
/// Every token of the budget is accounted for:
/// `system_reserved + sum(allocations) == total_tokens`.
#[derive(Debug, Clone)]
pub struct ContextBudget {
    pub total_tokens: usize,
    /// Tokens held back for the system preamble — the configured floor
    /// or the preamble's actual size, whichever is larger.
    pub system_reserved: usize,
    pub allocations: HashMap<TierKind, usize>,
}

impl ContextBudget {
    pub fn allocation(&self, tier: TierKind) -> usize {
        self.allocations.get(&tier).copied().unwrap_or(0)
    }
}

/// Split `max_tokens` into per-tier allocations.
///
/// The active window is allocated first and never below its floor;
/// the remaining tiers share what is left in proportion to their
/// weights, with rounding leftovers landing in the last tier.
pub fn allocate(
    config: &BudgetConfig,
    max_tokens: usize,
    system_tokens: usize,
    shape: QueryShape,
) -> Result<ContextBudget, BudgetError> {
    if max_tokens == 0 {
        return Err(BudgetError::ZeroBudget);
    }

    let system_reserved = config.system_floor_tokens.max(system_tokens);
    if system_reserved + config.active_floor_tokens > max_tokens {
        return Err(BudgetError::FloorExceedsBudget {
            budget: max_tokens,
            system_floor: system_reserved,
            active_floor: config.active_floor_tokens,
        });
    }

    let mut active_w = config.active_weight as f64;
    let mut entity_w = config.entity_weight as f64;
    let mut compression_w = config.compression_weight as f64;
    let mut retrieval_w = config.retrieval_weight as f64;
    if config.adaptive {
        if shape.references_history {
            compression_w *= ADAPTIVE_BOOST;
        }
        if shape.interrogative {
            retrieval_w *= ADAPTIVE_BOOST;
        }
        if shape.mentions_known_entity {
            entity_w *= ADAPTIVE_BOOST;
        }
    }

    let available = max_tokens - system_reserved;
    let total_w = active_w + entity_w + compression_w + retrieval_w;
    // Validation keeps weights positive; a zero sum here means a
    // hand-built config, treated as an even split.
    let active = if total_w > 0.0 {
        (available as f64 * (active_w / total_w)) as usize
    } else {
        available / 4
    };
    let active = active.max(config.active_floor_tokens);

    let remaining = available - active;
    let rest_w = entity_w + compression_w + retrieval_w;
    let (entity, compression) = if rest_w > 0.0 {
        (
            (remaining as f64 * (entity_w / rest_w)) as usize,
            (remaining as f64 * (compression_w / rest_w)) as usize,
        )
    } else {
        (remaining / 3, remaining / 3)
    };
    let retrieval = remaining.saturating_sub(entity + compression);

    let mut allocations = HashMap::new();
    allocations.insert(TierKind::ActiveWindow, active);
    allocations.insert(TierKind::EntityGraph, entity);
    allocations.insert(TierKind::Compression, compression);
    allocations.insert(TierKind::Retrieval, retrieval);

    Ok(ContextBudget {
        total_tokens: max_tokens,
        system_reserved,
        allocations,
    })
}
