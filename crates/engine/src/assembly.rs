//! Payload assembly — fitting fetched content into its allocation.
//!
//! Items are atomic: a tier's fetch is cut to its allocation by
//! dropping whole items, never by splitting one's text. Recency tiers
//! drop oldest first, ranked tiers drop lowest-ranked first. Sections
//! land in fixed order: system, recent conversation, known entities,
//! compressed history, retrieved knowledge.

use serde::{Deserialize, Serialize};
use strata_core::error::{BudgetError, Result};
use strata_core::retrieval::{ReflectionOutcome, ServeSource};
use strata_core::tier::{ContextItem, TierFetch, TierKind};
use strata_core::token::TokenCounter;

use crate::budget::ContextBudget;

fn section_header(tier: TierKind) -> &'static str {
    match tier {
        TierKind::ActiveWindow => "## Recent conversation",
        TierKind::EntityGraph => "## Known entities",
        TierKind::Compression => "## Conversation history",
        TierKind::Retrieval => "## Retrieved knowledge",
    }
}

/// The assembled context for one model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPayload {
    pub text: String,
    pub metadata: ContextMetadata,
}

/// Accounting for one assembly, enough for downstream monitoring to
/// react without parsing the payload text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub session_id: String,
    pub max_tokens: usize,
    pub total_tokens: usize,
    /// `total_tokens / max_tokens`.
    pub utilization: f32,
    pub system_reserved: usize,
    pub tiers: Vec<TierReport>,
    pub degraded_tiers: Vec<TierKind>,
    /// Set when the retrieval tier ran with reflection enabled.
    #[serde(default)]
    pub reflection: Option<ReflectionOutcome>,
    pub cache_hit: bool,
}

/// Per-tier accounting for one assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierReport {
    pub tier: TierKind,
    pub allocated: usize,
    pub used: usize,
    pub items_included: usize,
    pub items_total: usize,
    pub source: ServeSource,
    #[serde(default)]
    pub degraded: Option<String>,
}

/// Output of [`assemble`]: rendered text plus per-tier accounting.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub text: String,
    pub total_tokens: usize,
    pub reports: Vec<TierReport>,
}

/// Upper bound on a section's rendered size: item tokens plus the
/// header, one token per joining newline, and one for the blank line
/// separating sections.
fn section_cost(counter: &TokenCounter, header: &str, items: &[ContextItem]) -> usize {
    let item_tokens: usize = items.iter().map(|i| i.tokens).sum();
    item_tokens + counter.count(header) + items.len() + 1
}

/// Cut a fetch's items down to `allocation`.
///
/// The active window and compressed history drop from the front
/// (oldest content first); ranked tiers arrive best-first and drop
/// from the back.
fn fit_items(
    counter: &TokenCounter,
    tier: TierKind,
    header: &str,
    mut items: Vec<ContextItem>,
    allocation: usize,
) -> Vec<ContextItem> {
    while !items.is_empty() && section_cost(counter, header, &items) > allocation {
        match tier {
            TierKind::ActiveWindow | TierKind::Compression => {
                items.remove(0);
            }
            TierKind::EntityGraph | TierKind::Retrieval => {
                items.pop();
            }
        }
    }
    items
}

/// Fit each tier's fetch into its allocation and render the payload
/// text. Fetches are rendered in the order given; the orchestrator
/// passes them in [`TierKind::all`] order.
///
/// The rendered text never exceeds `budget.total_tokens`; blowing the
/// budget here is an allocation-math bug surfaced as a hard error.
pub fn assemble(
    counter: &TokenCounter,
    budget: &ContextBudget,
    system: &str,
    fetches: &[TierFetch],
) -> Result<Assembled> {
    let mut sections: Vec<String> = Vec::new();
    if !system.is_empty() {
        sections.push(system.to_string());
    }

    let mut reports = Vec::with_capacity(fetches.len());
    for fetch in fetches {
        let allocation = budget.allocation(fetch.tier);
        let header = section_header(fetch.tier);
        let items_total = fetch.items.len();
        let kept = fit_items(counter, fetch.tier, header, fetch.items.clone(), allocation);
        let used = if kept.is_empty() {
            0
        } else {
            section_cost(counter, header, &kept)
        };

        if !kept.is_empty() {
            let mut section = String::from(header);
            for item in &kept {
                section.push('\n');
                section.push_str(&item.text);
            }
            sections.push(section);
        }

        reports.push(TierReport {
            tier: fetch.tier,
            allocated: allocation,
            used,
            items_included: kept.len(),
            items_total,
            source: fetch.source,
            degraded: fetch.degraded.clone(),
        });
    }

    let text = sections.join("\n\n");
    let total_tokens = counter.count(&text);
    if total_tokens > budget.total_tokens {
        return Err(BudgetError::AllocationOverflow {
            allocated: total_tokens,
            budget: budget.total_tokens,
        }
        .into());
    }

    Ok(Assembled {
        text,
        total_tokens,
        reports,
    })
}
