//! Concurrent tier fan-out and payload construction.
//!
//! One `generate_context` dispatches all four tier fetches as branches
//! of a single join, each under its own timeout. A branch that times
//! out or errors degrades to an empty result and the call carries on;
//! the only wholesale failure is every branch degrading with nothing
//! to serve. Dropping the joined future cancels every in-flight
//! branch.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use strata_config::{BudgetConfig, TimeoutConfig};
use strata_core::error::{Error, Result};
use strata_core::tier::{ContextQuery, MemoryTier, TierFetch, TierKind};
use strata_core::token::TokenCounter;
use tracing::warn;

use crate::assembly::{ContextMetadata, ContextPayload, assemble};
use crate::budget::{QueryShape, allocate};

fn timeout_for(config: &TimeoutConfig, kind: TierKind) -> Duration {
    let ms = match kind {
        TierKind::ActiveWindow => config.active_ms,
        TierKind::Compression => config.compression_ms,
        TierKind::Retrieval => config.retrieval_ms,
        TierKind::EntityGraph => config.entity_ms,
    };
    Duration::from_millis(ms)
}

/// Fetch from every tier concurrently, each branch under its own
/// timeout. A timeout or error becomes an empty degraded fetch.
pub async fn fetch_all(
    tiers: &[Arc<dyn MemoryTier>],
    timeouts: &TimeoutConfig,
    query: &ContextQuery,
) -> Vec<TierFetch> {
    let branches = tiers.iter().map(|tier| {
        let kind = tier.kind();
        let limit = timeout_for(timeouts, kind);
        async move {
            match tokio::time::timeout(limit, tier.fetch(query)).await {
                Ok(Ok(fetch)) => fetch,
                Ok(Err(e)) => {
                    warn!(tier = %kind, error = %e, "Tier fetch failed");
                    TierFetch::degraded_empty(kind, e.to_string())
                }
                Err(_) => {
                    warn!(
                        tier = %kind,
                        timeout_ms = limit.as_millis() as u64,
                        "Tier fetch timed out"
                    );
                    TierFetch::degraded_empty(
                        kind,
                        format!("timed out after {}ms", limit.as_millis()),
                    )
                }
            }
        }
    });
    join_all(branches).await
}

/// Budget, fit, and render one payload from tier fetches.
///
/// Fails only on budget errors or when every tier degraded with
/// nothing to serve; partial degradation is metadata.
pub fn build_payload(
    counter: &TokenCounter,
    budget_config: &BudgetConfig,
    query: &ContextQuery,
    system: &str,
    max_tokens: usize,
    fetches: &[TierFetch],
) -> Result<ContextPayload> {
    if !fetches.is_empty()
        && fetches.iter().all(|f| f.is_degraded() && f.items.is_empty())
    {
        return Err(Error::AllTiersDegraded);
    }

    let mentions_entity = fetches
        .iter()
        .find(|f| f.tier == TierKind::EntityGraph)
        .map(|f| !f.items.is_empty())
        .unwrap_or(false);
    let shape = QueryShape::of(&query.text, mentions_entity);
    let budget = allocate(budget_config, max_tokens, counter.count(system), shape)?;
    let assembled = assemble(counter, &budget, system, fetches)?;

    let degraded_tiers: Vec<TierKind> = fetches
        .iter()
        .filter(|f| f.is_degraded())
        .map(|f| f.tier)
        .collect();
    let reflection = fetches
        .iter()
        .find(|f| f.tier == TierKind::Retrieval)
        .and_then(|f| f.reflection.clone());

    Ok(ContextPayload {
        text: assembled.text,
        metadata: ContextMetadata {
            session_id: query.session_id.as_str().to_string(),
            max_tokens,
            total_tokens: assembled.total_tokens,
            utilization: assembled.total_tokens as f32 / max_tokens as f32,
            system_reserved: budget.system_reserved,
            tiers: assembled.reports,
            degraded_tiers,
            reflection,
            cache_hit: false,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use strata_core::retrieval::ServeSource;
    use strata_core::session::SessionId;
    use strata_core::tier::ContextItem;

    struct StubTier {
        kind: TierKind,
        delay: Duration,
        fail: bool,
        items: Vec<ContextItem>,
    }

    impl StubTier {
        fn healthy(kind: TierKind, text: &str) -> Arc<Self> {
            let counter = TokenCounter::default();
            Arc::new(Self {
                kind,
                delay: Duration::ZERO,
                fail: false,
                items: vec![ContextItem {
                    id: format!("{kind}-item"),
                    text: text.into(),
                    tokens: counter.count(text),
                    score: None,
                    timestamp: None,
                }],
            })
        }

        fn failing(kind: TierKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                delay: Duration::ZERO,
                fail: true,
                items: Vec::new(),
            })
        }

        fn slow(kind: TierKind, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                kind,
                delay,
                fail: false,
                items: Vec::new(),
            })
        }
    }

    #[async_trait]
    impl MemoryTier for StubTier {
        fn kind(&self) -> TierKind {
            self.kind
        }

        async fn fetch(&self, _query: &ContextQuery) -> Result<TierFetch> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::Config("stub backend down".into()));
            }
            Ok(TierFetch::new(
                self.kind,
                self.items.clone(),
                ServeSource::Local,
            ))
        }
    }

    fn query() -> ContextQuery {
        ContextQuery {
            session_id: SessionId::from("orc-test"),
            text: "what happened with the rollout".into(),
            top_k: 5,
        }
    }

    fn healthy_tiers() -> Vec<Arc<dyn MemoryTier>> {
        vec![
            StubTier::healthy(TierKind::ActiveWindow, "turn content") as Arc<dyn MemoryTier>,
            StubTier::healthy(TierKind::EntityGraph, "Sarah (person)") as Arc<dyn MemoryTier>,
            StubTier::healthy(TierKind::Compression, "summary content") as Arc<dyn MemoryTier>,
            StubTier::healthy(TierKind::Retrieval, "doc content") as Arc<dyn MemoryTier>,
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tier_times_out_and_degrades() {
        let mut tiers = healthy_tiers();
        tiers[3] = StubTier::slow(TierKind::Retrieval, Duration::from_secs(30))
            as Arc<dyn MemoryTier>;

        let fetches = fetch_all(&tiers, &TimeoutConfig::default(), &query()).await;

        assert_eq!(fetches.len(), 4);
        let retrieval = &fetches[3];
        assert!(retrieval.is_degraded());
        assert!(retrieval.degraded.as_deref().unwrap().contains("timed out"));
        // The other branches still served.
        assert!(!fetches[0].items.is_empty());
    }

    #[tokio::test]
    async fn failing_tier_degrades_without_failing_the_call() {
        let mut tiers = healthy_tiers();
        tiers[1] = StubTier::failing(TierKind::EntityGraph) as Arc<dyn MemoryTier>;

        let fetches = fetch_all(&tiers, &TimeoutConfig::default(), &query()).await;
        let payload = build_payload(
            &TokenCounter::default(),
            &BudgetConfig::default(),
            &query(),
            "",
            4_000,
            &fetches,
        )
        .unwrap();

        assert_eq!(payload.metadata.degraded_tiers, vec![TierKind::EntityGraph]);
        assert!(payload.text.contains("turn content"));
        assert!(!payload.text.contains("## Known entities"));
    }

    #[tokio::test]
    async fn all_tiers_failing_is_a_hard_error() {
        let tiers: Vec<Arc<dyn MemoryTier>> = TierKind::all()
            .into_iter()
            .map(|kind| StubTier::failing(kind) as Arc<dyn MemoryTier>)
            .collect();

        let fetches = fetch_all(&tiers, &TimeoutConfig::default(), &query()).await;
        let err = build_payload(
            &TokenCounter::default(),
            &BudgetConfig::default(),
            &query(),
            "",
            4_000,
            &fetches,
        )
        .unwrap_err();

        assert!(matches!(err, Error::AllTiersDegraded));
    }

    #[tokio::test]
    async fn empty_but_healthy_tiers_still_succeed() {
        let tiers: Vec<Arc<dyn MemoryTier>> = vec![
            StubTier::healthy(TierKind::ActiveWindow, "only the window") as Arc<dyn MemoryTier>,
            StubTier::slow(TierKind::EntityGraph, Duration::ZERO) as Arc<dyn MemoryTier>,
            StubTier::slow(TierKind::Compression, Duration::ZERO) as Arc<dyn MemoryTier>,
            StubTier::slow(TierKind::Retrieval, Duration::ZERO) as Arc<dyn MemoryTier>,
        ];

        let fetches = fetch_all(&tiers, &TimeoutConfig::default(), &query()).await;
        let payload = build_payload(
            &TokenCounter::default(),
            &BudgetConfig::default(),
            &query(),
            "",
            4_000,
            &fetches,
        )
        .unwrap();

        assert!(payload.metadata.degraded_tiers.is_empty());
        assert!(payload.text.contains("only the window"));
    }

    #[tokio::test]
    async fn metadata_accounts_for_every_tier() {
        let fetches = fetch_all(&healthy_tiers(), &TimeoutConfig::default(), &query()).await;
        let payload = build_payload(
            &TokenCounter::default(),
            &BudgetConfig::default(),
            &query(),
            "system text",
            4_000,
            &fetches,
        )
        .unwrap();

        assert_eq!(payload.metadata.tiers.len(), 4);
        for report in &payload.metadata.tiers {
            assert_eq!(report.items_total, 1);
            assert_eq!(report.items_included, 1);
            assert!(report.used <= report.allocated);
        }
        assert!(payload.metadata.total_tokens <= 4_000);
        assert!(payload.metadata.utilization > 0.0);
        assert_eq!(payload.metadata.session_id, "orc-test");
    }

    #[tokio::test]
    async fn entity_items_nudge_the_entity_allocation() {
        let with_entities =
            fetch_all(&healthy_tiers(), &TimeoutConfig::default(), &query()).await;
        let mut without = with_entities.clone();
        without[1].items.clear();

        let counter = TokenCounter::default();
        let config = BudgetConfig::default();
        let boosted =
            build_payload(&counter, &config, &query(), "", 8_000, &with_entities).unwrap();
        let plain = build_payload(&counter, &config, &query(), "", 8_000, &without).unwrap();

        let alloc = |p: &ContextPayload| {
            p.metadata
                .tiers
                .iter()
                .find(|r| r.tier == TierKind::EntityGraph)
                .map(|r| r.allocated)
                .unwrap_or(0)
        };
        assert!(alloc(&boosted) > alloc(&plain));
    }
}
