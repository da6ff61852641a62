//! Full-engine scenarios against the offline provider stack.
//!
//! Everything here runs on the deterministic local provider and the
//! in-process stores, so the suite needs no network, no keys, and no
//! external services. The one outage test points the primary index at
//! a loopback port nothing listens on.

use strata_config::EngineConfig;
use strata_core::{DocumentInput, ServeSource, SessionId, TierKind, TurnRole};
use strata_engine::{ContextEngine, ContextOptions, TierReport};

fn report<'a>(reports: &'a [TierReport], tier: TierKind) -> &'a TierReport {
    reports
        .iter()
        .find(|r| r.tier == tier)
        .unwrap_or_else(|| panic!("no report for {tier:?}"))
}

#[tokio::test]
async fn small_conversation_round_trips_verbatim() {
    let engine = ContextEngine::new(EngineConfig::default()).await.unwrap();
    let session = SessionId::from("round-trip");

    let turns = [
        "We renamed the ingestion service to hopper",
        "The hopper deploy goes out thursday",
        "Rollback plan is the blue environment",
        "Metrics dashboards live under the ops folder",
        "Postmortem template needs a severity field",
    ];
    for text in turns {
        engine
            .ingest_turn(&session, TurnRole::User, text)
            .await
            .unwrap();
    }

    let payload = engine
        .generate_context(&session, "what is the rollback plan", 2000, ContextOptions::default())
        .await
        .unwrap();

    for text in turns {
        assert!(payload.text.contains(text), "missing turn: {text}");
    }

    let active = report(&payload.metadata.tiers, TierKind::ActiveWindow);
    assert_eq!(active.items_included, 5);
    assert_eq!(active.items_total, 5);
    assert!(active.degraded.is_none());
    assert!(payload.metadata.degraded_tiers.is_empty());
    assert!(payload.metadata.total_tokens <= 2000);
    assert!(!payload.metadata.cache_hit);
}

#[tokio::test]
async fn matching_query_retrieves_the_ingested_document() {
    let engine = ContextEngine::new(EngineConfig::default()).await.unwrap();
    let session = SessionId::from("retrieval");

    engine
        .ingest_document(DocumentInput::text(
            "incident runbook for the checkout service",
        ))
        .await
        .unwrap();
    engine
        .ingest_document(DocumentInput::text("sourdough starter feeding schedule"))
        .await
        .unwrap();

    let payload = engine
        .generate_context(
            &session,
            "incident runbook for the checkout service",
            4000,
            ContextOptions::default(),
        )
        .await
        .unwrap();

    assert!(payload.text.contains("## Retrieved knowledge"));
    assert!(payload.text.contains("checkout service"));

    // A well-covered query does not trigger expansion.
    let reflection = payload.metadata.reflection.as_ref().unwrap();
    assert!(!reflection.fired);
    assert!(reflection.confidence >= 0.7);
}

#[tokio::test]
async fn disjoint_query_fires_one_reflection_round() {
    let engine = ContextEngine::new(EngineConfig::default()).await.unwrap();
    let session = SessionId::from("reflection");

    for text in [
        "deploy window opens friday at noon",
        "payments retries use exponential backoff",
        "the staging cluster runs three replicas",
    ] {
        engine
            .ingest_document(DocumentInput::text(text))
            .await
            .unwrap();
    }

    // Nothing in the corpus shares vocabulary with this query.
    let payload = engine
        .generate_context(
            &session,
            "zebra cadence bathysphere",
            4000,
            ContextOptions::default(),
        )
        .await
        .unwrap();

    let reflection = payload.metadata.reflection.as_ref().unwrap();
    assert!(reflection.fired);
    assert!(reflection.confidence < 0.7);
    assert!(reflection.expansions_issued >= 1);
    assert!(reflection.expansions_issued <= 3);

    let retrieval = report(&payload.metadata.tiers, TierKind::Retrieval);
    assert!(retrieval.items_total <= 5);
}

#[tokio::test]
async fn primary_index_outage_degrades_to_fallback() {
    let mut config = EngineConfig::default();
    config.stores.vector.backend = "http".into();
    config.stores.vector.url = Some("http://127.0.0.1:9".into());

    let engine = ContextEngine::new(config).await.unwrap();
    let session = SessionId::from("outage");

    // The primary upsert fails; the in-process mirror still lands.
    engine
        .ingest_document(DocumentInput::text(
            "incident runbook for the checkout service",
        ))
        .await
        .unwrap();

    let payload = engine
        .generate_context(
            &session,
            "incident runbook for the checkout service",
            4000,
            ContextOptions::default(),
        )
        .await
        .unwrap();

    assert!(payload.text.contains("checkout service"));
    assert!(payload
        .metadata
        .degraded_tiers
        .contains(&TierKind::Retrieval));

    let retrieval = report(&payload.metadata.tiers, TierKind::Retrieval);
    assert_eq!(retrieval.source, ServeSource::Fallback);
    assert!(retrieval.degraded.is_some());

    let active = report(&payload.metadata.tiers, TierKind::ActiveWindow);
    assert!(active.degraded.is_none());
}

#[tokio::test]
async fn tiny_window_truncates_and_compresses() {
    let mut config = EngineConfig::default();
    config.window.max_tokens = 50;

    let engine = ContextEngine::new(config).await.unwrap();
    let session = SessionId::from("tiny-window");

    let long = "the quarterly planning meeting moved to the large conference room \
                because the projector in the small one failed again and facilities \
                has not scheduled the repair yet despite three tickets, so until \
                that lands we squat in whichever room the booking tool shows free"
        .to_string();

    let first = engine
        .ingest_turn(&session, TurnRole::User, long.clone())
        .await
        .unwrap();
    assert!(first.truncated);
    assert!(first.evicted.is_empty());

    let stats = engine.session_stats(&session).await.unwrap();
    assert!(stats.window_tokens <= 50);

    // The next oversized turn pushes the first one out.
    let second = engine
        .ingest_turn(&session, TurnRole::Assistant, long.clone())
        .await
        .unwrap();
    assert_eq!(second.evicted.len(), 1);

    engine
        .ingest_turn(&session, TurnRole::User, long)
        .await
        .unwrap();

    let written = engine.flush_compression(&session).await.unwrap();
    assert!(written >= 1);

    let stats = engine.session_stats(&session).await.unwrap();
    assert_eq!(stats.pending_compression_turns, 0);
    assert!(stats.summaries.values().sum::<usize>() >= 1);
    assert!(stats.window_tokens <= 50);
}

#[tokio::test]
async fn repeated_query_hits_the_semantic_cache() {
    let engine = ContextEngine::new(EngineConfig::default()).await.unwrap();
    let session = SessionId::from("cache");

    engine
        .ingest_turn(&session, TurnRole::User, "the release branch cut is monday")
        .await
        .unwrap();

    let first = engine
        .generate_context(&session, "when is the branch cut", 2000, ContextOptions::default())
        .await
        .unwrap();
    assert!(!first.metadata.cache_hit);

    let second = engine
        .generate_context(&session, "when is the branch cut", 2000, ContextOptions::default())
        .await
        .unwrap();
    assert!(second.metadata.cache_hit);
    assert_eq!(second.text, first.text);

    // Any ingestion invalidates the session's cached payloads.
    engine
        .ingest_turn(&session, TurnRole::Assistant, "monday at ten am")
        .await
        .unwrap();

    let third = engine
        .generate_context(&session, "when is the branch cut", 2000, ContextOptions::default())
        .await
        .unwrap();
    assert!(!third.metadata.cache_hit);
    assert!(third.text.contains("monday at ten am"));
}

#[tokio::test]
async fn floors_hold_in_small_budgets() {
    let engine = ContextEngine::new(EngineConfig::default()).await.unwrap();
    let session = SessionId::from("floors");

    let payload = engine
        .generate_context(&session, "status update", 1000, ContextOptions::default())
        .await
        .unwrap();

    let meta = &payload.metadata;
    assert_eq!(meta.system_reserved, 200);

    let active = report(&meta.tiers, TierKind::ActiveWindow);
    assert_eq!(active.allocated, 512);

    let allocated: usize = meta.tiers.iter().map(|r| r.allocated).sum();
    assert_eq!(meta.system_reserved + allocated, 1000);
}

#[tokio::test]
async fn checkpoint_hydration_restores_the_window() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.stores.checkpoint.backend = "file".into();
    config.stores.checkpoint.path = Some(dir.path().to_path_buf());

    let session = SessionId::from("hydration");
    let turns = [
        "first we chose the schema",
        "then we added the index",
        "finally we backfilled the table",
    ];

    let engine = ContextEngine::new(config.clone()).await.unwrap();
    for text in turns {
        engine
            .ingest_turn(&session, TurnRole::User, text)
            .await
            .unwrap();
    }
    drop(engine);

    let engine = ContextEngine::new(config).await.unwrap();
    let recovered = engine.hydrate_session(&session).await.unwrap();
    assert_eq!(recovered, 3);

    let export = engine.export_session(&session).await;
    let texts: Vec<&str> = export.turns.iter().map(|t| t.text.as_str()).collect();
    assert_eq!(texts, turns);

    let payload = engine
        .generate_context(&session, "what did we do first", 2000, ContextOptions::default())
        .await
        .unwrap();
    assert!(payload.text.contains("chose the schema"));
}

#[tokio::test]
async fn payload_sections_keep_a_fixed_order() {
    let mut config = EngineConfig::default();
    config.window.max_tokens = 60;

    let engine = ContextEngine::new(config).await.unwrap();
    let session = SessionId::from("sections");

    // Enough oversized turns to force evictions into compression.
    for text in [
        "the payments retry bug turned out to come from a missing idempotency key \
         on the charge call so every network blip produced a duplicate charge",
        "we agreed to cap automatic retries at three attempts and page the oncall \
         engineer when the fourth consecutive failure lands in the dead letter queue",
        "the fix ships behind a feature flag and rolls out to internal tenants \
         first before any external traffic sees the new behavior in production",
    ] {
        engine
            .ingest_turn(&session, TurnRole::User, text)
            .await
            .unwrap();
    }
    engine.flush_compression(&session).await.unwrap();

    engine
        .ingest_document(DocumentInput::text(
            "payments oncall runbook: page the billing team for charge failures",
        ))
        .await
        .unwrap();
    engine
        .remember_relationship(&session, "payments service", "billing team", "owned_by", 0.9)
        .await
        .unwrap();
    engine
        .remember_preference(&session, "style", "terse summaries", 0.8)
        .await;

    let payload = engine
        .generate_context(
            &session,
            "what did we decide about the payments retry bug",
            4000,
            ContextOptions {
                system: Some("You are the team's release assistant.".into()),
                ..ContextOptions::default()
            },
        )
        .await
        .unwrap();

    let text = &payload.text;
    let system = text.find("release assistant").unwrap();
    let recent = text.find("## Recent conversation").unwrap();
    let entities = text.find("## Known entities").unwrap();
    let history = text.find("## Conversation history").unwrap();
    let retrieved = text.find("## Retrieved knowledge").unwrap();

    assert!(system < recent);
    assert!(recent < entities);
    assert!(entities < history);
    assert!(history < retrieved);

    assert!(text.contains("Preference (style): terse summaries"));
    assert!(payload.metadata.total_tokens <= 4000);
    assert!(payload.metadata.utilization > 0.0);
}
