//! # Strata Engine
//!
//! The orchestration layer over the four memory tiers. One
//! [`ContextEngine`] owns the tiers, the providers, and the backing
//! stores, and exposes the public operations:
//!
//! - [`generate_context`](ContextEngine::generate_context) — budget,
//!   fetch concurrently, fit, and assemble one context payload
//! - [`ingest_turn`](ContextEngine::ingest_turn) — append to the active
//!   window, hand evictions to compression, checkpoint
//! - [`ingest_document`](ContextEngine::ingest_document) — index a
//!   document for retrieval
//! - [`remember_relationship`](ContextEngine::remember_relationship) /
//!   [`remember_preference`](ContextEngine::remember_preference) —
//!   explicit graph writes
//! - [`session_stats`](ContextEngine::session_stats) /
//!   [`export_session`](ContextEngine::export_session) — read-only
//!   observability
//! - [`hydrate_session`](ContextEngine::hydrate_session) — restore a
//!   window from its checkpoint
//!
//! Per-session mutable state is serialized by a write gate held across
//! append, eviction hand-off, and checkpoint. A background worker
//! drains the compression queue; it is aborted when the engine drops.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use strata_config::EngineConfig;
use strata_core::error::{Error, Result};
use strata_core::event::{DomainEvent, EventBus};
use strata_core::session::SessionId;
use strata_core::tier::{ContextQuery, MemoryTier};
use strata_core::token::TokenCounter;
use strata_core::turn::TurnRole;
use strata_core::DocumentInput;
use strata_providers::{completion_from_config, embedding_from_config};
use strata_store::{
    CheckpointStore, CircuitBreaker, FileCheckpointStore, GraphStore, HttpGraphStore,
    HttpVectorIndex, NoopCheckpointStore, SqliteCheckpointStore, VectorIndex,
};
use strata_tiers::{ActiveWindowTier, CompressionTier, EntityGraphTier, RetrievalTier};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod assembly;
pub mod budget;
pub mod cache;
pub mod orchestrator;
pub mod stats;

pub use assembly::{ContextMetadata, ContextPayload, TierReport};
pub use budget::{ContextBudget, QueryShape};
pub use cache::SemanticCache;
pub use stats::{SessionExport, SessionStats};
pub use strata_tiers::AppendOutcome;

/// How often the background worker drains pending compression batches.
const COMPRESSION_TICK_MS: u64 = 250;

/// Per-call knobs for [`ContextEngine::generate_context`].
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// System preamble rendered first in the payload. Its tokens come
    /// out of the system reserve, which grows if the preamble exceeds
    /// the configured floor.
    pub system: Option<String>,
    /// Override the configured retrieval result count.
    pub top_k: Option<usize>,
    /// Skip the cache lookup for this call. The fresh result is still
    /// stored.
    pub bypass_cache: bool,
}

/// One write gate per session, created on first use.
#[derive(Default)]
struct WriteGates {
    inner: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl WriteGates {
    async fn for_session(&self, session: &SessionId) -> Arc<Mutex<()>> {
        let mut inner = self.inner.lock().await;
        inner.entry(session.clone()).or_default().clone()
    }
}

/// The four-tier context engine.
///
/// Built from an [`EngineConfig`]; every collaborator (providers,
/// stores, breakers) is wired here and nowhere else.
pub struct ContextEngine {
    config: EngineConfig,
    counter: TokenCounter,
    events: Arc<EventBus>,
    active: Arc<ActiveWindowTier>,
    compression: Arc<CompressionTier>,
    retrieval: Arc<RetrievalTier>,
    entity: Arc<EntityGraphTier>,
    /// The four tiers in assembly order, as the orchestrator fans out.
    tiers: Vec<Arc<dyn MemoryTier>>,
    cache: SemanticCache,
    gates: Arc<WriteGates>,
    worker: JoinHandle<()>,
}

impl ContextEngine {
    /// Build an engine from configuration. Validates the configuration
    /// and wires providers, stores, breakers, and tiers.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        let counter = TokenCounter::new(config.model.profile);
        let events = Arc::new(EventBus::default());

        let completions = completion_from_config(&config)?;
        let embedder = embedding_from_config(&config)?;

        let checkpoint = checkpoint_store(&config).await?;
        let vector_primary = vector_store(&config)?;
        let graph_primary = graph_store(&config)?;

        let cooldown = Duration::from_secs(config.breaker.cooldown_secs);
        let vector_breaker = Arc::new(CircuitBreaker::new(
            "vector-index",
            config.breaker.failure_threshold,
            cooldown,
        ));
        let graph_breaker = Arc::new(CircuitBreaker::new(
            "graph-store",
            config.breaker.failure_threshold,
            cooldown,
        ));

        let active = Arc::new(ActiveWindowTier::new(
            config.window.max_tokens,
            counter,
            checkpoint,
            events.clone(),
        ));
        let compression = Arc::new(CompressionTier::new(
            config.compression.clone(),
            config.model.completion_model.clone(),
            counter,
            completions.clone(),
            events.clone(),
        ));
        let retrieval = Arc::new(RetrievalTier::new(
            config.retrieval.clone(),
            config.model.completion_model.clone(),
            counter,
            embedder.clone(),
            completions.clone(),
            vector_primary,
            vector_breaker,
            events.clone(),
        ));
        let entity = Arc::new(EntityGraphTier::new(
            config.entity.clone(),
            config.model.completion_model.clone(),
            counter,
            completions,
            graph_primary,
            graph_breaker,
            events.clone(),
        ));

        let tiers: Vec<Arc<dyn MemoryTier>> = vec![
            active.clone() as Arc<dyn MemoryTier>,
            entity.clone() as Arc<dyn MemoryTier>,
            compression.clone() as Arc<dyn MemoryTier>,
            retrieval.clone() as Arc<dyn MemoryTier>,
        ];

        let cache = SemanticCache::new(config.cache.clone(), embedder);
        let worker = spawn_compression_worker(compression.clone());

        info!(
            completion_model = %config.model.completion_model,
            vector_backend = %config.stores.vector.backend,
            graph_backend = %config.stores.graph.backend,
            checkpoint_backend = %config.stores.checkpoint.backend,
            "Context engine ready"
        );

        Ok(Self {
            config,
            counter,
            events,
            active,
            compression,
            retrieval,
            entity,
            tiers,
            cache,
            gates: Arc::new(WriteGates::default()),
            worker,
        })
    }

    /// Assemble the context for one model call.
    ///
    /// Tier failures and timeouts degrade to empty sections and are
    /// reported in the metadata; the call fails hard only on budget
    /// errors or when every tier degraded with nothing to serve.
    pub async fn generate_context(
        &self,
        session: &SessionId,
        query: impl Into<String>,
        max_tokens: usize,
        options: ContextOptions,
    ) -> Result<ContextPayload> {
        let query_text = query.into();
        let system = options.system.unwrap_or_default();

        if !options.bypass_cache {
            if let Some(hit) = self.cache.lookup(session, &query_text).await {
                self.publish_assembled(session, &hit, true);
                return Ok(hit);
            }
        }

        let context_query = ContextQuery {
            session_id: session.clone(),
            text: query_text.clone(),
            top_k: options.top_k.unwrap_or(self.config.retrieval.top_k),
        };
        let fetches =
            orchestrator::fetch_all(&self.tiers, &self.config.timeouts, &context_query).await;
        let payload = orchestrator::build_payload(
            &self.counter,
            &self.config.budget,
            &context_query,
            &system,
            max_tokens,
            &fetches,
        )?;

        self.publish_assembled(session, &payload, false);
        // Degraded payloads are served but not cached; the next call
        // gets a fresh chance at the primaries.
        if payload.metadata.degraded_tiers.is_empty() {
            self.cache.store(session, &query_text, &payload).await;
        }
        Ok(payload)
    }

    /// Ingest one conversation turn.
    ///
    /// Holds the session's write gate across append, eviction hand-off,
    /// and checkpoint, then invalidates the session's cache entries and
    /// kicks off entity extraction in the background.
    pub async fn ingest_turn(
        &self,
        session: &SessionId,
        role: TurnRole,
        text: impl Into<String>,
    ) -> Result<AppendOutcome> {
        let text = text.into();
        let gate = self.gates.for_session(session).await;
        let outcome = {
            let _guard = gate.lock().await;
            let outcome = self.active.append(session, role, &text).await?;
            if !outcome.evicted.is_empty() {
                self.compression
                    .enqueue(session, outcome.evicted.clone())
                    .await;
            }
            outcome
        };

        self.cache.invalidate_session(session).await;
        let _ = self.entity.clone().spawn_extraction(session.clone(), text);
        Ok(outcome)
    }

    /// Ingest a document into the retrieval tier. Returns the chunk id.
    pub async fn ingest_document(&self, doc: DocumentInput) -> Result<String> {
        let id = self.retrieval.ingest_document(doc).await?;
        self.cache.invalidate_all().await;
        Ok(id)
    }

    /// Record a relationship between two named entities. Unknown
    /// endpoints are created as stub entities.
    pub async fn remember_relationship(
        &self,
        session: &SessionId,
        from: &str,
        to: &str,
        kind: &str,
        confidence: f32,
    ) -> Result<()> {
        self.entity
            .record_relationship(from, to, kind, confidence, session)
            .await?;
        self.cache.invalidate_session(session).await;
        Ok(())
    }

    /// Record a session preference. Last write per category wins.
    pub async fn remember_preference(
        &self,
        session: &SessionId,
        category: impl Into<String>,
        value: impl Into<String>,
        confidence: f32,
    ) {
        self.entity
            .remember_preference(session, category, value, confidence)
            .await;
        self.cache.invalidate_session(session).await;
    }

    /// Restore a session's active window from its checkpoint. Returns
    /// the number of turns recovered.
    pub async fn hydrate_session(&self, session: &SessionId) -> Result<usize> {
        let gate = self.gates.for_session(session).await;
        let _guard = gate.lock().await;
        self.active.hydrate(session).await
    }

    /// Drain one compression pass for a session right now, without
    /// waiting for the background worker. Returns summaries written.
    pub async fn flush_compression(&self, session: &SessionId) -> Result<usize> {
        self.compression.process_pending(session).await
    }

    /// Point-in-time counters for one session. Read-only.
    pub async fn session_stats(&self, session: &SessionId) -> Result<SessionStats> {
        let turns = self.active.snapshot(session).await;
        let window_tokens = self.active.token_total(session).await;
        let summaries = self.compression.summaries(session).await;
        let mut by_density = BTreeMap::new();
        for summary in &summaries {
            *by_density
                .entry(summary.density.label().to_string())
                .or_insert(0) += 1;
        }

        Ok(SessionStats {
            session_id: session.as_str().to_string(),
            window_turns: turns.len(),
            window_tokens,
            window_max_tokens: self.config.window.max_tokens,
            window_utilization: window_tokens as f32 / self.config.window.max_tokens as f32,
            summaries: by_density,
            pending_compression_turns: self.compression.queued_turn_count(session).await,
            entities: self.entity.entity_count(session).await?,
            relationships: self.entity.relationship_count().await,
            preferences: self.entity.session_preferences(session).await.len(),
        })
    }

    /// Snapshot a session's recoverable state for offline audit.
    /// Read-only.
    pub async fn export_session(&self, session: &SessionId) -> SessionExport {
        SessionExport {
            session_id: session.as_str().to_string(),
            exported_at: Utc::now(),
            turns: self.active.snapshot(session).await,
            summaries: self.compression.summaries(session).await,
            pending_turns: self.compression.queued_turns(session).await,
            preferences: self.entity.session_preferences(session).await,
        }
    }

    /// Subscribe to domain events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.events.subscribe()
    }

    fn publish_assembled(&self, session: &SessionId, payload: &ContextPayload, cache_hit: bool) {
        self.events.publish(DomainEvent::ContextAssembled {
            session_id: session.as_str().to_string(),
            total_tokens: payload.metadata.total_tokens,
            degraded_tiers: payload.metadata.degraded_tiers.len(),
            cache_hit,
            timestamp: Utc::now(),
        });
    }
}

impl std::fmt::Debug for ContextEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Drop for ContextEngine {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

fn spawn_compression_worker(compression: Arc<CompressionTier>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(COMPRESSION_TICK_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            for session in compression.sessions_with_pending().await {
                if let Err(e) = compression.process_pending(&session).await {
                    warn!(session_id = %session, error = %e, "Compression pass failed");
                }
            }
        }
    })
}

async fn checkpoint_store(config: &EngineConfig) -> Result<Arc<dyn CheckpointStore>> {
    match config.stores.checkpoint.backend.as_str() {
        "none" => Ok(Arc::new(NoopCheckpointStore::new())),
        "file" => {
            let dir = config
                .stores
                .checkpoint
                .path
                .clone()
                .unwrap_or_else(|| EngineConfig::config_dir().join("checkpoints"));
            Ok(Arc::new(FileCheckpointStore::new(dir)))
        }
        "sqlite" => {
            let path = config
                .stores
                .checkpoint
                .path
                .clone()
                .unwrap_or_else(|| EngineConfig::config_dir().join("strata.db"));
            let store = SqliteCheckpointStore::new(&path.display().to_string()).await?;
            Ok(Arc::new(store))
        }
        other => Err(Error::Config(format!("unknown checkpoint backend: {other}"))),
    }
}

fn vector_store(config: &EngineConfig) -> Result<Option<Arc<dyn VectorIndex>>> {
    match config.stores.vector.backend.as_str() {
        "memory" => Ok(None),
        "http" => {
            let url = config.stores.vector.url.as_deref().ok_or_else(|| {
                Error::Config("vector backend \"http\" requires stores.vector.url".into())
            })?;
            Ok(Some(Arc::new(HttpVectorIndex::new(
                url,
                config.stores.vector.collection.clone(),
            ))))
        }
        other => Err(Error::Config(format!("unknown vector backend: {other}"))),
    }
}

fn graph_store(config: &EngineConfig) -> Result<Option<Arc<dyn GraphStore>>> {
    match config.stores.graph.backend.as_str() {
        "memory" => Ok(None),
        "http" => {
            let url = config.stores.graph.url.as_deref().ok_or_else(|| {
                Error::Config("graph backend \"http\" requires stores.graph.url".into())
            })?;
            Ok(Some(Arc::new(HttpGraphStore::new(url))))
        }
        other => Err(Error::Config(format!("unknown graph backend: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn engine_builds_with_the_default_config() {
        let engine = ContextEngine::new(EngineConfig::default()).await.unwrap();
        let _rx = engine.subscribe();
    }

    #[tokio::test]
    async fn unknown_vector_backend_is_a_config_error() {
        let mut config = EngineConfig::default();
        config.stores.vector.backend = "carrier-pigeon".into();

        let err = ContextEngine::new(config).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn http_backends_require_urls() {
        let mut config = EngineConfig::default();
        config.stores.vector.backend = "http".into();

        let err = ContextEngine::new(config).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let mut config = EngineConfig::default();
        config.stores.graph.backend = "http".into();
        assert!(ContextEngine::new(config).await.is_err());
    }

    #[tokio::test]
    async fn write_gates_are_shared_per_session() {
        let gates = WriteGates::default();
        let alpha = SessionId::from("alpha");

        let first = gates.for_session(&alpha).await;
        let second = gates.for_session(&alpha).await;
        let other = gates.for_session(&SessionId::from("beta")).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn stats_and_export_reflect_ingested_state() {
        let engine = ContextEngine::new(EngineConfig::default()).await.unwrap();
        let session = SessionId::from("stats-test");

        for i in 0..3 {
            engine
                .ingest_turn(&session, TurnRole::User, format!("turn number {i}"))
                .await
                .unwrap();
        }
        engine
            .remember_preference(&session, "tone", "concise", 0.9)
            .await;

        let stats = engine.session_stats(&session).await.unwrap();
        assert_eq!(stats.window_turns, 3);
        assert!(stats.window_tokens > 0);
        assert_eq!(stats.preferences, 1);
        assert_eq!(stats.pending_compression_turns, 0);

        let export = engine.export_session(&session).await;
        assert_eq!(export.turns.len(), 3);
        assert_eq!(export.preferences.len(), 1);
        assert!(serde_json::to_value(&export).is_ok());
    }
}
