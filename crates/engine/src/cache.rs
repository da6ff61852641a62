//! Semantic payload cache.
//!
//! Assembled payloads are cached keyed by query embedding. A lookup
//! embeds the incoming query and serves a stored payload when cosine
//! similarity against an entry for the same session meets the
//! threshold and the entry is still fresh. Session ingestion
//! invalidates that session's entries; document ingestion invalidates
//! everything, since retrieval content is deployment-wide under global
//! scope. Embedding failure is a silent miss on both paths.

use std::collections::VecDeque;
use std::sync::Arc;
use strata_config::CacheConfig;
use strata_core::provider::{EmbeddingInput, EmbeddingProvider};
use strata_core::session::SessionId;
use strata_store::cosine_similarity;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::assembly::ContextPayload;

struct CacheEntry {
    session: SessionId,
    embedding: Vec<f32>,
    payload: ContextPayload,
    stored_at: Instant,
}

/// Bounded payload cache with TTL. Oldest entries evict first.
pub struct SemanticCache {
    config: CacheConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    entries: RwLock<VecDeque<CacheEntry>>,
}

impl SemanticCache {
    pub fn new(config: CacheConfig, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            config,
            embedder,
            entries: RwLock::new(VecDeque::new()),
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    async fn embed(&self, query: &str) -> Option<Vec<f32>> {
        match self.embedder.embed(vec![EmbeddingInput::text(query)]).await {
            Ok(mut vectors) if !vectors.is_empty() => Some(vectors.remove(0)),
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "Cache embedding failed, skipping");
                None
            }
        }
    }

    /// Serve a stored payload for a near-identical query, if any.
    /// The best match above the threshold wins.
    pub async fn lookup(&self, session: &SessionId, query: &str) -> Option<ContextPayload> {
        if !self.config.enabled {
            return None;
        }
        let embedding = self.embed(query).await?;

        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut best: Option<(f32, &CacheEntry)> = None;
        for entry in entries.iter() {
            if entry.session != *session
                || now.duration_since(entry.stored_at) > self.ttl()
            {
                continue;
            }
            let similarity = cosine_similarity(&embedding, &entry.embedding);
            if similarity >= self.config.similarity_threshold
                && best.is_none_or(|(s, _)| similarity > s)
            {
                best = Some((similarity, entry));
            }
        }

        best.map(|(similarity, entry)| {
            debug!(session_id = %session, similarity, "Context cache hit");
            let mut payload = entry.payload.clone();
            payload.metadata.cache_hit = true;
            payload
        })
    }

    /// Store a freshly assembled payload.
    pub async fn store(&self, session: &SessionId, query: &str, payload: &ContextPayload) {
        if !self.config.enabled {
            return;
        }
        let Some(embedding) = self.embed(query).await else {
            return;
        };

        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let ttl = self.ttl();
        entries.retain(|e| now.duration_since(e.stored_at) <= ttl);
        entries.push_back(CacheEntry {
            session: session.clone(),
            embedding,
            payload: payload.clone(),
            stored_at: now,
        });
        while entries.len() > self.config.capacity {
            entries.pop_front();
        }
    }

    /// Drop every entry for one session.
    pub async fn invalidate_session(&self, session: &SessionId) {
        let mut entries = self.entries.write().await;
        entries.retain(|e| e.session != *session);
    }

    /// Drop everything.
    pub async fn invalidate_all(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::ContextMetadata;
    use async_trait::async_trait;
    use strata_core::error::ProviderError;
    use strata_providers::LocalProvider;

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        fn name(&self) -> &str {
            "failing"
        }

        async fn embed(
            &self,
            _inputs: Vec<EmbeddingInput>,
        ) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
            Err(ProviderError::Unavailable("embedder offline".into()))
        }
    }

    fn payload(text: &str) -> ContextPayload {
        ContextPayload {
            text: text.into(),
            metadata: ContextMetadata {
                session_id: "s".into(),
                max_tokens: 1_000,
                total_tokens: 10,
                utilization: 0.01,
                system_reserved: 0,
                tiers: Vec::new(),
                degraded_tiers: Vec::new(),
                reflection: None,
                cache_hit: false,
            },
        }
    }

    fn cache() -> SemanticCache {
        SemanticCache::new(CacheConfig::default(), Arc::new(LocalProvider::new()))
    }

    #[tokio::test]
    async fn identical_query_hits_for_the_same_session() {
        let cache = cache();
        let session = SessionId::from("alpha");
        cache
            .store(&session, "deploy schedule for the api", &payload("cached"))
            .await;

        let hit = cache
            .lookup(&session, "deploy schedule for the api")
            .await
            .expect("identical query should hit");
        assert_eq!(hit.text, "cached");
        assert!(hit.metadata.cache_hit);
    }

    #[tokio::test]
    async fn other_sessions_never_see_the_entry() {
        let cache = cache();
        cache
            .store(&SessionId::from("alpha"), "deploy schedule", &payload("cached"))
            .await;

        assert!(
            cache
                .lookup(&SessionId::from("beta"), "deploy schedule")
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn dissimilar_query_misses() {
        let cache = cache();
        let session = SessionId::from("alpha");
        cache
            .store(&session, "deploy schedule for the api", &payload("cached"))
            .await;

        assert!(
            cache
                .lookup(&session, "favorite zebra colors")
                .await
                .is_none()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_misses() {
        let cache = cache();
        let session = SessionId::from("alpha");
        cache.store(&session, "deploy schedule", &payload("cached")).await;

        tokio::time::advance(Duration::from_secs(301)).await;

        assert!(cache.lookup(&session, "deploy schedule").await.is_none());
    }

    #[tokio::test]
    async fn session_invalidation_spares_other_sessions() {
        let cache = cache();
        let alpha = SessionId::from("alpha");
        let beta = SessionId::from("beta");
        cache.store(&alpha, "alpha query", &payload("a")).await;
        cache.store(&beta, "beta query", &payload("b")).await;

        cache.invalidate_session(&alpha).await;

        assert!(cache.lookup(&alpha, "alpha query").await.is_none());
        assert!(cache.lookup(&beta, "beta query").await.is_some());
    }

    #[tokio::test]
    async fn invalidate_all_clears_everything() {
        let cache = cache();
        let alpha = SessionId::from("alpha");
        cache.store(&alpha, "alpha query", &payload("a")).await;

        cache.invalidate_all().await;

        assert!(cache.lookup(&alpha, "alpha query").await.is_none());
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_first() {
        let config = CacheConfig {
            capacity: 2,
            ..CacheConfig::default()
        };
        let cache = SemanticCache::new(config, Arc::new(LocalProvider::new()));
        let session = SessionId::from("alpha");
        cache.store(&session, "first entry text", &payload("1")).await;
        cache.store(&session, "second entry text", &payload("2")).await;
        cache.store(&session, "third entry text", &payload("3")).await;

        assert!(cache.lookup(&session, "first entry text").await.is_none());
        assert!(cache.lookup(&session, "third entry text").await.is_some());
    }

    #[tokio::test]
    async fn disabled_cache_never_hits() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let cache = SemanticCache::new(config, Arc::new(LocalProvider::new()));
        let session = SessionId::from("alpha");
        cache.store(&session, "deploy schedule", &payload("cached")).await;

        assert!(cache.lookup(&session, "deploy schedule").await.is_none());
    }

    #[tokio::test]
    async fn embedding_failure_is_a_silent_miss() {
        let cache = SemanticCache::new(CacheConfig::default(), Arc::new(FailingEmbedder));
        let session = SessionId::from("alpha");
        cache.store(&session, "deploy schedule", &payload("cached")).await;

        assert!(cache.lookup(&session, "deploy schedule").await.is_none());
    }
}
