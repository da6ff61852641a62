//! The retrieval tier — hybrid semantic search with reflection.
//!
//! Every fetch runs a dense pass (cosine over embeddings) and a sparse
//! pass (term-frequency over locally held chunks) and fuses them by
//! configured weights. The primary index serves the dense pass when
//! healthy; the in-process fallback index, kept warm by mirroring every
//! upsert, takes over behind the circuit breaker. After the initial
//! pass a reflection step judges adequacy and may expand the query
//! once, concurrently, before merging and reranking.

use crate::reflection::{
    merge_ranked, parse_expansions, parse_judged_confidence, rerank, score_confidence,
    term_coverage, term_overlap,
};
use chrono::Utc;
use futures::future::join_all;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use strata_config::{JudgeMode, RetrievalConfig, Scope};
use strata_core::chunk::{Chunk, DocumentContent, DocumentInput, Modality};
use strata_core::error::{ProviderError, Result};
use strata_core::event::{DomainEvent, EventBus};
use strata_core::provider::{
    CompletionProvider, CompletionRequest, EmbeddingInput, EmbeddingProvider,
};
use strata_core::retrieval::{ReflectionOutcome, RetrievalResult, ServeSource};
use strata_core::session::SessionId;
use strata_core::tier::{ContextItem, ContextQuery, MemoryTier, TierFetch, TierKind};
use strata_core::token::{TokenCounter, terms};
use strata_store::breaker::CircuitBreaker;
use strata_store::index::{InMemoryVectorIndex, ScoredId, VectorIndex, VectorPoint};
use strata_store::scoring::{keyword_score, weighted_fusion};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const EXPANSION_SYSTEM: &str = "You rewrite search queries to surface related \
phrasings. Output one query per line with no numbering or commentary.";

const JUDGE_SYSTEM: &str = "You rate how well retrieved passages answer a \
query. Reply with one number between 0 and 1, nothing else.";

/// One hybrid dense+sparse pass over the corpus.
struct PassOutcome {
    results: Vec<RetrievalResult>,
    source: ServeSource,
    degraded: Option<String>,
}

/// Ingests documents and serves ranked chunks.
pub struct RetrievalTier {
    config: RetrievalConfig,
    model: String,
    counter: TokenCounter,
    embedder: Arc<dyn EmbeddingProvider>,
    completions: Arc<dyn CompletionProvider>,
    primary: Option<Arc<dyn VectorIndex>>,
    fallback: InMemoryVectorIndex,
    breaker: Arc<CircuitBreaker>,
    /// Chunk texts live here; the fallback index holds only vectors.
    chunks: RwLock<HashMap<String, Chunk>>,
    /// Points the primary missed during an outage, re-shipped with the
    /// next successful upsert.
    pending_primary: Mutex<Vec<VectorPoint>>,
    events: Arc<EventBus>,
}

impl RetrievalTier {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RetrievalConfig,
        model: impl Into<String>,
        counter: TokenCounter,
        embedder: Arc<dyn EmbeddingProvider>,
        completions: Arc<dyn CompletionProvider>,
        primary: Option<Arc<dyn VectorIndex>>,
        breaker: Arc<CircuitBreaker>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            model: model.into(),
            counter,
            embedder,
            completions,
            primary,
            fallback: InMemoryVectorIndex::new(),
            breaker,
            chunks: RwLock::new(HashMap::new()),
            pending_primary: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Embed, index, and locally cache one document. Returns the chunk
    /// id.
    ///
    /// Image documents embed their bytes directly; when the provider
    /// is text-only, a supplied caption is embedded instead, and an
    /// uncaptioned image is rejected back to the caller. The caption
    /// (not the bytes) becomes the chunk's searchable text either way.
    pub async fn ingest_document(&self, input: DocumentInput) -> Result<String> {
        let session = self.effective_session(input.session_id.as_ref());

        let (text, modality, embed_input) = match input.content {
            DocumentContent::Text(text) => {
                let embed_input = EmbeddingInput::text(text.clone());
                (text, Modality::Text, embed_input)
            }
            DocumentContent::Image {
                media_type,
                data,
                caption,
            } => (
                caption.unwrap_or_default(),
                Modality::Image,
                EmbeddingInput::Image { media_type, data },
            ),
        };

        let embedding = match self.embedder.embed(vec![embed_input]).await {
            Ok(vectors) => take_first(vectors)?,
            Err(ProviderError::Unsupported(reason)) if modality == Modality::Image => {
                if text.is_empty() {
                    return Err(ProviderError::Unsupported(format!(
                        "image input needs a caption with a text-only embedding provider: {reason}"
                    ))
                    .into());
                }
                debug!("Embedding provider rejected image input, embedding caption");
                let vectors = self
                    .embedder
                    .embed(vec![EmbeddingInput::text(text.clone())])
                    .await?;
                take_first(vectors)?
            }
            Err(e) => return Err(e.into()),
        };

        let mut chunk = Chunk::new(text, modality);
        chunk.sparse_terms = terms(&chunk.text);
        chunk.metadata = input.metadata;
        chunk.session_id = session.clone();
        chunk.embedding = Some(embedding.clone());
        let id = chunk.id.clone();

        {
            let mut chunks = self.chunks.write().await;
            chunks.insert(id.clone(), chunk);
        }

        let point = VectorPoint {
            id: id.clone(),
            vector: embedding,
            session_id: session.as_ref().map(|s| s.as_str().to_string()),
        };
        self.fallback.upsert(vec![point.clone()]).await?;
        self.mirror_to_primary(point).await;

        debug!(chunk_id = %id, modality = ?modality, "Document ingested");
        Ok(id)
    }

    /// Number of locally held chunks.
    pub async fn chunk_count(&self) -> usize {
        self.chunks.read().await.len()
    }

    async fn mirror_to_primary(&self, point: VectorPoint) {
        let Some(primary) = &self.primary else {
            return;
        };

        // Ship anything stranded by an earlier outage along with this
        // point.
        let mut batch = {
            let mut pending = self.pending_primary.lock().await;
            let mut batch: Vec<VectorPoint> = pending.drain(..).collect();
            batch.push(point);
            batch
        };

        if !self.breaker.allow().await {
            self.pending_primary.lock().await.append(&mut batch);
            return;
        }

        match primary.upsert(batch.clone()).await {
            Ok(()) => self.breaker.record_success().await,
            Err(e) => {
                self.breaker.record_failure().await;
                warn!(
                    error = %e,
                    stranded = batch.len(),
                    "Primary vector upsert failed, queued for retry"
                );
                self.pending_primary.lock().await.append(&mut batch);
            }
        }
    }

    fn effective_session(&self, session: Option<&SessionId>) -> Option<SessionId> {
        match self.config.scope {
            Scope::Session => session.cloned(),
            Scope::Global => None,
        }
    }

    fn session_filter(&self, session: &SessionId) -> Option<SessionId> {
        match self.config.scope {
            Scope::Session => Some(session.clone()),
            Scope::Global => None,
        }
    }

    async fn embed_query(&self, text: &str) -> Option<Vec<f32>> {
        match self.embedder.embed(vec![EmbeddingInput::text(text)]).await {
            Ok(vectors) => vectors.into_iter().next(),
            Err(e) => {
                warn!(error = %e, "Query embedding failed");
                None
            }
        }
    }

    /// Dense candidates from the primary when it is healthy, otherwise
    /// from the fallback index.
    async fn search_candidates(
        &self,
        vector: &[f32],
        session: Option<&SessionId>,
    ) -> (Vec<ScoredId>, ServeSource, Option<String>) {
        let limit = self.config.candidate_k;

        if let Some(primary) = &self.primary {
            if self.breaker.allow().await {
                match primary.search(vector, limit, session).await {
                    Ok(hits) => {
                        self.breaker.record_success().await;
                        return (hits, ServeSource::Primary, None);
                    }
                    Err(e) => {
                        self.breaker.record_failure().await;
                        warn!(error = %e, "Primary vector search failed, using fallback");
                        self.events.publish(DomainEvent::BackendFallback {
                            tier: TierKind::Retrieval,
                            reason: e.to_string(),
                            timestamp: Utc::now(),
                        });
                        return self
                            .fallback_candidates(vector, limit, session, "primary index unavailable")
                            .await;
                    }
                }
            }
            return self
                .fallback_candidates(vector, limit, session, "primary circuit open")
                .await;
        }

        match self.fallback.search(vector, limit, session).await {
            Ok(hits) => (hits, ServeSource::Local, None),
            Err(e) => (Vec::new(), ServeSource::Local, Some(e.to_string())),
        }
    }

    async fn fallback_candidates(
        &self,
        vector: &[f32],
        limit: usize,
        session: Option<&SessionId>,
        reason: &str,
    ) -> (Vec<ScoredId>, ServeSource, Option<String>) {
        match self.fallback.search(vector, limit, session).await {
            Ok(hits) => (hits, ServeSource::Fallback, Some(reason.to_string())),
            Err(e) => (Vec::new(), ServeSource::Fallback, Some(e.to_string())),
        }
    }

    async fn sparse_pass(
        &self,
        query_terms: &[String],
        session: Option<&SessionId>,
    ) -> Vec<(String, f32)> {
        let chunks = self.chunks.read().await;
        let mut scored: Vec<(String, f32)> = chunks
            .values()
            .filter(|chunk| visible(chunk, session))
            .map(|chunk| (chunk.id.clone(), keyword_score(query_terms, &chunk.sparse_terms)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(self.config.candidate_k);
        scored
    }

    /// One full hybrid pass for one query string. Never fails: a dead
    /// embedding provider degrades to sparse-only.
    async fn hybrid_pass(&self, text: &str, session: Option<&SessionId>) -> PassOutcome {
        let query_terms = terms(text);

        let (dense_hits, source, degraded, dense_weight) = match self.embed_query(text).await {
            Some(vector) => {
                let (hits, source, degraded) = self.search_candidates(&vector, session).await;
                (hits, source, degraded, self.config.dense_weight)
            }
            None => (
                Vec::new(),
                ServeSource::Local,
                Some("embedding provider unavailable, sparse-only".to_string()),
                0.0,
            ),
        };

        let dense_pairs: Vec<(String, f32)> = dense_hits
            .into_iter()
            .map(|hit| (hit.id, hit.score.max(0.0)))
            .collect();
        let sparse_pairs = self.sparse_pass(&query_terms, session).await;

        let results = weighted_fusion(
            &dense_pairs,
            &sparse_pairs,
            dense_weight,
            self.config.sparse_weight,
        )
        .into_iter()
        .take(self.config.candidate_k)
        .enumerate()
        .map(|(rank, (chunk_id, score))| RetrievalResult {
            chunk_id,
            score,
            source,
            rank,
        })
        .collect();

        PassOutcome {
            results,
            source,
            degraded,
        }
    }

    async fn expand_query(&self, query: &str, max: usize) -> Vec<String> {
        let prompt = format!(
            "Rewrite this search query as {max} alternative phrasings, one per line:\n\n{query}"
        );
        let request = CompletionRequest::new(&self.model, prompt)
            .with_system(EXPANSION_SYSTEM)
            .with_max_tokens(128);
        match self.completions.complete(request).await {
            Ok(response) => parse_expansions(&response.text, query, max),
            Err(e) => {
                warn!(error = %e, "Query expansion failed, serving initial results");
                Vec::new()
            }
        }
    }

    async fn judge_confidence(&self, query: &str, texts: &[String]) -> Option<f32> {
        let prompt = format!(
            "Query: {query}\n\nRetrieved passages:\n{}\n\nHow well do the passages answer the query?",
            texts.join("\n---\n")
        );
        let request = CompletionRequest::new(&self.model, prompt)
            .with_system(JUDGE_SYSTEM)
            .with_max_tokens(8);
        match self.completions.complete(request).await {
            Ok(response) => parse_judged_confidence(&response.text),
            Err(e) => {
                warn!(error = %e, "Confidence judge failed, using heuristic");
                None
            }
        }
    }

    async fn texts_for(&self, results: &[RetrievalResult]) -> Vec<String> {
        let chunks = self.chunks.read().await;
        results
            .iter()
            .filter_map(|r| chunks.get(&r.chunk_id).map(|c| c.text.clone()))
            .collect()
    }

    async fn overlap_pairs(
        &self,
        results: Vec<RetrievalResult>,
        query_terms: &HashSet<String>,
    ) -> Vec<(RetrievalResult, f32)> {
        let chunks = self.chunks.read().await;
        results
            .into_iter()
            .map(|result| {
                let overlap = chunks
                    .get(&result.chunk_id)
                    .map(|c| term_overlap(query_terms, &c.text))
                    .unwrap_or(0.0);
                (result, overlap)
            })
            .collect()
    }

    async fn items_for(&self, results: &[RetrievalResult]) -> Vec<ContextItem> {
        let chunks = self.chunks.read().await;
        results
            .iter()
            .filter_map(|result| {
                let Some(chunk) = chunks.get(&result.chunk_id) else {
                    debug!(chunk_id = %result.chunk_id, "Result has no local chunk text, dropped");
                    return None;
                };
                Some(ContextItem {
                    id: chunk.id.clone(),
                    text: chunk.text.clone(),
                    tokens: self.counter.count(&chunk.text),
                    score: Some(result.score),
                    timestamp: None,
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl MemoryTier for RetrievalTier {
    fn kind(&self) -> TierKind {
        TierKind::Retrieval
    }

    /// Hybrid pass, then at most one reflection round. The expansion
    /// fan-out runs as child futures of this call, so caller
    /// cancellation drops every in-flight sub-query.
    async fn fetch(&self, query: &ContextQuery) -> Result<TierFetch> {
        let k = if query.top_k > 0 {
            query.top_k
        } else {
            self.config.top_k
        };
        let session_filter = self.session_filter(&query.session_id);

        let initial = self.hybrid_pass(&query.text, session_filter.as_ref()).await;
        let mut results = initial.results;
        let mut degraded = initial.degraded;
        let source = initial.source;
        let mut reflection = None;

        if self.config.reflection.enabled {
            let texts = self.texts_for(&results).await;
            let text_refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            let coverage = term_coverage(&query.text, &text_refs);
            let scores: Vec<f32> = results.iter().map(|r| r.score).collect();
            let heuristic = score_confidence(&scores, coverage);

            let confidence = match self.config.reflection.judge {
                JudgeMode::Heuristic => heuristic,
                JudgeMode::Llm => self
                    .judge_confidence(&query.text, &texts)
                    .await
                    .unwrap_or(heuristic),
            };

            let mut outcome = ReflectionOutcome {
                fired: false,
                confidence,
                expansions_issued: 0,
            };

            if confidence < self.config.reflection.threshold {
                let expansions = self
                    .expand_query(&query.text, self.config.reflection.max_expansions)
                    .await;
                if !expansions.is_empty() {
                    outcome.fired = true;
                    outcome.expansions_issued = expansions.len();

                    // Bounded concurrent fan-out; one round only.
                    let passes = join_all(
                        expansions
                            .iter()
                            .map(|q| self.hybrid_pass(q, session_filter.as_ref())),
                    )
                    .await;
                    let mut expanded = Vec::new();
                    for pass in passes {
                        if degraded.is_none() {
                            degraded = pass.degraded;
                        }
                        expanded.extend(pass.results);
                    }

                    let query_terms: HashSet<String> =
                        terms(&query.text).into_iter().collect();
                    let merged = merge_ranked(results, expanded);
                    let pairs = self.overlap_pairs(merged, &query_terms).await;
                    results = rerank(
                        pairs,
                        self.config.rerank_fused_weight,
                        self.config.rerank_overlap_weight,
                        k,
                    );

                    info!(
                        confidence,
                        expansions = outcome.expansions_issued,
                        "Reflection expanded low-confidence retrieval"
                    );
                    self.events.publish(DomainEvent::ReflectionFired {
                        confidence,
                        expansions: outcome.expansions_issued,
                        timestamp: Utc::now(),
                    });
                }
            }
            reflection = Some(outcome);
        }

        results.truncate(k);
        let items = self.items_for(&results).await;

        let mut fetch = TierFetch::new(TierKind::Retrieval, items, source);
        fetch.degraded = degraded;
        fetch.reflection = reflection;
        Ok(fetch)
    }
}

fn visible(chunk: &Chunk, session: Option<&SessionId>) -> bool {
    match (session, &chunk.session_id) {
        (Some(s), Some(owner)) => owner == s,
        (Some(_), None) => true,
        (None, _) => true,
    }
}

fn take_first(vectors: Vec<Vec<f32>>) -> std::result::Result<Vec<f32>, ProviderError> {
    vectors
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::InvalidResponse("empty embedding batch".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use strata_config::ReflectionConfig;
    use strata_core::error::StoreError;
    use strata_core::provider::CompletionResponse;
    use strata_providers::LocalProvider;

    /// Completion provider that answers from a scripted queue.
    struct ScriptedCompletion {
        responses: StdMutex<VecDeque<String>>,
        calls: StdMutex<Vec<CompletionRequest>>,
    }

    impl ScriptedCompletion {
        fn new(responses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(
                    responses.iter().map(|s| s.to_string()).collect(),
                ),
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl CompletionProvider for ScriptedCompletion {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> std::result::Result<CompletionResponse, ProviderError> {
            self.calls.lock().unwrap().push(request);
            let text = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            Ok(CompletionResponse {
                text,
                model: "scripted".into(),
                usage: None,
            })
        }
    }

    /// Embedding provider that rejects image input.
    struct TextOnlyEmbedder;

    #[async_trait::async_trait]
    impl EmbeddingProvider for TextOnlyEmbedder {
        fn name(&self) -> &str {
            "text_only"
        }

        async fn embed(
            &self,
            inputs: Vec<EmbeddingInput>,
        ) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
            if inputs
                .iter()
                .any(|i| matches!(i, EmbeddingInput::Image { .. }))
            {
                return Err(ProviderError::Unsupported("text-only model".into()));
            }
            LocalProvider::new().embed(inputs).await
        }
    }

    /// Primary index that fails its first `fail_first` upserts and
    /// records the rest.
    struct RecordingIndex {
        fail_first: StdMutex<usize>,
        fail_search: bool,
        upserts: StdMutex<Vec<Vec<VectorPoint>>>,
    }

    impl RecordingIndex {
        fn new(fail_first: usize, fail_search: bool) -> Arc<Self> {
            Arc::new(Self {
                fail_first: StdMutex::new(fail_first),
                fail_search,
                upserts: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl VectorIndex for RecordingIndex {
        fn name(&self) -> &str {
            "recording"
        }

        async fn upsert(&self, points: Vec<VectorPoint>) -> std::result::Result<(), StoreError> {
            {
                let mut fail = self.fail_first.lock().unwrap();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(StoreError::Unavailable("index down".into()));
                }
            }
            self.upserts.lock().unwrap().push(points);
            Ok(())
        }

        async fn search(
            &self,
            _query: &[f32],
            _limit: usize,
            _session: Option<&SessionId>,
        ) -> std::result::Result<Vec<ScoredId>, StoreError> {
            if self.fail_search {
                return Err(StoreError::Unavailable("index down".into()));
            }
            Ok(Vec::new())
        }

        async fn count(&self) -> std::result::Result<usize, StoreError> {
            Ok(0)
        }
    }

    fn quiet_config() -> RetrievalConfig {
        RetrievalConfig {
            reflection: ReflectionConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn tier(config: RetrievalConfig, primary: Option<Arc<dyn VectorIndex>>) -> RetrievalTier {
        tier_with(
            config,
            primary,
            Arc::new(LocalProvider::new()),
            Arc::new(LocalProvider::new()),
        )
    }

    fn tier_with(
        config: RetrievalConfig,
        primary: Option<Arc<dyn VectorIndex>>,
        embedder: Arc<dyn EmbeddingProvider>,
        completions: Arc<dyn CompletionProvider>,
    ) -> RetrievalTier {
        RetrievalTier::new(
            config,
            "test-model",
            TokenCounter::default(),
            embedder,
            completions,
            primary,
            Arc::new(CircuitBreaker::new("vector", 3, Duration::from_secs(30))),
            Arc::new(EventBus::default()),
        )
    }

    fn query(session: &str, text: &str) -> ContextQuery {
        ContextQuery {
            session_id: SessionId::from(session),
            text: text.to_string(),
            top_k: 5,
        }
    }

    #[tokio::test]
    async fn ingest_then_fetch_ranks_the_matching_chunk_first() {
        let tier = tier(quiet_config(), None);
        tier.ingest_document(DocumentInput::text(
            "postgres migration runs friday evening",
        ))
        .await
        .unwrap();
        tier.ingest_document(DocumentInput::text("sourdough starter feeding schedule"))
            .await
            .unwrap();
        tier.ingest_document(DocumentInput::text("tokio runtime worker threads"))
            .await
            .unwrap();

        let fetch = tier
            .fetch(&query("s1", "when is the postgres migration"))
            .await
            .unwrap();
        assert_eq!(fetch.source, ServeSource::Local);
        assert!(!fetch.items.is_empty());
        assert!(fetch.items[0].text.contains("postgres migration"));
        assert!(fetch.items[0].score.is_some());
    }

    #[tokio::test]
    async fn session_scope_isolates_chunks() {
        let config = RetrievalConfig {
            scope: Scope::Session,
            ..quiet_config()
        };
        let tier = tier(config, None);

        let mut mine = DocumentInput::text("quarterly revenue numbers for acme");
        mine.session_id = Some(SessionId::from("s1"));
        tier.ingest_document(mine).await.unwrap();

        let mut theirs = DocumentInput::text("quarterly revenue numbers for globex");
        theirs.session_id = Some(SessionId::from("s2"));
        tier.ingest_document(theirs).await.unwrap();

        // No session on the input makes the chunk shared.
        tier.ingest_document(DocumentInput::text("quarterly reporting calendar"))
            .await
            .unwrap();

        let fetch = tier.fetch(&query("s1", "quarterly revenue")).await.unwrap();
        let texts: Vec<&str> = fetch.items.iter().map(|i| i.text.as_str()).collect();
        assert!(texts.iter().any(|t| t.contains("acme")));
        assert!(texts.iter().any(|t| t.contains("calendar")));
        assert!(!texts.iter().any(|t| t.contains("globex")));
    }

    #[tokio::test]
    async fn uncaptioned_image_is_rejected_by_text_only_provider() {
        let tier = tier_with(
            quiet_config(),
            None,
            Arc::new(TextOnlyEmbedder),
            Arc::new(LocalProvider::new()),
        );

        let uncaptioned = DocumentInput {
            content: DocumentContent::Image {
                media_type: "image/png".into(),
                data: vec![1, 2, 3],
                caption: None,
            },
            metadata: serde_json::Map::new(),
            session_id: None,
        };
        assert!(tier.ingest_document(uncaptioned).await.is_err());

        // A caption makes the image ingestable and searchable.
        let captioned = DocumentInput {
            content: DocumentContent::Image {
                media_type: "image/png".into(),
                data: vec![1, 2, 3],
                caption: Some("architecture diagram of the billing service".into()),
            },
            metadata: serde_json::Map::new(),
            session_id: None,
        };
        tier.ingest_document(captioned).await.unwrap();

        let fetch = tier
            .fetch(&query("s1", "billing architecture diagram"))
            .await
            .unwrap();
        assert_eq!(fetch.items.len(), 1);
        assert!(fetch.items[0].text.contains("billing service"));
    }

    #[tokio::test]
    async fn primary_outage_falls_back_transparently() {
        let primary = RecordingIndex::new(usize::MAX, true);
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let tier = RetrievalTier::new(
            quiet_config(),
            "test-model",
            TokenCounter::default(),
            Arc::new(LocalProvider::new()),
            Arc::new(LocalProvider::new()),
            Some(primary),
            Arc::new(CircuitBreaker::new("vector", 3, Duration::from_secs(30))),
            events,
        );

        tier.ingest_document(DocumentInput::text("incident runbook for checkout"))
            .await
            .unwrap();

        let fetch = tier.fetch(&query("s1", "checkout incident runbook")).await.unwrap();
        assert_eq!(fetch.source, ServeSource::Fallback);
        assert!(fetch.is_degraded());
        assert!(fetch.items[0].text.contains("runbook"));

        let mut saw_fallback = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event.as_ref(), DomainEvent::BackendFallback { .. }) {
                saw_fallback = true;
            }
        }
        assert!(saw_fallback);
    }

    #[tokio::test]
    async fn stranded_points_reship_when_the_primary_recovers() {
        let primary = RecordingIndex::new(1, false);
        let tier = RetrievalTier::new(
            quiet_config(),
            "test-model",
            TokenCounter::default(),
            Arc::new(LocalProvider::new()),
            Arc::new(LocalProvider::new()),
            Some(primary.clone()),
            Arc::new(CircuitBreaker::new("vector", 5, Duration::from_secs(30))),
            Arc::new(EventBus::default()),
        );

        tier.ingest_document(DocumentInput::text("first document"))
            .await
            .unwrap();
        tier.ingest_document(DocumentInput::text("second document"))
            .await
            .unwrap();

        // The second upsert carries the stranded first point with it.
        let upserts = primary.upserts.lock().unwrap();
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].len(), 2);
    }

    #[tokio::test]
    async fn reflection_fires_below_threshold_and_expands_once() {
        let completions = ScriptedCompletion::new(&["alpha rollout\nbeta checklist"]);
        let tier = tier_with(
            RetrievalConfig::default(),
            None,
            Arc::new(LocalProvider::new()),
            completions.clone(),
        );

        tier.ingest_document(DocumentInput::text("alpha rollout owners and dates"))
            .await
            .unwrap();
        tier.ingest_document(DocumentInput::text("beta checklist sign-offs"))
            .await
            .unwrap();

        // Nothing in the corpus matches the query terms.
        let fetch = tier.fetch(&query("s1", "zebra quantum basket")).await.unwrap();
        let outcome = fetch.reflection.unwrap();
        assert!(outcome.fired);
        assert!(outcome.confidence < 0.7);
        assert_eq!(outcome.expansions_issued, 2);
        // Expansion passes surface the real corpus.
        assert!(!fetch.items.is_empty());
        // Exactly one expansion round: one completion call, no judge.
        assert_eq!(completions.call_count(), 1);
    }

    #[tokio::test]
    async fn high_confidence_returns_initial_results_unchanged() {
        let completions = ScriptedCompletion::new(&[]);
        let tier = tier_with(
            RetrievalConfig::default(),
            None,
            Arc::new(LocalProvider::new()),
            completions.clone(),
        );

        tier.ingest_document(DocumentInput::text("deploy window is friday at noon"))
            .await
            .unwrap();

        let fetch = tier
            .fetch(&query("s1", "deploy window is friday at noon"))
            .await
            .unwrap();
        let outcome = fetch.reflection.unwrap();
        assert!(!outcome.fired);
        assert!(outcome.confidence >= 0.7);
        assert_eq!(completions.call_count(), 0);
        assert_eq!(fetch.items.len(), 1);
    }

    #[tokio::test]
    async fn llm_judge_falls_back_to_heuristic_on_garbage() {
        let completions =
            ScriptedCompletion::new(&["not a number", "release timeline\nlaunch dates"]);
        let config = RetrievalConfig {
            reflection: ReflectionConfig {
                judge: JudgeMode::Llm,
                ..Default::default()
            },
            ..Default::default()
        };
        let tier = tier_with(
            config,
            None,
            Arc::new(LocalProvider::new()),
            completions.clone(),
        );
        tier.ingest_document(DocumentInput::text("release timeline for the mobile app"))
            .await
            .unwrap();

        let fetch = tier.fetch(&query("s1", "unrelated gibberish words")).await.unwrap();
        let outcome = fetch.reflection.unwrap();
        // Judge said nothing usable, heuristic scored low, loop fired.
        assert!(outcome.fired);
        assert_eq!(completions.call_count(), 2);
    }
}
