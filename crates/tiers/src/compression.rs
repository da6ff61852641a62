//! The compression tier — summarized history at graded densities.
//!
//! Evicted turns arrive via [`CompressionTier::enqueue`], are cut into
//! batches, and a worker drains the batch queue through the completion
//! provider. Failed batches re-queue with exponential backoff, and
//! turns still waiting are served verbatim (flagged degraded) so
//! history is never silently absent. Summaries age through the density
//! ladder: old fine summaries merge into medium, old medium into
//! coarse.

use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use strata_config::CompressionConfig;
use strata_core::error::{ProviderError, Result};
use strata_core::event::{DomainEvent, EventBus};
use strata_core::provider::{CompletionProvider, CompletionRequest};
use strata_core::session::SessionId;
use strata_core::summary::{Summary, SummaryDensity};
use strata_core::tier::{ContextItem, ContextQuery, MemoryTier, TierFetch, TierKind};
use strata_core::token::{TokenCounter, terms};
use strata_core::turn::Turn;
use strata_core::ServeSource;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

const SUMMARIZE_SYSTEM: &str = "You compress conversation history. Preserve \
decisions, facts, names, dates, and open questions. Output plain text with \
no preamble.";

/// A batch of evicted turns awaiting summarization.
struct PendingBatch {
    turns: Vec<Turn>,
    attempts: u32,
    ready_at: Instant,
}

impl PendingBatch {
    fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns,
            attempts: 0,
            ready_at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct SessionCompression {
    /// Evicted turns not yet cut into a batch.
    staging: Vec<Turn>,
    queue: VecDeque<PendingBatch>,
    summaries: Vec<Summary>,
    /// Source-id sets already summarized; the at-least-once dedup key.
    processed: HashSet<String>,
}

impl SessionCompression {
    fn pending_turns(&self) -> usize {
        self.staging.len() + self.queue.iter().map(|b| b.turns.len()).sum::<usize>()
    }
}

/// Summarizes evicted turns and serves the compressed record.
pub struct CompressionTier {
    config: CompressionConfig,
    model: String,
    counter: TokenCounter,
    provider: Arc<dyn CompletionProvider>,
    events: Arc<EventBus>,
    state: RwLock<HashMap<SessionId, SessionCompression>>,
}

impl CompressionTier {
    pub fn new(
        config: CompressionConfig,
        model: impl Into<String>,
        counter: TokenCounter,
        provider: Arc<dyn CompletionProvider>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            model: model.into(),
            counter,
            provider,
            events,
            state: RwLock::new(HashMap::new()),
        }
    }

    /// Accept turns evicted from the active window. Cuts a batch as
    /// soon as enough turns are staged; never calls the provider.
    pub async fn enqueue(&self, session: &SessionId, turns: Vec<Turn>) {
        if turns.is_empty() {
            return;
        }
        let mut state = self.state.write().await;
        let entry = state.entry(session.clone()).or_default();
        entry.staging.extend(turns);
        while entry.staging.len() >= self.config.fine_batch_turns {
            let batch: Vec<Turn> = entry
                .staging
                .drain(..self.config.fine_batch_turns)
                .collect();
            entry.queue.push_back(PendingBatch::new(batch));
        }
    }

    /// Drain every batch whose backoff has elapsed. Returns the number
    /// of summaries written. Failed batches go back on the queue with
    /// the next backoff delay; turns are never dropped.
    pub async fn process_pending(&self, session: &SessionId) -> Result<usize> {
        let ready = {
            let mut state = self.state.write().await;
            let Some(entry) = state.get_mut(session) else {
                return Ok(0);
            };
            // Staged leftovers become a partial batch so no turn waits
            // on future evictions.
            if !entry.staging.is_empty() {
                let batch: Vec<Turn> = entry.staging.drain(..).collect();
                entry.queue.push_back(PendingBatch::new(batch));
            }

            let now = Instant::now();
            let mut ready = Vec::new();
            let mut waiting = VecDeque::new();
            while let Some(batch) = entry.queue.pop_front() {
                if batch.ready_at <= now {
                    ready.push(batch);
                } else {
                    waiting.push_back(batch);
                }
            }
            entry.queue = waiting;
            ready
        };

        let mut written = 0;
        for batch in ready {
            match self.summarize_batch(&batch.turns).await {
                Ok(summary) => {
                    if self.store_summary(session, summary).await {
                        written += 1;
                    }
                    self.merge_ready(session).await;
                }
                Err(e) => {
                    warn!(
                        session_id = %session,
                        attempt = batch.attempts + 1,
                        error = %e,
                        "Compression batch failed, re-queueing"
                    );
                    self.requeue(session, batch).await;
                }
            }
        }
        Ok(written)
    }

    /// Sessions that currently have staged or queued turns.
    pub async fn sessions_with_pending(&self) -> Vec<SessionId> {
        let state = self.state.read().await;
        state
            .iter()
            .filter(|(_, entry)| entry.pending_turns() > 0)
            .map(|(session, _)| session.clone())
            .collect()
    }

    /// Stored summaries for a session, oldest first.
    pub async fn summaries(&self, session: &SessionId) -> Vec<Summary> {
        let state = self.state.read().await;
        let mut out: Vec<Summary> = state
            .get(session)
            .map(|entry| entry.summaries.clone())
            .unwrap_or_default();
        out.sort_by_key(|s| s.created_at);
        out
    }

    /// Turns accepted but not yet summarized.
    pub async fn queued_turn_count(&self, session: &SessionId) -> usize {
        let state = self.state.read().await;
        state.get(session).map(|e| e.pending_turns()).unwrap_or(0)
    }

    /// Pending turns, batched queue first then staging, oldest first.
    pub async fn queued_turns(&self, session: &SessionId) -> Vec<Turn> {
        let state = self.state.read().await;
        let Some(entry) = state.get(session) else {
            return Vec::new();
        };
        let mut out: Vec<Turn> = entry
            .queue
            .iter()
            .flat_map(|batch| batch.turns.iter().cloned())
            .collect();
        out.extend(entry.staging.iter().cloned());
        out
    }

    async fn summarize_batch(
        &self,
        turns: &[Turn],
    ) -> std::result::Result<Summary, ProviderError> {
        let transcript: Vec<String> = turns.iter().map(Turn::render).collect();
        let prompt = format!(
            "Summarize this conversation excerpt:\n\n{}",
            transcript.join("\n")
        );
        let request = CompletionRequest::new(&self.model, prompt)
            .with_system(SUMMARIZE_SYSTEM)
            .with_max_tokens(self.config.fine_target_tokens as u32);
        let response = self.provider.complete(request).await?;

        let text = response.text.trim().to_string();
        let token_count = self.counter.count(&text);
        let source_ids: BTreeSet<String> = turns.iter().map(|t| t.id.clone()).collect();
        Ok(Summary::new(
            SummaryDensity::Fine,
            source_ids,
            text,
            token_count,
            importance_of(turns),
        ))
    }

    /// Store a summary unless its source set was already summarized.
    async fn store_summary(&self, session: &SessionId, summary: Summary) -> bool {
        let key = dedup_key(&summary.source_turn_ids);
        let mut state = self.state.write().await;
        let entry = state.entry(session.clone()).or_default();
        if !entry.processed.insert(key) {
            debug!(session_id = %session, "Duplicate compression batch skipped");
            return false;
        }

        self.events.publish(DomainEvent::SummaryWritten {
            session_id: session.as_str().to_string(),
            density: summary.density.label().to_string(),
            source_turns: summary.source_turn_ids.len(),
            tokens: summary.token_count,
            timestamp: Utc::now(),
        });
        entry.summaries.push(summary);

        let evicted = evict_over_capacity(entry, self.config.max_summaries_per_session);
        if evicted > 0 {
            debug!(session_id = %session, evicted, "Summary store over capacity");
        }
        true
    }

    /// Run the density ladder: fine merges into medium, medium into
    /// coarse, oldest first.
    async fn merge_ready(&self, session: &SessionId) {
        self.merge_density(
            session,
            SummaryDensity::Fine,
            self.config.fine_merge_threshold,
            self.config.medium_target_tokens,
        )
        .await;
        self.merge_density(
            session,
            SummaryDensity::Medium,
            self.config.medium_merge_threshold,
            self.config.coarse_target_tokens,
        )
        .await;
    }

    async fn merge_density(
        &self,
        session: &SessionId,
        density: SummaryDensity,
        threshold: usize,
        target_tokens: usize,
    ) {
        let Some(coarser) = density.coarser() else {
            return;
        };
        loop {
            // Snapshot the oldest batch; the originals keep serving
            // until the merged summary lands.
            let to_merge: Vec<Summary> = {
                let state = self.state.read().await;
                let Some(entry) = state.get(session) else {
                    return;
                };
                let at_density: Vec<&Summary> = entry
                    .summaries
                    .iter()
                    .filter(|s| s.density == density)
                    .collect();
                if at_density.len() <= threshold {
                    return;
                }
                at_density
                    .iter()
                    .take(self.config.merge_batch)
                    .map(|s| (*s).clone())
                    .collect()
            };
            if to_merge.len() < 2 {
                return;
            }

            match self.merge_summaries(&to_merge, coarser, target_tokens).await {
                Ok(merged) => {
                    let mut state = self.state.write().await;
                    let Some(entry) = state.get_mut(session) else {
                        return;
                    };
                    let replaced: HashSet<&str> =
                        to_merge.iter().map(|s| s.id.as_str()).collect();
                    entry.summaries.retain(|s| !replaced.contains(s.id.as_str()));
                    self.events.publish(DomainEvent::SummaryWritten {
                        session_id: session.as_str().to_string(),
                        density: merged.density.label().to_string(),
                        source_turns: merged.source_turn_ids.len(),
                        tokens: merged.token_count,
                        timestamp: Utc::now(),
                    });
                    entry.summaries.push(merged);
                    evict_over_capacity(entry, self.config.max_summaries_per_session);
                }
                Err(e) => {
                    // Originals stay in place; the next batch retries.
                    warn!(session_id = %session, density = density.label(), error = %e, "Summary merge failed");
                    return;
                }
            }
        }
    }

    async fn merge_summaries(
        &self,
        parts: &[Summary],
        density: SummaryDensity,
        target_tokens: usize,
    ) -> std::result::Result<Summary, ProviderError> {
        let joined: Vec<&str> = parts.iter().map(|s| s.text.as_str()).collect();
        let prompt = format!(
            "Combine these summaries of consecutive conversation spans into one:\n\n{}",
            joined.join("\n\n")
        );
        let request = CompletionRequest::new(&self.model, prompt)
            .with_system(SUMMARIZE_SYSTEM)
            .with_max_tokens(target_tokens as u32);
        let response = self.provider.complete(request).await?;

        let text = response.text.trim().to_string();
        let token_count = self.counter.count(&text);
        let source_ids: BTreeSet<String> = parts
            .iter()
            .flat_map(|s| s.source_turn_ids.iter().cloned())
            .collect();
        let importance =
            parts.iter().map(|s| s.importance).sum::<f32>() / parts.len() as f32;
        Ok(Summary::new(
            density,
            source_ids,
            text,
            token_count,
            importance,
        ))
    }

    async fn requeue(&self, session: &SessionId, mut batch: PendingBatch) {
        batch.attempts += 1;
        let delay = backoff_delay(&self.config, batch.attempts);
        batch.ready_at = Instant::now() + delay;

        self.events.publish(DomainEvent::CompressionRetryScheduled {
            session_id: session.as_str().to_string(),
            attempt: batch.attempts,
            delay_ms: delay.as_millis() as u64,
            timestamp: Utc::now(),
        });
        let mut state = self.state.write().await;
        state.entry(session.clone()).or_default().queue.push_back(batch);
    }

    fn raw_batch_item(&self, turns: &[Turn]) -> ContextItem {
        let text: Vec<String> = turns.iter().map(Turn::render).collect();
        let text = text.join("\n");
        let tokens = self.counter.count(&text);
        ContextItem {
            id: turns
                .first()
                .map(|t| format!("raw-{}", t.id))
                .unwrap_or_else(|| "raw".into()),
            text,
            tokens,
            score: None,
            timestamp: turns.last().map(|t| t.timestamp),
        }
    }
}

#[async_trait::async_trait]
impl MemoryTier for CompressionTier {
    fn kind(&self) -> TierKind {
        TierKind::Compression
    }

    /// Serves summaries oldest first, then any turns still waiting for
    /// compression verbatim. Waiting turns mark the fetch degraded:
    /// history is present but uncompressed.
    async fn fetch(&self, query: &ContextQuery) -> Result<TierFetch> {
        let state = self.state.read().await;
        let Some(entry) = state.get(&query.session_id) else {
            return Ok(TierFetch::empty(TierKind::Compression));
        };

        let mut ordered: Vec<&Summary> = entry.summaries.iter().collect();
        ordered.sort_by_key(|s| s.created_at);

        let mut items: Vec<ContextItem> = ordered
            .iter()
            .map(|s| ContextItem {
                id: s.id.clone(),
                text: s.text.clone(),
                tokens: s.token_count,
                score: None,
                timestamp: Some(s.created_at),
            })
            .collect();

        let mut raw_turns = 0;
        for batch in &entry.queue {
            raw_turns += batch.turns.len();
            items.push(self.raw_batch_item(&batch.turns));
        }
        if !entry.staging.is_empty() {
            raw_turns += entry.staging.len();
            items.push(self.raw_batch_item(&entry.staging));
        }

        let mut fetch = TierFetch::new(TierKind::Compression, items, ServeSource::Local);
        if raw_turns > 0 {
            fetch.degraded = Some(format!("{raw_turns} raw turns awaiting compression"));
        }
        Ok(fetch)
    }
}

fn dedup_key(source_ids: &BTreeSet<String>) -> String {
    source_ids.iter().cloned().collect::<Vec<_>>().join("|")
}

fn backoff_delay(config: &CompressionConfig, attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    let ms = config
        .initial_backoff_ms
        .saturating_mul(1u64 << exp)
        .min(config.max_backoff_ms);
    Duration::from_millis(ms)
}

/// Retention score for a batch: recency-weighted average of per-turn
/// information density (unique terms per word). Later turns weigh more,
/// so batches that end with substance outlive ones that trail off.
fn importance_of(turns: &[Turn]) -> f32 {
    if turns.is_empty() {
        return 0.5;
    }
    let mut weighted = 0.0f64;
    let mut weights = 0.0f64;
    for (i, turn) in turns.iter().enumerate() {
        let words = turn.text.split_whitespace().count();
        let unique: HashSet<String> = terms(&turn.text).into_iter().collect();
        let score = if words == 0 {
            0.35
        } else {
            (0.35 + 0.5 * unique.len() as f64 / words as f64).clamp(0.0, 1.0)
        };
        let weight = (i + 1) as f64;
        weighted += score * weight;
        weights += weight;
    }
    (weighted / weights) as f32
}

/// Drop lowest (importance, created_at) summaries until under `max`.
fn evict_over_capacity(entry: &mut SessionCompression, max: usize) -> usize {
    let mut evicted = 0;
    while entry.summaries.len() > max {
        let lowest = entry
            .summaries
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.importance
                    .partial_cmp(&b.importance)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|(i, _)| i);
        match lowest {
            Some(i) => {
                entry.summaries.remove(i);
                evicted += 1;
            }
            None => break,
        }
    }
    evicted
}
