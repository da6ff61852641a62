//! The active window — verbatim recency memory.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use strata_core::error::Result;
use strata_core::event::{DomainEvent, EventBus};
use strata_core::session::SessionId;
use strata_core::tier::{ContextItem, ContextQuery, MemoryTier, TierFetch, TierKind};
use strata_core::token::TokenCounter;
use strata_core::turn::{Turn, TurnRole};
use strata_core::ServeSource;
use strata_store::checkpoint::CheckpointStore;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// What one `append` did to the window.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub turn_id: String,
    /// Turns evicted to make room, oldest first. The engine forwards
    /// these to the compression tier under the same session write gate.
    pub evicted: Vec<Turn>,
    /// The appended turn alone exceeded the window and was cut.
    pub truncated: bool,
}

#[derive(Default)]
struct WindowState {
    turns: VecDeque<Turn>,
    total_tokens: usize,
}

/// Serialized window payload handed to the checkpoint store.
#[derive(Serialize, Deserialize)]
struct WindowCheckpoint {
    turns: Vec<Turn>,
}

/// Bounded FIFO buffer of recent turns, one window per session.
///
/// Checkpointed after every mutation; checkpoint failure is logged and
/// reported on the event bus but never blocks the in-memory operation.
pub struct ActiveWindowTier {
    max_tokens: usize,
    counter: TokenCounter,
    checkpoint: Arc<dyn CheckpointStore>,
    events: Arc<EventBus>,
    windows: RwLock<HashMap<SessionId, WindowState>>,
}

impl ActiveWindowTier {
    pub fn new(
        max_tokens: usize,
        counter: TokenCounter,
        checkpoint: Arc<dyn CheckpointStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            max_tokens,
            counter,
            checkpoint,
            events,
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Append one turn, evicting oldest turns until the window fits.
    ///
    /// An oversized turn is truncated at ingestion with the flag set;
    /// the window never holds a turn larger than its own cap.
    pub async fn append(
        &self,
        session: &SessionId,
        role: TurnRole,
        text: &str,
    ) -> Result<AppendOutcome> {
        let mut token_count = self.counter.count(text);
        let mut truncated = false;
        let text = if token_count > self.max_tokens {
            let cut = self.counter.truncate(text, self.max_tokens);
            token_count = self.counter.count(cut);
            truncated = true;
            cut
        } else {
            text
        };

        let mut turn = Turn::new(role, text, token_count);
        turn.truncated = truncated;
        let turn_id = turn.id.clone();

        let mut evicted = Vec::new();
        {
            let mut windows = self.windows.write().await;
            let window = windows.entry(session.clone()).or_default();

            window.total_tokens += turn.token_count;
            window.turns.push_back(turn);

            while window.total_tokens > self.max_tokens && window.turns.len() > 1 {
                if let Some(old) = window.turns.pop_front() {
                    window.total_tokens -= old.token_count;
                    evicted.push(old);
                }
            }
        }

        self.events.publish(DomainEvent::TurnIngested {
            session_id: session.as_str().to_string(),
            turn_id: turn_id.clone(),
            tokens: token_count,
            truncated,
            timestamp: Utc::now(),
        });
        if !evicted.is_empty() {
            debug!(
                session_id = %session,
                count = evicted.len(),
                "Evicted turns from active window"
            );
            self.events.publish(DomainEvent::TurnsEvicted {
                session_id: session.as_str().to_string(),
                count: evicted.len(),
                tokens: evicted.iter().map(|t| t.token_count).sum(),
                timestamp: Utc::now(),
            });
        }

        self.write_checkpoint(session).await;

        Ok(AppendOutcome {
            turn_id,
            evicted,
            truncated,
        })
    }

    /// Restore a session's window from its checkpoint. Returns the
    /// number of turns recovered; a missing or corrupt checkpoint
    /// recovers zero and starts the window empty.
    pub async fn hydrate(&self, session: &SessionId) -> Result<usize> {
        let payload = match self.checkpoint.read(session).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return Ok(0),
            Err(e) => {
                warn!(session_id = %session, error = %e, "Checkpoint read failed, starting empty");
                return Ok(0);
            }
        };

        let parsed: WindowCheckpoint = match serde_json::from_slice(&payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(session_id = %session, error = %e, "Corrupt checkpoint ignored");
                return Ok(0);
            }
        };

        let total_tokens = parsed.turns.iter().map(|t| t.token_count).sum();
        let count = parsed.turns.len();
        let mut windows = self.windows.write().await;
        windows.insert(
            session.clone(),
            WindowState {
                turns: parsed.turns.into(),
                total_tokens,
            },
        );
        debug!(session_id = %session, turns = count, "Window hydrated from checkpoint");
        Ok(count)
    }

    /// The session's current turns, oldest first.
    pub async fn snapshot(&self, session: &SessionId) -> Vec<Turn> {
        let windows = self.windows.read().await;
        windows
            .get(session)
            .map(|w| w.turns.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Current token sum held for the session.
    pub async fn token_total(&self, session: &SessionId) -> usize {
        let windows = self.windows.read().await;
        windows.get(session).map(|w| w.total_tokens).unwrap_or(0)
    }

    async fn write_checkpoint(&self, session: &SessionId) {
        let payload = {
            let windows = self.windows.read().await;
            let turns: Vec<Turn> = windows
                .get(session)
                .map(|w| w.turns.iter().cloned().collect())
                .unwrap_or_default();
            match serde_json::to_vec(&WindowCheckpoint { turns }) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(session_id = %session, error = %e, "Checkpoint serialization failed");
                    return;
                }
            }
        };

        if let Err(e) = self.checkpoint.write(session, &payload).await {
            warn!(session_id = %session, error = %e, "Checkpoint write failed");
            self.events.publish(DomainEvent::CheckpointFailed {
                session_id: session.as_str().to_string(),
                reason: e.to_string(),
                timestamp: Utc::now(),
            });
        }
    }
}

#[async_trait::async_trait]
impl MemoryTier for ActiveWindowTier {
    fn kind(&self) -> TierKind {
        TierKind::ActiveWindow
    }

    /// O(window) — returns the full buffer chronologically. Recency is
    /// the tier's whole contract, so the query text is not consulted.
    async fn fetch(&self, query: &ContextQuery) -> Result<TierFetch> {
        let windows = self.windows.read().await;
        let items = windows
            .get(&query.session_id)
            .map(|window| {
                window
                    .turns
                    .iter()
                    .map(|turn| {
                        let text = turn.render();
                        let tokens = self.counter.count(&text);
                        ContextItem {
                            id: turn.id.clone(),
                            text,
                            tokens,
                            score: None,
                            timestamp: Some(turn.timestamp),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(TierFetch::new(
            TierKind::ActiveWindow,
            items,
            ServeSource::Local,
        ))
    }
}
