//! Domain event system — decoupled visibility into tier activity.
//!
//! Events are published when something interesting happens (eviction,
//! fallback, reflection, extraction). Quality monitoring subscribes and
//! reacts without the engine knowing about it.

use crate::tier::TierKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A turn entered the active window
    TurnIngested {
        session_id: String,
        turn_id: String,
        tokens: usize,
        truncated: bool,
        timestamp: DateTime<Utc>,
    },

    /// The active window evicted turns to the compression tier
    TurnsEvicted {
        session_id: String,
        count: usize,
        tokens: usize,
        timestamp: DateTime<Utc>,
    },

    /// A summary was produced and stored
    SummaryWritten {
        session_id: String,
        density: String,
        source_turns: usize,
        tokens: usize,
        timestamp: DateTime<Utc>,
    },

    /// A compression batch failed and was re-queued with backoff
    CompressionRetryScheduled {
        session_id: String,
        attempt: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A tier switched from its primary backend to the fallback
    BackendFallback {
        tier: TierKind,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The reflection loop expanded a low-confidence retrieval
    ReflectionFired {
        confidence: f32,
        expansions: usize,
        timestamp: DateTime<Utc>,
    },

    /// Entity extraction finished for a turn
    ExtractionCompleted {
        session_id: String,
        entities: usize,
        relationships: usize,
        timestamp: DateTime<Utc>,
    },

    /// Entity extraction failed and was skipped
    ExtractionFailed {
        session_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A window checkpoint write failed (the in-memory state is fine)
    CheckpointFailed {
        session_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A context payload was assembled and returned
    ContextAssembled {
        session_id: String,
        total_tokens: usize,
        degraded_tiers: usize,
        cache_hit: bool,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Publishing
/// with no subscribers is fine and drops the event.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // Ignore send errors (no subscribers = that's fine)
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
