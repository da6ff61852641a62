//! Storage backends for the Strata context engine.
//!
//! Three storage concerns live here, each behind a trait so tiers can
//! swap a remote service for an in-process implementation:
//!
//! - [`VectorIndex`] — embedding storage and similarity search for the
//!   retrieval tier. [`HttpVectorIndex`] talks to an external service;
//!   [`InMemoryVectorIndex`] is the in-process fallback and test double.
//! - [`GraphStore`] — entity and relationship storage with bounded
//!   traversal for the entity graph tier.
//! - [`CheckpointStore`] — durable persistence for active window state,
//!   file-backed or SQLite-backed.
//!
//! [`CircuitBreaker`] wraps the remote backends so repeated failures
//! stop hitting a dead service and recovery is probed after a cooldown.

pub mod breaker;
pub mod checkpoint;
pub mod graph;
pub mod index;
pub mod scoring;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use breaker::{BreakerState, CircuitBreaker};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, NoopCheckpointStore};
pub use graph::{GraphStore, HttpGraphStore, InMemoryGraph};
pub use index::{HttpVectorIndex, InMemoryVectorIndex, ScoredId, VectorIndex, VectorPoint};
pub use scoring::{cosine_similarity, keyword_score, weighted_fusion};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCheckpointStore;
