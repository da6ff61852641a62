//! # Strata Core
//!
//! Domain types, traits, and error definitions for the Strata context
//! memory engine. This crate has **zero framework dependencies** — it
//! defines the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (providers, index/graph/checkpoint
//! backends) and every memory tier is defined as a trait here.
//! Implementations live in their respective crates. This enables:
//! - Swapping backends via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod chunk;
pub mod entity;
pub mod error;
pub mod event;
pub mod provider;
pub mod retrieval;
pub mod session;
pub mod summary;
pub mod tier;
pub mod token;
pub mod turn;

// Re-export key types at crate root for ergonomics
pub use chunk::{Chunk, DocumentInput, Modality};
pub use entity::{Entity, Preference, Relationship, Subgraph};
pub use error::{
    BudgetError, Error, ExtractionError, ProviderError, Result, StoreError,
};
pub use event::{DomainEvent, EventBus};
pub use provider::{
    CompletionProvider, CompletionRequest, CompletionResponse, EmbeddingInput,
    EmbeddingProvider, Usage,
};
pub use retrieval::{ReflectionOutcome, RetrievalResult, ServeSource};
pub use session::SessionId;
pub use summary::{Summary, SummaryDensity};
pub use tier::{ContextItem, ContextQuery, MemoryTier, TierFetch, TierKind};
pub use token::{ModelProfile, TokenCounter, terms};
pub use turn::{Turn, TurnRole};
