//! The four memory tiers.
//!
//! Each tier implements [`strata_core::MemoryTier`] and owns one kind
//! of memory:
//!
//! - [`ActiveWindowTier`] — verbatim recent turns, FIFO-evicted under a
//!   token cap, checkpointed after every mutation.
//! - [`CompressionTier`] — evicted turns compressed into summaries at
//!   increasing density as history ages, with an at-least-once retry
//!   queue so provider outages lose quality, never data.
//! - [`RetrievalTier`] — hybrid dense/sparse search over ingested
//!   documents with a self-correcting reflection loop.
//! - [`EntityGraphTier`] — persistent entities, relationships, and
//!   preferences, fed by asynchronous extraction.
//!
//! Tiers never call each other; the engine wires the eviction stream
//! from the active window into the compression tier and fans queries
//! out to all four.

pub mod active;
pub mod compression;
pub mod entity;
pub mod extraction;
pub mod reflection;
pub mod retrieval;

pub use active::{ActiveWindowTier, AppendOutcome};
pub use compression::CompressionTier;
pub use entity::EntityGraphTier;
pub use extraction::{ExtractionProposal, ProposedEntity, ProposedRelationship};
pub use retrieval::RetrievalTier;
