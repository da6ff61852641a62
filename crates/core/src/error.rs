//! Error taxonomy for the engine.
//!
//! Each bounded context gets its own error enum; the top-level [`Error`]
//! aggregates them. The propagation policy is deliberately asymmetric:
//!
//! - Backend failures ([`StoreError::Unavailable`]) are recovered at the
//!   tier boundary via fallback and never surface to the caller.
//! - Per-tier degradation is reported as response metadata, not an error.
//! - Budget violations ([`BudgetError`]) are hard errors: the engine
//!   never silently truncates below a configured floor.
//! - Extraction failures are logged and skipped, never propagated.

use thiserror::Error;

/// Top-level error type for the engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("budget error: {0}")]
    Budget(#[from] BudgetError),

    #[error("extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("configuration error: {0}")]
    Config(String),

    /// Every tier in a single `generate_context` call failed or timed
    /// out. Single-tier failures degrade; this is the only wholesale one.
    #[error("all memory tiers failed for this request")]
    AllTiersDegraded,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from embedding / completion providers.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("provider timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The provider answered, but not in the shape we asked for
    /// (malformed JSON, missing fields, wrong schema).
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("unsupported input: {0}")]
    Unsupported(String),
}

/// Errors from storage backends (vector index, graph service,
/// checkpoint store).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection failure, timeout, or open circuit. Triggers fallback.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend request failed: {0}")]
    RequestFailed(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("migration failed: {0}")]
    Migration(String),
}

/// Budget allocation failures. These indicate a caller or programming
/// error, not a runtime condition to recover from.
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("budget {budget} cannot honor floors (system {system_floor} + active window {active_floor})")]
    FloorExceedsBudget {
        budget: usize,
        system_floor: usize,
        active_floor: usize,
    },

    #[error("allocation sum {allocated} exceeds budget {budget}")]
    AllocationOverflow { allocated: usize, budget: usize },

    #[error("budget must be non-zero")]
    ZeroBudget,
}

/// Entity/relationship extraction failures. Logged and skipped by
/// contract; carried as a type so the extraction path stays honest.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction provider call failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("proposal failed schema validation: {0}")]
    Schema(String),
}

/// Convenience result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = Error::from(ProviderError::RateLimited {
            retry_after_secs: 5,
        });
        assert!(e.to_string().contains("retry after 5s"));

        let e = Error::from(StoreError::Unavailable("connection refused".into()));
        assert!(e.to_string().contains("connection refused"));
    }

    #[test]
    fn budget_floor_message_names_both_floors() {
        let e = BudgetError::FloorExceedsBudget {
            budget: 100,
            system_floor: 200,
            active_floor: 512,
        };
        let msg = e.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains("200"));
        assert!(msg.contains("512"));
    }

    #[test]
    fn extraction_error_wraps_provider() {
        let e = ExtractionError::from(ProviderError::Unavailable("down".into()));
        assert!(matches!(e, ExtractionError::Provider(_)));
    }
}
