//! Configuration loading and validation for Strata.
//!
//! Loads configuration from `~/.strata/config.toml` with environment
//! variable overrides. Every field has a default so a partial (or
//! missing) file works. Validates all settings at load.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strata_core::ModelProfile;

/// Scope of a shared tier's content within one deployment.
///
/// Retrieval and entity-graph content is either visible to every
/// session or partitioned per session — exactly one, chosen here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Global,
    Session,
}

/// The root configuration structure.
///
/// Maps directly to `~/.strata/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub window: WindowConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub entity: EntityConfig,

    #[serde(default)]
    pub stores: StoresConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("model", &self.model)
            .field("budget", &self.budget)
            .field("window", &self.window)
            .field("compression", &self.compression)
            .field("retrieval", &self.retrieval)
            .field("entity", &self.entity)
            .field("stores", &self.stores)
            .field("breaker", &self.breaker)
            .field("timeouts", &self.timeouts)
            .field("cache", &self.cache)
            .field("providers", &self.providers)
            .finish()
    }
}

/// Target-model settings shared by every tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub profile: ModelProfile,

    #[serde(default = "default_completion_model")]
    pub completion_model: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

fn default_completion_model() -> String {
    "gpt-4o-mini".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            profile: ModelProfile::default(),
            completion_model: default_completion_model(),
            embedding_model: default_embedding_model(),
        }
    }
}

/// Budget weights and floors.
///
/// Weights are relative priorities normalized per request; the default
/// ordering is recency > identity > history > knowledge. Floors are
/// absolute token minimums that are never truncated away.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_active_weight")]
    pub active_weight: f32,

    #[serde(default = "default_entity_weight")]
    pub entity_weight: f32,

    #[serde(default = "default_compression_weight")]
    pub compression_weight: f32,

    #[serde(default = "default_retrieval_weight")]
    pub retrieval_weight: f32,

    /// Tokens reserved for the system preamble before tier allocation.
    #[serde(default = "default_system_floor")]
    pub system_floor_tokens: usize,

    /// Minimum allocation for the active window.
    #[serde(default = "default_active_floor")]
    pub active_floor_tokens: usize,

    /// Nudge weights by query shape (history phrases, question words,
    /// entity mentions) before normalizing.
    #[serde(default = "default_true")]
    pub adaptive: bool,
}

fn default_active_weight() -> f32 {
    0.40
}
fn default_entity_weight() -> f32 {
    0.25
}
fn default_compression_weight() -> f32 {
    0.20
}
fn default_retrieval_weight() -> f32 {
    0.15
}
fn default_system_floor() -> usize {
    200
}
fn default_active_floor() -> usize {
    512
}
fn default_true() -> bool {
    true
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            active_weight: default_active_weight(),
            entity_weight: default_entity_weight(),
            compression_weight: default_compression_weight(),
            retrieval_weight: default_retrieval_weight(),
            system_floor_tokens: default_system_floor(),
            active_floor_tokens: default_active_floor(),
            adaptive: true,
        }
    }
}

/// Active-window sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Maximum token sum held in one session's window.
    #[serde(default = "default_window_tokens")]
    pub max_tokens: usize,
}

fn default_window_tokens() -> usize {
    8192
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_window_tokens(),
        }
    }
}

/// Compression densities, merge thresholds, and retry backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Evicted turns per fine-summary batch.
    #[serde(default = "default_fine_batch_turns")]
    pub fine_batch_turns: usize,

    /// Fine summaries per session before the oldest merge into medium.
    #[serde(default = "default_fine_merge_threshold")]
    pub fine_merge_threshold: usize,

    /// Medium summaries per session before the oldest merge into coarse.
    #[serde(default = "default_medium_merge_threshold")]
    pub medium_merge_threshold: usize,

    /// Summaries merged per re-compression.
    #[serde(default = "default_merge_batch")]
    pub merge_batch: usize,

    #[serde(default = "default_fine_target_tokens")]
    pub fine_target_tokens: usize,

    #[serde(default = "default_medium_target_tokens")]
    pub medium_target_tokens: usize,

    #[serde(default = "default_coarse_target_tokens")]
    pub coarse_target_tokens: usize,

    /// Stored summaries per session; lowest (importance, age) evicted
    /// beyond this.
    #[serde(default = "default_max_summaries")]
    pub max_summaries_per_session: usize,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_fine_batch_turns() -> usize {
    6
}
fn default_fine_merge_threshold() -> usize {
    8
}
fn default_medium_merge_threshold() -> usize {
    6
}
fn default_merge_batch() -> usize {
    4
}
fn default_fine_target_tokens() -> usize {
    128
}
fn default_medium_target_tokens() -> usize {
    384
}
fn default_coarse_target_tokens() -> usize {
    1024
}
fn default_max_summaries() -> usize {
    256
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    60_000
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            fine_batch_turns: default_fine_batch_turns(),
            fine_merge_threshold: default_fine_merge_threshold(),
            medium_merge_threshold: default_medium_merge_threshold(),
            merge_batch: default_merge_batch(),
            fine_target_tokens: default_fine_target_tokens(),
            medium_target_tokens: default_medium_target_tokens(),
            coarse_target_tokens: default_coarse_target_tokens(),
            max_summaries_per_session: default_max_summaries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Hybrid search and reflection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Final result count per fetch.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Candidates pulled per pass before fusion and reranking.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,

    #[serde(default = "default_dense_weight")]
    pub dense_weight: f32,

    #[serde(default = "default_sparse_weight")]
    pub sparse_weight: f32,

    #[serde(default = "default_rerank_fused_weight")]
    pub rerank_fused_weight: f32,

    #[serde(default = "default_rerank_overlap_weight")]
    pub rerank_overlap_weight: f32,

    #[serde(default)]
    pub scope: Scope,

    #[serde(default)]
    pub reflection: ReflectionConfig,
}

fn default_top_k() -> usize {
    5
}
fn default_candidate_k() -> usize {
    20
}
fn default_dense_weight() -> f32 {
    0.7
}
fn default_sparse_weight() -> f32 {
    0.3
}
fn default_rerank_fused_weight() -> f32 {
    0.7
}
fn default_rerank_overlap_weight() -> f32 {
    0.3
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_k: default_candidate_k(),
            dense_weight: default_dense_weight(),
            sparse_weight: default_sparse_weight(),
            rerank_fused_weight: default_rerank_fused_weight(),
            rerank_overlap_weight: default_rerank_overlap_weight(),
            scope: Scope::default(),
            reflection: ReflectionConfig::default(),
        }
    }
}

/// How retrieval confidence is judged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeMode {
    /// Score-distribution + term-coverage heuristic. Deterministic,
    /// offline.
    #[default]
    Heuristic,
    /// One completion call; falls back to the heuristic on failure.
    Llm,
}

/// The self-correcting reflection loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Confidence below this fires one expansion round.
    #[serde(default = "default_reflection_threshold")]
    pub threshold: f32,

    /// Hard cap on expansion queries per top-level fetch.
    #[serde(default = "default_max_expansions")]
    pub max_expansions: usize,

    #[serde(default)]
    pub judge: JudgeMode,
}

fn default_reflection_threshold() -> f32 {
    0.7
}
fn default_max_expansions() -> usize {
    3
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_reflection_threshold(),
            max_expansions: default_max_expansions(),
            judge: JudgeMode::default(),
        }
    }
}

/// Entity-graph tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    /// Extraction proposals below this confidence are discarded.
    #[serde(default = "default_entity_confidence")]
    pub confidence_threshold: f32,

    /// Traversal depth from query-matched seed entities.
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,

    /// Entity cap on a single traversal result.
    #[serde(default = "default_max_entities")]
    pub max_entities: usize,

    #[serde(default)]
    pub scope: Scope,

    #[serde(default = "default_true")]
    pub extraction_enabled: bool,
}

fn default_entity_confidence() -> f32 {
    0.5
}
fn default_max_hops() -> usize {
    2
}
fn default_max_entities() -> usize {
    16
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_entity_confidence(),
            max_hops: default_max_hops(),
            max_entities: default_max_entities(),
            scope: Scope::default(),
            extraction_enabled: true,
        }
    }
}

/// Backend selection for the three stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoresConfig {
    #[serde(default)]
    pub vector: VectorStoreConfig,

    #[serde(default)]
    pub graph: GraphStoreConfig,

    #[serde(default)]
    pub checkpoint: CheckpointStoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    /// "memory" (in-process only) or "http" (external index with
    /// in-process fallback).
    #[serde(default = "default_memory_backend")]
    pub backend: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_collection")]
    pub collection: String,
}

fn default_memory_backend() -> String {
    "memory".into()
}
fn default_collection() -> String {
    "strata".into()
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            url: None,
            collection: default_collection(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStoreConfig {
    /// "memory" or "http".
    #[serde(default = "default_memory_backend")]
    pub backend: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Default for GraphStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointStoreConfig {
    /// "none", "file", or "sqlite".
    #[serde(default = "default_checkpoint_backend")]
    pub backend: String,

    /// Directory (file backend) or database path (sqlite backend).
    /// Defaults under `~/.strata/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_checkpoint_backend() -> String {
    "none".into()
}

impl Default for CheckpointStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_checkpoint_backend(),
            path: None,
        }
    }
}

/// Circuit-breaker policy for primary backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the circuit stays open before a half-open probe.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown_secs() -> u64 {
    30
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Per-tier fetch timeouts, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_active_timeout_ms")]
    pub active_ms: u64,

    #[serde(default = "default_compression_timeout_ms")]
    pub compression_ms: u64,

    #[serde(default = "default_retrieval_timeout_ms")]
    pub retrieval_ms: u64,

    #[serde(default = "default_entity_timeout_ms")]
    pub entity_ms: u64,
}

fn default_active_timeout_ms() -> u64 {
    250
}
fn default_compression_timeout_ms() -> u64 {
    500
}
fn default_retrieval_timeout_ms() -> u64 {
    2500
}
fn default_entity_timeout_ms() -> u64 {
    1500
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            active_ms: default_active_timeout_ms(),
            compression_ms: default_compression_timeout_ms(),
            retrieval_ms: default_retrieval_timeout_ms(),
            entity_ms: default_entity_timeout_ms(),
        }
    }
}

/// Semantic context cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cosine similarity at or above this counts as a hit.
    #[serde(default = "default_cache_threshold")]
    pub similarity_threshold: f32,

    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

fn default_cache_threshold() -> f32 {
    0.95
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_cache_capacity() -> usize {
    128
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: default_cache_threshold(),
            ttl_secs: default_cache_ttl_secs(),
            capacity: default_cache_capacity(),
        }
    }
}

/// Which provider implementations to build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub completion: ProviderEndpointConfig,

    #[serde(default)]
    pub embedding: ProviderEndpointConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderEndpointConfig {
    /// "local" (deterministic, offline) or "http" (OpenAI-compatible).
    #[serde(default = "default_provider_kind")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_provider_kind() -> String {
    "local".into()
}

impl Default for ProviderEndpointConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            base_url: None,
            api_key: None,
        }
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ProviderEndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEndpointConfig")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .finish()
    }
}

impl EngineConfig {
    /// Load configuration from the default path (~/.strata/config.toml).
    ///
    /// Also checks environment variables:
    /// - `STRATA_API_KEY` (used for both providers when set)
    /// - `OPENAI_API_KEY` (fallback)
    /// - `STRATA_COMPLETION_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        // Environment variable overrides (highest priority)
        let env_key = std::env::var("STRATA_API_KEY")
            .ok()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        if let Some(key) = env_key {
            if config.providers.completion.api_key.is_none() {
                config.providers.completion.api_key = Some(key.clone());
            }
            if config.providers.embedding.api_key.is_none() {
                config.providers.embedding.api_key = Some(key);
            }
        }

        if let Ok(model) = std::env::var("STRATA_COMPLETION_MODEL") {
            config.model.completion_model = model;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".strata")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.budget;
        for (name, w) in [
            ("active_weight", b.active_weight),
            ("entity_weight", b.entity_weight),
            ("compression_weight", b.compression_weight),
            ("retrieval_weight", b.retrieval_weight),
        ] {
            if w < 0.0 || !w.is_finite() {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be a non-negative finite number"
                )));
            }
        }
        let weight_sum =
            b.active_weight + b.entity_weight + b.compression_weight + b.retrieval_weight;
        if weight_sum <= 0.0 {
            return Err(ConfigError::ValidationError(
                "budget weights must sum to > 0".into(),
            ));
        }

        if self.window.max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "window.max_tokens must be > 0".into(),
            ));
        }

        if self.retrieval.top_k == 0 || self.retrieval.candidate_k < self.retrieval.top_k {
            return Err(ConfigError::ValidationError(
                "retrieval.top_k must be > 0 and <= candidate_k".into(),
            ));
        }
        if self.retrieval.dense_weight + self.retrieval.sparse_weight <= 0.0 {
            return Err(ConfigError::ValidationError(
                "dense_weight + sparse_weight must be > 0".into(),
            ));
        }

        for (name, t) in [
            ("retrieval.reflection.threshold", self.retrieval.reflection.threshold),
            ("entity.confidence_threshold", self.entity.confidence_threshold),
            ("cache.similarity_threshold", self.cache.similarity_threshold),
        ] {
            if !(0.0..=1.0).contains(&t) {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be within [0, 1]"
                )));
            }
        }

        if self.compression.merge_batch < 2 {
            return Err(ConfigError::ValidationError(
                "compression.merge_batch must be >= 2".into(),
            ));
        }
        if self.compression.fine_batch_turns == 0 {
            return Err(ConfigError::ValidationError(
                "compression.fine_batch_turns must be > 0".into(),
            ));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "breaker.failure_threshold must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            budget: BudgetConfig::default(),
            window: WindowConfig::default(),
            compression: CompressionConfig::default(),
            retrieval: RetrievalConfig::default(),
            entity: EntityConfig::default(),
            stores: StoresConfig::default(),
            breaker: BreakerConfig::default(),
            timeouts: TimeoutConfig::default(),
            cache: CacheConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
