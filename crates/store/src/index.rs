//! Vector index backends for the retrieval tier.
//!
//! [`HttpVectorIndex`] is the primary: a remote similarity-search
//! service addressed per collection. [`InMemoryVectorIndex`] is the
//! in-process fallback that the tier keeps warm by mirroring every
//! upsert, so a primary outage degrades recall quality, not liveness.

use crate::scoring::cosine_similarity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strata_core::error::StoreError;
use strata_core::session::SessionId;
use tokio::sync::RwLock;
use tracing::debug;

/// A stored embedding with its owning session.
///
/// `session_id: None` marks shared corpus content visible to every
/// session; `Some` scopes the point to one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// A search hit: chunk id plus raw similarity score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredId {
    pub id: String,
    pub score: f32,
}

/// Embedding storage with similarity search.
///
/// `search` with `session: Some(s)` returns shared points and points
/// owned by `s`; `session: None` searches the whole collection.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Backend name for logs and response metadata.
    fn name(&self) -> &str;

    /// Insert or replace points by id.
    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), StoreError>;

    /// Top `limit` points by similarity to `query`, best first.
    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        session: Option<&SessionId>,
    ) -> Result<Vec<ScoredId>, StoreError>;

    /// Number of stored points.
    async fn count(&self) -> Result<usize, StoreError>;
}

// ── In-memory index ──────────────────────────────────────────────────

/// Exhaustive-scan index over a shared point map.
///
/// Serves as the retrieval fallback and as the test backend. Scan cost
/// is linear, which is fine for the corpus sizes a single process
/// holds; the primary index owns scale.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    points: Arc<RwLock<HashMap<String, VectorPoint>>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), StoreError> {
        let mut store = self.points.write().await;
        for point in points {
            store.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        session: Option<&SessionId>,
    ) -> Result<Vec<ScoredId>, StoreError> {
        let store = self.points.read().await;

        let mut hits: Vec<ScoredId> = store
            .values()
            .filter(|point| match (session, &point.session_id) {
                (Some(s), Some(owner)) => owner == s.as_str(),
                (Some(_), None) => true,
                (None, _) => true,
            })
            .map(|point| ScoredId {
                id: point.id.clone(),
                score: cosine_similarity(query, &point.vector),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.points.read().await.len())
    }
}

// ── HTTP index ───────────────────────────────────────────────────────

/// Client for a remote vector search service.
pub struct HttpVectorIndex {
    base_url: String,
    collection: String,
    client: reqwest::Client,
}

impl HttpVectorIndex {
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client,
        }
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!(
            "{}/collections/{}/{suffix}",
            self.base_url, self.collection
        )
    }
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
    fn name(&self) -> &str {
        "http"
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), StoreError> {
        debug!(count = points.len(), collection = %self.collection, "Upserting vector points");
        let response = self
            .client
            .post(self.endpoint("points"))
            .json(&UpsertRequest { points })
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(response).await?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        session: Option<&SessionId>,
    ) -> Result<Vec<ScoredId>, StoreError> {
        let request = SearchRequest {
            vector: query.to_vec(),
            limit,
            session_id: session.map(|s| s.as_str().to_string()),
        };
        let response = self
            .client
            .post(self.endpoint("search"))
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status(response).await?;

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Serialization(format!("search response: {e}")))?;
        Ok(parsed.results)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let response = self
            .client
            .get(self.endpoint("count"))
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status(response).await?;

        let parsed: CountResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Serialization(format!("count response: {e}")))?;
        Ok(parsed.count)
    }
}

/// Map connection-level failures to [`StoreError::Unavailable`] so the
/// circuit breaker and fallback path see them as backend outages.
pub(crate) fn map_transport_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() || e.is_connect() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::RequestFailed(e.to_string())
    }
}

pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    if status.is_server_error() {
        Err(StoreError::Unavailable(format!("HTTP {status}: {snippet}")))
    } else {
        Err(StoreError::RequestFailed(format!(
            "HTTP {status}: {snippet}"
        )))
    }
}

// ── Wire format ──────────────────────────────────────────────────────

#[derive(Serialize)]
struct UpsertRequest {
    points: Vec<VectorPoint>,
}

#[derive(Serialize)]
struct SearchRequest {
    vector: Vec<f32>,
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct SearchResponse {
    results: Vec<ScoredId>,
}

#[derive(Deserialize)]
struct CountResponse {
    count: usize,
}
