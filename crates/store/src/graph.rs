//! Entity graph backends.
//!
//! Entities are upserted by `(name, type)` with last-write-wins
//! attribute merges; relationships are append-only versions. The store
//! only answers structural queries (seed matching, bounded traversal).
//! Presentation rules like latest-relationship-wins live on
//! [`Subgraph`] in the core crate.

use crate::index::{check_status, map_transport_error};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use strata_core::entity::{Entity, Relationship, Subgraph};
use strata_core::error::StoreError;
use strata_core::session::SessionId;
use strata_core::token::terms;
use tokio::sync::RwLock;
use tracing::debug;

/// Entity and relationship storage with bounded traversal.
///
/// Scoping mirrors the vector index: entities stored without a session
/// are shared, and queries with `session: Some(s)` see shared entities
/// plus those owned by `s`. Upserts only merge within the same scope,
/// so a session can never mutate shared state.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Backend name for logs and response metadata.
    fn name(&self) -> &str;

    /// Insert or merge an entity by `(name, type)`, returning its id.
    ///
    /// The match is case-insensitive; attributes merge per key with the
    /// incoming value winning.
    async fn upsert_entity(
        &self,
        name: &str,
        entity_type: &str,
        attributes: serde_json::Map<String, serde_json::Value>,
        session: Option<&SessionId>,
    ) -> Result<String, StoreError>;

    /// Append one relationship version. Never overwrites: conflicting
    /// statements about the same `(from, to, kind)` all persist.
    async fn add_relationship(&self, rel: Relationship) -> Result<(), StoreError>;

    /// Ids of entities whose names share a term with the query.
    async fn find_entities(
        &self,
        query_terms: &[String],
        session: Option<&SessionId>,
    ) -> Result<Vec<String>, StoreError>;

    /// Id of the entity with this exact name (case-insensitive), any
    /// type. With several types under one name, the earliest-created
    /// wins. Ids are backend-local, so relationship endpoints must be
    /// resolved per store through this lookup.
    async fn find_by_name(
        &self,
        name: &str,
        session: Option<&SessionId>,
    ) -> Result<Option<String>, StoreError>;

    /// Breadth-first expansion from `seeds`, stopping at `max_hops`
    /// hops or `max_entities` entities, whichever comes first. The
    /// subgraph carries every stored relationship version between the
    /// included entities.
    async fn traverse(
        &self,
        seeds: &[String],
        max_hops: usize,
        max_entities: usize,
        session: Option<&SessionId>,
    ) -> Result<Subgraph, StoreError>;

    /// Number of visible entities.
    async fn count(&self, session: Option<&SessionId>) -> Result<usize, StoreError>;
}

// ── In-memory graph ──────────────────────────────────────────────────

struct StoredEntity {
    entity: Entity,
    session: Option<String>,
}

impl StoredEntity {
    fn visible_to(&self, session: Option<&SessionId>) -> bool {
        match (&self.session, session) {
            (None, _) => true,
            (Some(owner), Some(s)) => owner == s.as_str(),
            (Some(_), None) => true,
        }
    }
}

#[derive(Default)]
struct GraphInner {
    entities: Vec<StoredEntity>,
    by_id: HashMap<String, usize>,
    // (scope, lowercased name, lowercased type) → entity slot
    by_key: HashMap<(String, String, String), usize>,
    edges: Vec<Relationship>,
    adjacency: HashMap<String, Vec<usize>>,
}

fn scope_key(session: Option<&SessionId>) -> String {
    session.map(|s| s.as_str().to_string()).unwrap_or_default()
}

/// Adjacency-list graph guarded by one `RwLock`.
///
/// The fallback and test backend. Traversals clone the entities they
/// return, so readers never hold the lock across tier work.
#[derive(Default)]
pub struct InMemoryGraph {
    inner: Arc<RwLock<GraphInner>>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored relationship versions, across all scopes.
    pub async fn relationship_count(&self) -> usize {
        self.inner.read().await.edges.len()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraph {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn upsert_entity(
        &self,
        name: &str,
        entity_type: &str,
        attributes: serde_json::Map<String, serde_json::Value>,
        session: Option<&SessionId>,
    ) -> Result<String, StoreError> {
        let key = (
            scope_key(session),
            name.to_lowercase(),
            entity_type.to_lowercase(),
        );
        let mut inner = self.inner.write().await;

        if let Some(&slot) = inner.by_key.get(&key) {
            let stored = &mut inner.entities[slot];
            for (attr, value) in attributes {
                stored.entity.attributes.insert(attr, value);
            }
            stored.entity.last_seen = Utc::now();
            return Ok(stored.entity.id.clone());
        }

        let mut entity = Entity::new(name, entity_type);
        entity.attributes = attributes;
        let id = entity.id.clone();

        let slot = inner.entities.len();
        inner.entities.push(StoredEntity {
            entity,
            session: session.map(|s| s.as_str().to_string()),
        });
        inner.by_id.insert(id.clone(), slot);
        inner.by_key.insert(key, slot);
        debug!(entity_id = %id, name, entity_type, "Created entity");
        Ok(id)
    }

    async fn add_relationship(&self, rel: Relationship) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let edge_idx = inner.edges.len();
        inner
            .adjacency
            .entry(rel.from_entity.clone())
            .or_default()
            .push(edge_idx);
        if rel.to_entity != rel.from_entity {
            inner
                .adjacency
                .entry(rel.to_entity.clone())
                .or_default()
                .push(edge_idx);
        }
        inner.edges.push(rel);
        Ok(())
    }

    async fn find_entities(
        &self,
        query_terms: &[String],
        session: Option<&SessionId>,
    ) -> Result<Vec<String>, StoreError> {
        if query_terms.is_empty() {
            return Ok(vec![]);
        }
        let wanted: HashSet<&str> = query_terms.iter().map(String::as_str).collect();
        let inner = self.inner.read().await;

        let ids = inner
            .entities
            .iter()
            .filter(|stored| stored.visible_to(session))
            .filter(|stored| {
                terms(&stored.entity.name)
                    .iter()
                    .any(|t| wanted.contains(t.as_str()))
            })
            .map(|stored| stored.entity.id.clone())
            .collect();
        Ok(ids)
    }

    async fn find_by_name(
        &self,
        name: &str,
        session: Option<&SessionId>,
    ) -> Result<Option<String>, StoreError> {
        let wanted = name.to_lowercase();
        let inner = self.inner.read().await;
        // Entities are stored in creation order, so the first hit is
        // the earliest-created one.
        Ok(inner
            .entities
            .iter()
            .filter(|stored| stored.visible_to(session))
            .find(|stored| stored.entity.name.to_lowercase() == wanted)
            .map(|stored| stored.entity.id.clone()))
    }

    async fn traverse(
        &self,
        seeds: &[String],
        max_hops: usize,
        max_entities: usize,
        session: Option<&SessionId>,
    ) -> Result<Subgraph, StoreError> {
        if max_entities == 0 {
            return Ok(Subgraph::default());
        }
        let inner = self.inner.read().await;

        let visible = |id: &str| {
            inner
                .by_id
                .get(id)
                .map(|&slot| inner.entities[slot].visible_to(session))
                .unwrap_or(false)
        };

        // First-seen order keeps traversal output deterministic.
        let mut included: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut frontier: Vec<String> = Vec::new();

        'fill: {
            for id in seeds {
                if visible(id) && seen.insert(id.clone()) {
                    included.push(id.clone());
                    frontier.push(id.clone());
                    if included.len() >= max_entities {
                        break 'fill;
                    }
                }
            }

            for _ in 0..max_hops {
                let mut next = Vec::new();
                for id in &frontier {
                    for &edge_idx in inner.adjacency.get(id).into_iter().flatten() {
                        let edge = &inner.edges[edge_idx];
                        let other = if edge.from_entity == *id {
                            &edge.to_entity
                        } else {
                            &edge.from_entity
                        };
                        if visible(other) && seen.insert(other.clone()) {
                            included.push(other.clone());
                            next.push(other.clone());
                            if included.len() >= max_entities {
                                break 'fill;
                            }
                        }
                    }
                }
                if next.is_empty() {
                    break;
                }
                frontier = next;
            }
        }

        let entities: Vec<Entity> = included
            .iter()
            .filter_map(|id| inner.by_id.get(id))
            .map(|&slot| inner.entities[slot].entity.clone())
            .collect();
        let relationships: Vec<Relationship> = inner
            .edges
            .iter()
            .filter(|e| seen.contains(&e.from_entity) && seen.contains(&e.to_entity))
            .cloned()
            .collect();

        Ok(Subgraph {
            entities,
            relationships,
        })
    }

    async fn count(&self, session: Option<&SessionId>) -> Result<usize, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .entities
            .iter()
            .filter(|stored| stored.visible_to(session))
            .count())
    }
}

// ── HTTP graph ───────────────────────────────────────────────────────

/// Client for a remote graph service.
pub struct HttpGraphStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGraphStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!("{}/{suffix}", self.base_url)
    }

    async fn post_json<Req, Resp>(&self, suffix: &str, body: &Req) -> Result<Resp, StoreError>
    where
        Req: Serialize + Sync,
        Resp: for<'de> Deserialize<'de>,
    {
        let response = self
            .client
            .post(self.endpoint(suffix))
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| StoreError::Serialization(format!("{suffix} response: {e}")))
    }
}

#[async_trait]
impl GraphStore for HttpGraphStore {
    fn name(&self) -> &str {
        "http"
    }

    async fn upsert_entity(
        &self,
        name: &str,
        entity_type: &str,
        attributes: serde_json::Map<String, serde_json::Value>,
        session: Option<&SessionId>,
    ) -> Result<String, StoreError> {
        let request = UpsertEntityRequest {
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            attributes,
            session_id: session.map(|s| s.as_str().to_string()),
        };
        let parsed: UpsertEntityResponse = self.post_json("entities", &request).await?;
        Ok(parsed.id)
    }

    async fn add_relationship(&self, rel: Relationship) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.endpoint("relationships"))
            .json(&rel)
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(response).await?;
        Ok(())
    }

    async fn find_entities(
        &self,
        query_terms: &[String],
        session: Option<&SessionId>,
    ) -> Result<Vec<String>, StoreError> {
        let request = FindEntitiesRequest {
            terms: query_terms.to_vec(),
            session_id: session.map(|s| s.as_str().to_string()),
        };
        let parsed: FindEntitiesResponse = self.post_json("entities/match", &request).await?;
        Ok(parsed.ids)
    }

    async fn find_by_name(
        &self,
        name: &str,
        session: Option<&SessionId>,
    ) -> Result<Option<String>, StoreError> {
        let request = LookupRequest {
            name: name.to_string(),
            session_id: session.map(|s| s.as_str().to_string()),
        };
        let parsed: LookupResponse = self.post_json("entities/lookup", &request).await?;
        Ok(parsed.id)
    }

    async fn traverse(
        &self,
        seeds: &[String],
        max_hops: usize,
        max_entities: usize,
        session: Option<&SessionId>,
    ) -> Result<Subgraph, StoreError> {
        let request = TraverseRequest {
            seeds: seeds.to_vec(),
            max_hops,
            max_entities,
            session_id: session.map(|s| s.as_str().to_string()),
        };
        self.post_json("traverse", &request).await
    }

    async fn count(&self, session: Option<&SessionId>) -> Result<usize, StoreError> {
        let request = CountRequest {
            session_id: session.map(|s| s.as_str().to_string()),
        };
        let parsed: CountResponse = self.post_json("entities/count", &request).await?;
        Ok(parsed.count)
    }
}

// ── Wire format ──────────────────────────────────────────────────────

#[derive(Serialize)]
struct UpsertEntityRequest {
    name: String,
    entity_type: String,
    attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct UpsertEntityResponse {
    id: String,
}

#[derive(Serialize)]
struct FindEntitiesRequest {
    terms: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct FindEntitiesResponse {
    ids: Vec<String>,
}

#[derive(Serialize)]
struct LookupRequest {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Serialize)]
struct TraverseRequest {
    seeds: Vec<String>,
    max_hops: usize,
    max_entities: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

#[derive(Serialize)]
struct CountRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct CountResponse {
    count: usize,
}
