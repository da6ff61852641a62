//! The entity graph tier — who and what the conversation is about.
//!
//! Entities and relationships live in a graph store: the in-process
//! fallback is authoritative and every write is mirrored best-effort to
//! the primary behind the circuit breaker. Entity ids are backend-local,
//! so relationship endpoints are resolved by name against each store
//! separately. Extraction from turns runs as a detached task and never
//! blocks ingestion.

use crate::extraction::{ExtractionProposal, ProposedEntity, ProposedRelationship, run_extraction};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use strata_config::{EntityConfig, Scope};
use strata_core::entity::{Entity, Preference, Relationship, Subgraph};
use strata_core::error::{Result, StoreError};
use strata_core::event::{DomainEvent, EventBus};
use strata_core::provider::CompletionProvider;
use strata_core::retrieval::ServeSource;
use strata_core::session::SessionId;
use strata_core::tier::{ContextItem, ContextQuery, MemoryTier, TierFetch, TierKind};
use strata_core::token::{TokenCounter, terms};
use strata_store::breaker::CircuitBreaker;
use strata_store::graph::{GraphStore, InMemoryGraph};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Persistent identity memory: entities, relationships, preferences.
pub struct EntityGraphTier {
    config: EntityConfig,
    model: String,
    counter: TokenCounter,
    completions: Arc<dyn CompletionProvider>,
    primary: Option<Arc<dyn GraphStore>>,
    fallback: InMemoryGraph,
    breaker: Arc<CircuitBreaker>,
    /// Per-session preferences, last-write-wins per category.
    preferences: RwLock<HashMap<SessionId, BTreeMap<String, Preference>>>,
    events: Arc<EventBus>,
}

impl EntityGraphTier {
    pub fn new(
        config: EntityConfig,
        model: impl Into<String>,
        counter: TokenCounter,
        completions: Arc<dyn CompletionProvider>,
        primary: Option<Arc<dyn GraphStore>>,
        breaker: Arc<CircuitBreaker>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            model: model.into(),
            counter,
            completions,
            primary,
            fallback: InMemoryGraph::new(),
            breaker,
            preferences: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Upsert an entity by `(name, type)`. Returns the fallback store's
    /// id for it.
    pub async fn record_entity(
        &self,
        name: &str,
        entity_type: &str,
        attributes: serde_json::Map<String, serde_json::Value>,
        session: &SessionId,
    ) -> Result<String> {
        let scope = self.write_scope(session);
        let id = self
            .fallback
            .upsert_entity(name, entity_type, attributes.clone(), scope.as_ref())
            .await?;
        self.mirror_entity(name, entity_type, attributes, scope.as_ref())
            .await;
        Ok(id)
    }

    /// Append one relationship version between two named entities.
    ///
    /// Endpoints that do not exist yet are created as `unknown`-typed
    /// stubs, so a relationship can arrive before its entities do.
    pub async fn record_relationship(
        &self,
        from: &str,
        to: &str,
        kind: &str,
        confidence: f32,
        session: &SessionId,
    ) -> Result<()> {
        let scope = self.write_scope(session);

        let from_id = endpoint_id(&self.fallback, from, scope.as_ref()).await?;
        let to_id = endpoint_id(&self.fallback, to, scope.as_ref()).await?;
        self.fallback
            .add_relationship(Relationship::new(from_id, to_id, kind, confidence))
            .await?;

        self.mirror_relationship(from, to, kind, confidence, scope.as_ref())
            .await;
        Ok(())
    }

    /// Store a preference for this session, replacing any previous
    /// value in the same category.
    pub async fn remember_preference(
        &self,
        session: &SessionId,
        category: impl Into<String>,
        value: impl Into<String>,
        confidence: f32,
    ) {
        let pref = Preference {
            category: category.into(),
            value: value.into(),
            confidence: confidence.clamp(0.0, 1.0),
            updated_at: Utc::now(),
        };
        let mut prefs = self.preferences.write().await;
        prefs
            .entry(session.clone())
            .or_default()
            .insert(pref.category.clone(), pref);
    }

    /// Current preferences for a session, ordered by category.
    pub async fn session_preferences(&self, session: &SessionId) -> Vec<Preference> {
        let prefs = self.preferences.read().await;
        prefs
            .get(session)
            .map(|by_category| by_category.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of entities visible to this session.
    pub async fn entity_count(&self, session: &SessionId) -> Result<usize> {
        let scope = self.write_scope(session);
        Ok(self.fallback.count(scope.as_ref()).await?)
    }

    /// Relationship versions held in the in-process graph.
    pub async fn relationship_count(&self) -> usize {
        self.fallback.relationship_count().await
    }

    /// Write a validated proposal into the graph. Returns how many
    /// entities and relationships landed.
    pub async fn apply_proposal(
        &self,
        session: &SessionId,
        proposal: ExtractionProposal,
    ) -> (usize, usize) {
        let mut entities = 0;
        for ProposedEntity {
            name,
            entity_type,
            attributes,
            ..
        } in proposal.entities
        {
            match self
                .record_entity(&name, &entity_type, attributes, session)
                .await
            {
                Ok(_) => entities += 1,
                Err(e) => warn!(error = %e, name = %name, "Failed to record extracted entity"),
            }
        }

        let mut relationships = 0;
        for ProposedRelationship {
            from,
            to,
            kind,
            confidence,
        } in proposal.relationships
        {
            match self
                .record_relationship(&from, &to, &kind, confidence, session)
                .await
            {
                Ok(()) => relationships += 1,
                Err(e) => {
                    warn!(error = %e, from = %from, to = %to, "Failed to record extracted relationship")
                }
            }
        }
        (entities, relationships)
    }

    /// Extract entities from a turn on a detached task. This is the one
    /// fire-and-forget path in the engine; failures publish an event
    /// and are otherwise dropped.
    pub fn spawn_extraction(
        self: Arc<Self>,
        session: SessionId,
        turn_text: String,
    ) -> Option<JoinHandle<()>> {
        if !self.config.extraction_enabled {
            return None;
        }

        Some(tokio::spawn(async move {
            let outcome = run_extraction(
                self.completions.as_ref(),
                &self.model,
                &turn_text,
                self.config.confidence_threshold,
            )
            .await;

            match outcome {
                Ok(proposal) => {
                    let (entities, relationships) = self.apply_proposal(&session, proposal).await;
                    debug!(session_id = %session, entities, relationships, "Extraction applied");
                    self.events.publish(DomainEvent::ExtractionCompleted {
                        session_id: session.as_str().to_string(),
                        entities,
                        relationships,
                        timestamp: Utc::now(),
                    });
                }
                Err(e) => {
                    warn!(session_id = %session, error = %e, "Entity extraction failed, turn skipped");
                    self.events.publish(DomainEvent::ExtractionFailed {
                        session_id: session.as_str().to_string(),
                        reason: e.to_string(),
                        timestamp: Utc::now(),
                    });
                }
            }
        }))
    }

    fn write_scope(&self, session: &SessionId) -> Option<SessionId> {
        match self.config.scope {
            Scope::Session => Some(session.clone()),
            Scope::Global => None,
        }
    }

    async fn mirror_entity(
        &self,
        name: &str,
        entity_type: &str,
        attributes: serde_json::Map<String, serde_json::Value>,
        session: Option<&SessionId>,
    ) {
        let Some(primary) = &self.primary else {
            return;
        };
        if !self.breaker.allow().await {
            return;
        }
        match primary
            .upsert_entity(name, entity_type, attributes, session)
            .await
        {
            Ok(_) => self.breaker.record_success().await,
            Err(e) => {
                self.breaker.record_failure().await;
                warn!(error = %e, name = %name, "Primary graph upsert failed");
            }
        }
    }

    async fn mirror_relationship(
        &self,
        from: &str,
        to: &str,
        kind: &str,
        confidence: f32,
        session: Option<&SessionId>,
    ) {
        let Some(primary) = &self.primary else {
            return;
        };
        if !self.breaker.allow().await {
            return;
        }

        let written = async {
            let from_id = endpoint_id(primary.as_ref(), from, session).await?;
            let to_id = endpoint_id(primary.as_ref(), to, session).await?;
            primary
                .add_relationship(Relationship::new(from_id, to_id, kind, confidence))
                .await
        }
        .await;

        match written {
            Ok(()) => self.breaker.record_success().await,
            Err(e) => {
                self.breaker.record_failure().await;
                warn!(error = %e, from = %from, to = %to, "Primary graph relationship write failed");
            }
        }
    }

    /// Seed-match and traverse on the primary when healthy, otherwise
    /// on the fallback.
    async fn query_graph(
        &self,
        query_terms: &[String],
        session: Option<&SessionId>,
    ) -> (Subgraph, ServeSource, Option<String>) {
        if let Some(primary) = &self.primary {
            if self.breaker.allow().await {
                match self.graph_query(primary.as_ref(), query_terms, session).await {
                    Ok(subgraph) => {
                        self.breaker.record_success().await;
                        return (subgraph, ServeSource::Primary, None);
                    }
                    Err(e) => {
                        self.breaker.record_failure().await;
                        warn!(error = %e, "Primary graph query failed, using fallback");
                        self.events.publish(DomainEvent::BackendFallback {
                            tier: TierKind::EntityGraph,
                            reason: e.to_string(),
                            timestamp: Utc::now(),
                        });
                        return self
                            .fallback_query(query_terms, session, "primary graph unavailable")
                            .await;
                    }
                }
            }
            return self
                .fallback_query(query_terms, session, "primary circuit open")
                .await;
        }

        match self.graph_query(&self.fallback, query_terms, session).await {
            Ok(subgraph) => (subgraph, ServeSource::Local, None),
            Err(e) => (Subgraph::default(), ServeSource::Local, Some(e.to_string())),
        }
    }

    async fn fallback_query(
        &self,
        query_terms: &[String],
        session: Option<&SessionId>,
        reason: &str,
    ) -> (Subgraph, ServeSource, Option<String>) {
        match self.graph_query(&self.fallback, query_terms, session).await {
            Ok(subgraph) => (subgraph, ServeSource::Fallback, Some(reason.to_string())),
            Err(e) => (
                Subgraph::default(),
                ServeSource::Fallback,
                Some(e.to_string()),
            ),
        }
    }

    async fn graph_query(
        &self,
        store: &dyn GraphStore,
        query_terms: &[String],
        session: Option<&SessionId>,
    ) -> std::result::Result<Subgraph, StoreError> {
        let seeds = store.find_entities(query_terms, session).await?;
        if seeds.is_empty() {
            return Ok(Subgraph::default());
        }
        store
            .traverse(
                &seeds,
                self.config.max_hops,
                self.config.max_entities,
                session,
            )
            .await
    }

    fn item(&self, id: String, text: String, score: f32) -> ContextItem {
        ContextItem {
            id,
            tokens: self.counter.count(&text),
            text,
            score: Some(score),
            timestamp: None,
        }
    }
}

#[async_trait::async_trait]
impl MemoryTier for EntityGraphTier {
    fn kind(&self) -> TierKind {
        TierKind::EntityGraph
    }

    /// Preferences first, then entities in traversal order, then the
    /// latest version of each relationship.
    async fn fetch(&self, query: &ContextQuery) -> Result<TierFetch> {
        let session_filter = self.write_scope(&query.session_id);
        let query_terms = terms(&query.text);

        let (subgraph, source, degraded) = self
            .query_graph(&query_terms, session_filter.as_ref())
            .await;

        let mut items = Vec::new();

        for pref in self.session_preferences(&query.session_id).await {
            let text = format!("Preference ({}): {}", pref.category, pref.value);
            items.push(self.item(format!("pref-{}", pref.category), text, 1.0));
        }

        let names: HashMap<&str, &str> = subgraph
            .entities
            .iter()
            .map(|e| (e.id.as_str(), e.name.as_str()))
            .collect();

        for (i, entity) in subgraph.entities.iter().enumerate() {
            let score = (0.95 - 0.05 * i as f32).max(0.2);
            items.push(self.item(entity.id.clone(), render_entity(entity), score));
        }

        for rel in subgraph.latest_relationships() {
            let from = names
                .get(rel.from_entity.as_str())
                .copied()
                .unwrap_or(rel.from_entity.as_str());
            let to = names
                .get(rel.to_entity.as_str())
                .copied()
                .unwrap_or(rel.to_entity.as_str());
            let text = format!("{from} {} {to}", rel.kind);
            let id = format!("rel-{}-{}-{}", rel.from_entity, rel.kind, rel.to_entity);
            items.push(self.item(id, text, rel.confidence));
        }

        let mut fetch = TierFetch::new(TierKind::EntityGraph, items, source);
        fetch.degraded = degraded;
        Ok(fetch)
    }
}

/// Resolve a name to this store's entity id, creating a stub when the
/// entity has not been seen yet.
async fn endpoint_id(
    store: &dyn GraphStore,
    name: &str,
    session: Option<&SessionId>,
) -> std::result::Result<String, StoreError> {
    if let Some(id) = store.find_by_name(name, session).await? {
        return Ok(id);
    }
    store
        .upsert_entity(name, "unknown", serde_json::Map::new(), session)
        .await
}

fn render_entity(entity: &Entity) -> String {
    if entity.attributes.is_empty() {
        return format!("{} ({})", entity.name, entity.entity_type);
    }
    let attrs: Vec<String> = entity
        .attributes
        .iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{key}={value}")
        })
        .collect();
    format!(
        "{} ({}): {}",
        entity.name,
        entity.entity_type,
        attrs.join("; ")
    )
}
