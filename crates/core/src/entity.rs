//! Entities, relationships, and user preferences — identity memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A persistent entity, upserted by (name, type).
///
/// Upserts are idempotent merges: the same (name, type) always resolves
/// to the same id, and attributes merge last-write-wins per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub last_seen: DateTime<Utc>,
}

impl Entity {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            entity_type: entity_type.into(),
            attributes: serde_json::Map::new(),
            last_seen: Utc::now(),
        }
    }
}

/// A directed relationship between two entities.
///
/// Append-only: conflicting relationships of the same (from, to, kind)
/// are all retained, versioned by `created_at`. Presentation picks the
/// latest; the rest stay for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub from_entity: String,
    pub to_entity: String,
    pub kind: String,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        from_entity: impl Into<String>,
        to_entity: impl Into<String>,
        kind: impl Into<String>,
        confidence: f32,
    ) -> Self {
        Self {
            from_entity: from_entity.into(),
            to_entity: to_entity.into(),
            kind: kind.into(),
            confidence: confidence.clamp(0.0, 1.0),
            created_at: Utc::now(),
        }
    }
}

/// A per-session user preference, last-write-wins per category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preference {
    pub category: String,
    pub value: String,
    pub confidence: f32,
    pub updated_at: DateTime<Utc>,
}

/// The result of a bounded traversal: entities reached from the query's
/// seed entities plus the relationships between them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subgraph {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

impl Subgraph {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }

    /// Relationships de-duplicated for presentation: one per
    /// (from, to, kind), the one with the latest `created_at` winning.
    /// Ordering is deterministic (by from, to, kind).
    pub fn latest_relationships(&self) -> Vec<&Relationship> {
        let mut latest: HashMap<(&str, &str, &str), &Relationship> = HashMap::new();
        for rel in &self.relationships {
            let key = (
                rel.from_entity.as_str(),
                rel.to_entity.as_str(),
                rel.kind.as_str(),
            );
            match latest.get(&key) {
                Some(existing) if existing.created_at >= rel.created_at => {}
                _ => {
                    latest.insert(key, rel);
                }
            }
        }
        let mut rels: Vec<&Relationship> = latest.into_values().collect();
        rels.sort_by(|a, b| {
            (&a.from_entity, &a.to_entity, &a.kind)
                .cmp(&(&b.from_entity, &b.to_entity, &b.kind))
        });
        rels
    }
}
