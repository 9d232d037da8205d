//! Graph entities, typed edges and text-unit links

use super::evidence::EvidencePayload;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Entity node. `community_id` and `importance` are precomputed offline and
/// only read at query time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub name: String,
    pub entity_type: String,
    pub community_id: Option<u64>,
    /// Offline centrality score, 0.0 - 1.0
    pub importance: f32,
}

impl Entity {
    pub fn new(id: Uuid, name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            entity_type: entity_type.into(),
            community_id: None,
            importance: 0.0,
        }
    }

    pub fn with_community(mut self, community_id: u64) -> Self {
        self.community_id = Some(community_id);
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }
}

/// Edge types in the property graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Extracted semantic relationship between two entities
    Semantic,
    /// Structural containment (document → section → entity)
    Contains,
    /// Embedding similarity link
    SimilarTo,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 3] = [EdgeKind::Semantic, EdgeKind::Contains, EdgeKind::SimilarTo];

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Semantic => "semantic",
            EdgeKind::Contains => "contains",
            EdgeKind::SimilarTo => "similar_to",
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semantic" | "related_to" => Ok(EdgeKind::Semantic),
            "contains" | "part_of" => Ok(EdgeKind::Contains),
            "similar_to" | "similar" => Ok(EdgeKind::SimilarTo),
            other => Err(format!("unknown edge kind: {}", other)),
        }
    }
}

/// Directed, weighted edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: Uuid,
    pub target: Uuid,
    pub kind: EdgeKind,
    pub weight: f32,
}

/// Evidence attached to an entity via a text-unit link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextUnit {
    pub entity_id: Uuid,
    pub payload: EvidencePayload,
}
