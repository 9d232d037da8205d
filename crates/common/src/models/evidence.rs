//! Evidence payloads, evidence sets and context statistics

use super::{Chunk, Entity};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Precomputed community report attached to the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub id: Uuid,
    pub community_id: u64,
    pub title: String,
    pub summary: String,
}

/// Heterogeneous evidence coming out of the graph layer.
///
/// Everything downstream of retrieval works on [`Chunk`]s only, so payloads
/// are validated and converted once at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvidencePayload {
    Chunk(Chunk),
    Entity { entity: Entity, description: String },
    Aggregate(AggregateSummary),
}

/// Why a payload was refused at the boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadRejection {
    EmptyText,
    NonFiniteScore,
}

impl fmt::Display for PayloadRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadRejection::EmptyText => f.write_str("empty text"),
            PayloadRejection::NonFiniteScore => f.write_str("non-finite score"),
        }
    }
}

impl EvidencePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EvidencePayload::Chunk(_) => "chunk",
            EvidencePayload::Entity { .. } => "entity",
            EvidencePayload::Aggregate(_) => "aggregate",
        }
    }

    /// Validate and convert into a chunk the denoiser can work on
    pub fn into_chunk(self) -> std::result::Result<Chunk, PayloadRejection> {
        let chunk = match self {
            EvidencePayload::Chunk(chunk) => chunk,
            EvidencePayload::Entity {
                entity,
                description,
            } => {
                if description.trim().is_empty() {
                    return Err(PayloadRejection::EmptyText);
                }
                Chunk::new(
                    entity.id,
                    Uuid::nil(),
                    format!("Entity: {}", entity.name),
                    format!("{}: {}", entity.name, description.trim()),
                )
            }
            EvidencePayload::Aggregate(report) => Chunk::new(
                report.id,
                Uuid::nil(),
                report.title,
                report.summary,
            ),
        };

        if chunk.text.trim().is_empty() {
            return Err(PayloadRejection::EmptyText);
        }
        if !chunk.score.is_finite() {
            return Err(PayloadRejection::NonFiniteScore);
        }
        Ok(chunk)
    }
}

/// Ordered, budget-bounded evidence handed to synthesis.
///
/// Only the denoising pipeline builds one, so ordering (score descending,
/// fetch order on ties) and the budget bound hold by construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSet {
    chunks: Vec<Chunk>,
    total_tokens: usize,
    token_budget: Option<usize>,
}

impl EvidenceSet {
    pub(crate) fn from_ordered(chunks: Vec<Chunk>, token_budget: Option<usize>) -> Self {
        let total_tokens = chunks.iter().map(|c| c.token_count).sum();
        Self {
            chunks,
            total_tokens,
            token_budget,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    /// `None` when the budget guard was disabled
    pub fn token_budget(&self) -> Option<usize> {
        self.token_budget
    }

    pub fn chunk_ids(&self) -> Vec<Uuid> {
        self.chunks.iter().map(|c| c.id).collect()
    }
}

/// Per-layer counts reported by the denoising pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextStats {
    /// Candidates entering the pipeline
    pub raw: usize,
    /// Payloads refused at the evidence boundary
    pub rejected: usize,
    /// Pool size after deduplication
    pub deduped: usize,
    /// Entries collapsed into another entry with the same hash
    pub duplicates_removed: usize,
    /// Entries whose score received at least one noise penalty
    pub penalized: usize,
    /// Entries cut by the token budget guard
    pub dropped: usize,
    /// Entries in the final evidence set
    pub final_count: usize,
    /// Tokens in the final evidence set
    pub final_tokens: usize,
}
