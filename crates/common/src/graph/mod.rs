//! Graph store access
//!
//! Provides:
//! - [`GraphStore`], the read-only contract the retrieval engine traverses
//! - [`InMemoryGraph`], an immutable arena-backed store
//! - [`PgGraphStore`], reads against the indexing collaborator's Postgres tables
//!
//! Every method takes a whole batch (a traversal frontier, a list of names)
//! and answers it in one round trip. Implementations never write.

mod memory;
mod postgres;

pub use memory::{GraphBuilder, InMemoryGraph};
pub use postgres::{GraphDbPool, PgGraphStore};

use crate::errors::Result;
use crate::models::{EdgeKind, Entity, GraphEdge, TextUnit};
use async_trait::async_trait;
use uuid::Uuid;

/// Read-only property graph. Safe under arbitrary read concurrency.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Entities whose normalized name matches one of `names`.
    /// Results follow the order of `names`, without duplicates.
    async fn find_entities_by_name(&self, names: &[String]) -> Result<Vec<Entity>>;

    /// Entities for the given ids, in input order; unknown ids are skipped
    async fn get_entities(&self, ids: &[Uuid]) -> Result<Vec<Entity>>;

    /// Edges of the requested kinds touching any frontier node.
    ///
    /// Edges are traversed in both directions and returned oriented so that
    /// `source` is the frontier node.
    async fn neighbors(&self, frontier: &[Uuid], kinds: &[EdgeKind]) -> Result<Vec<GraphEdge>>;

    /// Evidence linked to the given entities, grouped in input order
    async fn text_units(&self, entity_ids: &[Uuid]) -> Result<Vec<TextUnit>>;

    /// Store name for logs
    fn name(&self) -> &str;
}
