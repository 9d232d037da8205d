//! Seed resolution
//!
//! Turns explicit entity ids and free-text seed terms into graph entities
//! with at most one batched lookup each.

use crate::engine::with_timeout;
use graphforge_common::errors::Result;
use graphforge_common::graph::GraphStore;
use graphforge_common::models::Entity;
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

/// Where traversal starts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedInput {
    /// Known entity ids (e.g. discovered by earlier passes)
    pub entity_ids: Vec<Uuid>,
    /// Candidate names to resolve against the entity index
    pub terms: Vec<String>,
}

impl SeedInput {
    pub fn is_empty(&self) -> bool {
        self.entity_ids.is_empty() && self.terms.is_empty()
    }
}

/// Resolve seeds, ids first, then terms. Output is deduplicated and keeps
/// resolution order.
pub async fn resolve_seeds(store: &dyn GraphStore, input: &SeedInput, timeout: Duration) -> Result<Vec<Entity>> {
    let mut seeds = Vec::new();

    if !input.entity_ids.is_empty() {
        seeds.extend(with_timeout("get_entities", timeout, store.get_entities(&input.entity_ids)).await?);
    }
    if !input.terms.is_empty() {
        seeds.extend(with_timeout("find_entities_by_name", timeout, store.find_entities_by_name(&input.terms)).await?);
    }

    let mut seen = HashSet::new();
    seeds.retain(|entity| seen.insert(entity.id));
    Ok(seeds)
}
