//! In-memory graph store
//!
//! Nodes live in a flat arena indexed by id; adjacency is kept per arena
//! slot. The store is immutable once built, so it is shared via `Arc` and
//! read without locks.

use super::GraphStore;
use crate::errors::{AppError, Result};
use crate::models::{EdgeKind, Entity, EvidencePayload, GraphEdge, TextUnit};
use crate::text::normalize_name;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Adjacent {
    node: usize,
    kind: EdgeKind,
    weight: f32,
}

/// Immutable arena-backed property graph
#[derive(Debug, Default)]
pub struct InMemoryGraph {
    /// Node arena
    entities: Vec<Entity>,

    /// id -> arena slot
    index: HashMap<Uuid, usize>,

    /// Per-slot adjacency, both directions
    adjacency: Vec<Vec<Adjacent>>,

    /// Normalized name -> arena slots
    names: HashMap<String, Vec<usize>>,

    /// Per-slot linked evidence
    units: Vec<Vec<EvidencePayload>>,
}

impl InMemoryGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    /// Get node count
    pub fn node_count(&self) -> usize {
        self.entities.len()
    }

    /// Get edge count (each undirected edge counted once)
    pub fn edge_count(&self) -> usize {
        // Self-loops are stored once, every other edge on both ends
        let (loops, ends) = self
            .adjacency
            .iter()
            .enumerate()
            .flat_map(|(slot, edges)| edges.iter().map(move |edge| edge.node == slot))
            .fold((0, 0), |(loops, ends), is_loop| if is_loop { (loops + 1, ends) } else { (loops, ends + 1) });
        loops + ends / 2
    }

    pub fn entity(&self, id: Uuid) -> Option<&Entity> {
        self.index.get(&id).map(|&slot| &self.entities[slot])
    }
}

#[async_trait]
impl GraphStore for InMemoryGraph {
    async fn find_entities_by_name(&self, names: &[String]) -> Result<Vec<Entity>> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        for name in names {
            if let Some(slots) = self.names.get(&normalize_name(name)) {
                for &slot in slots {
                    if seen.insert(slot) {
                        found.push(self.entities[slot].clone());
                    }
                }
            }
        }

        Ok(found)
    }

    async fn get_entities(&self, ids: &[Uuid]) -> Result<Vec<Entity>> {
        let mut seen = HashSet::new();
        Ok(ids
            .iter()
            .filter(|id| seen.insert(**id))
            .filter_map(|id| self.entity(*id).cloned())
            .collect())
    }

    async fn neighbors(&self, frontier: &[Uuid], kinds: &[EdgeKind]) -> Result<Vec<GraphEdge>> {
        let mut edges = Vec::new();

        for id in frontier {
            let Some(&slot) = self.index.get(id) else {
                continue;
            };
            for adjacent in &self.adjacency[slot] {
                if kinds.contains(&adjacent.kind) {
                    edges.push(GraphEdge {
                        source: *id,
                        target: self.entities[adjacent.node].id,
                        kind: adjacent.kind,
                        weight: adjacent.weight,
                    });
                }
            }
        }

        Ok(edges)
    }

    async fn text_units(&self, entity_ids: &[Uuid]) -> Result<Vec<TextUnit>> {
        let mut units = Vec::new();

        for id in entity_ids {
            let Some(&slot) = self.index.get(id) else {
                continue;
            };
            units.extend(self.units[slot].iter().map(|payload| TextUnit {
                entity_id: *id,
                payload: payload.clone(),
            }));
        }

        Ok(units)
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}

/// Mutable builder for [`InMemoryGraph`]
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: InMemoryGraph,
}

impl GraphBuilder {
    /// Add or replace an entity
    pub fn add_entity(&mut self, entity: Entity) -> Uuid {
        let id = entity.id;
        let key = normalize_name(&entity.name);

        match self.graph.index.get(&id) {
            Some(&slot) => {
                let old_key = normalize_name(&self.graph.entities[slot].name);
                if let Some(slots) = self.graph.names.get_mut(&old_key) {
                    slots.retain(|&s| s != slot);
                }
                self.graph.entities[slot] = entity;
                self.graph.names.entry(key).or_default().push(slot);
            }
            None => {
                let slot = self.graph.entities.len();
                self.graph.entities.push(entity);
                self.graph.adjacency.push(Vec::new());
                self.graph.units.push(Vec::new());
                self.graph.index.insert(id, slot);
                self.graph.names.entry(key).or_default().push(slot);
            }
        }

        id
    }

    /// Connect two existing entities
    pub fn add_edge(&mut self, source: Uuid, target: Uuid, kind: EdgeKind, weight: f32) -> Result<()> {
        let from = self.slot(source)?;
        let to = self.slot(target)?;
        if !weight.is_finite() || weight < 0.0 {
            return Err(AppError::GraphStore {
                message: format!("invalid weight {} on edge {} -> {}", weight, source, target),
            });
        }

        self.graph.adjacency[from].push(Adjacent { node: to, kind, weight });
        if from != to {
            self.graph.adjacency[to].push(Adjacent { node: from, kind, weight });
        }
        Ok(())
    }

    /// Attach evidence to an existing entity
    pub fn link(&mut self, entity_id: Uuid, payload: EvidencePayload) -> Result<()> {
        let slot = self.slot(entity_id)?;
        self.graph.units[slot].push(payload);
        Ok(())
    }

    pub fn build(self) -> InMemoryGraph {
        tracing::debug!(
            nodes = self.graph.node_count(),
            edges = self.graph.edge_count(),
            "Built in-memory graph"
        );
        self.graph
    }

    fn slot(&self, id: Uuid) -> Result<usize> {
        self.graph.index.get(&id).copied().ok_or_else(|| AppError::GraphStore {
            message: format!("unknown entity {}", id),
        })
    }
}
