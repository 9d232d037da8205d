//! Node ranking
//!
//! `score = w_p * proximity + w_i * importance + w_c * community_alignment`
//!
//! Importance is the precomputed centrality normalized by the subgraph
//! maximum. Community alignment is the share of seeds sharing the node's
//! community. Ties break on hop distance, then discovery order.

use crate::traversal::Subgraph;
use graphforge_common::config::RankingWeights;
use graphforge_common::models::Entity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Node with its score breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedNode {
    pub entity: Entity,
    pub hop: usize,
    pub proximity: f32,
    /// Normalized importance, 0.0 - 1.0
    pub importance: f32,
    /// Share of seeds in the same community, 0.0 - 1.0
    pub community_alignment: f32,
    pub score: f32,
}

/// Rank every subgraph node and keep the top `limit`.
///
/// `proximity` is indexed by arena slot. Nodes missing from `entities`
/// rank on proximity alone.
pub fn rank_nodes(
    subgraph: &Subgraph,
    proximity: &[f32],
    entities: &HashMap<Uuid, Entity>,
    seeds: &[Entity],
    weights: &RankingWeights,
    limit: usize,
) -> Vec<RankedNode> {
    let mut seed_communities: HashMap<u64, usize> = HashMap::new();
    for seed in seeds {
        if let Some(community) = seed.community_id {
            *seed_communities.entry(community).or_default() += 1;
        }
    }
    let seed_count = seeds.len().max(1) as f32;

    let max_importance = subgraph
        .nodes()
        .iter()
        .filter_map(|node| entities.get(&node.id))
        .map(|entity| entity.importance.max(0.0))
        .fold(0.0f32, f32::max);

    let mut ranked: Vec<(usize, RankedNode)> = subgraph
        .nodes()
        .iter()
        .enumerate()
        .map(|(slot, node)| {
            let entity = entities
                .get(&node.id)
                .cloned()
                .unwrap_or_else(|| Entity::new(node.id, String::new(), "unknown"));

            let importance = if max_importance > 0.0 {
                entity.importance.max(0.0) / max_importance
            } else {
                0.0
            };
            let community_alignment = entity
                .community_id
                .and_then(|c| seed_communities.get(&c))
                .map(|&count| count as f32 / seed_count)
                .unwrap_or(0.0);
            let proximity = proximity.get(slot).copied().unwrap_or(0.0);

            let score = weights.proximity * proximity
                + weights.importance * importance
                + weights.community * community_alignment;

            (
                slot,
                RankedNode {
                    entity,
                    hop: node.hop,
                    proximity,
                    importance,
                    community_alignment,
                    score,
                },
            )
        })
        .collect();

    ranked.sort_by(|(slot_a, a), (slot_b, b)| {
        b.score
            .total_cmp(&a.score)
            .then(a.hop.cmp(&b.hop))
            .then(slot_a.cmp(slot_b))
    });
    ranked.truncate(limit);
    ranked.into_iter().map(|(_, node)| node).collect()
}
