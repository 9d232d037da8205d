//! Personalized importance propagation
//!
//! PageRank over the expanded subgraph with teleports restricted to the
//! seeds, so mass concentrates around them. Scores replace the decayed
//! path proximity when `retrieval.propagation = "personalized"`.

use crate::traversal::Subgraph;
use std::collections::BTreeMap;

/// Propagation configuration
#[derive(Debug, Clone)]
pub struct PropagationConfig {
    /// Damping factor (typically 0.85)
    pub damping: f32,

    /// Maximum iterations
    pub max_iterations: usize,

    /// Convergence threshold
    pub epsilon: f32,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            damping: 0.85,
            max_iterations: 30,
            epsilon: 1e-6,
        }
    }
}

/// Personalized PageRank per arena slot, normalized so the maximum is 1.0.
///
/// Links are treated as undirected and weighted. Dangling mass returns to
/// the seeds. All zeros when the subgraph has no seeds.
pub fn personalized_pagerank(subgraph: &Subgraph, config: &PropagationConfig) -> Vec<f32> {
    let n = subgraph.len();
    let seeds: Vec<usize> = subgraph
        .nodes()
        .iter()
        .enumerate()
        .filter(|(_, node)| node.is_seed)
        .map(|(slot, _)| slot)
        .collect();
    if n == 0 || seeds.is_empty() {
        return vec![0.0; n];
    }

    let damping = config.damping;
    let seed_share = 1.0 / seeds.len() as f32;

    // Undirected weighted adjacency; a pair seen from both ends counts once
    let mut pairs: BTreeMap<(usize, usize), f32> = BTreeMap::new();
    for link in subgraph.links() {
        let key = (link.from.min(link.to), link.from.max(link.to));
        let weight = pairs.entry(key).or_insert(0.0);
        *weight = weight.max(link.weight);
    }
    let mut adjacency: Vec<Vec<(usize, f32)>> = vec![Vec::new(); n];
    for (&(a, b), &weight) in &pairs {
        adjacency[a].push((b, weight));
        if a != b {
            adjacency[b].push((a, weight));
        }
    }
    let out_weight: Vec<f32> = adjacency
        .iter()
        .map(|edges| edges.iter().map(|(_, w)| w).sum())
        .collect();

    let mut teleport = vec![0.0f32; n];
    for &seed in &seeds {
        teleport[seed] = seed_share;
    }

    let mut scores = teleport.clone();
    for _ in 0..config.max_iterations {
        let mut next: Vec<f32> = teleport.iter().map(|t| (1.0 - damping) * t).collect();

        let mut dangling = 0.0f32;
        for (slot, edges) in adjacency.iter().enumerate() {
            if out_weight[slot] <= 0.0 {
                dangling += scores[slot];
                continue;
            }
            let share = damping * scores[slot] / out_weight[slot];
            for &(target, weight) in edges {
                next[target] += share * weight;
            }
        }
        for &seed in &seeds {
            next[seed] += damping * dangling * seed_share;
        }

        let max_diff = scores
            .iter()
            .zip(&next)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        scores = next;

        // Check convergence
        if max_diff < config.epsilon {
            break;
        }
    }

    // Normalize to 0-1 range
    let max_score = scores.iter().cloned().fold(0.0f32, f32::max);
    if max_score > 0.0 {
        for score in scores.iter_mut() {
            *score /= max_score;
        }
    }
    scores
}
