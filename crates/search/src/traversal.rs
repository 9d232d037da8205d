//! Bounded multi-hop expansion
//!
//! Breadth-first over typed edges with an explicit visited index. Each hop
//! is one batched `neighbors` call for the whole frontier. Nodes live in a
//! flat arena, so cycles cost one index lookup.

use crate::engine::{with_timeout, RetrievalGap};
use graphforge_common::config::EdgeWeights;
use graphforge_common::errors::Result;
use graphforge_common::graph::GraphStore;
use graphforge_common::models::EdgeKind;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Multiplier for an edge kind
pub fn edge_kind_weight(weights: &EdgeWeights, kind: EdgeKind) -> f32 {
    match kind {
        EdgeKind::Semantic => weights.semantic,
        EdgeKind::Contains => weights.contains,
        EdgeKind::SimilarTo => weights.similar_to,
    }
}

/// Edge kinds worth traversing (non-zero weight)
pub fn active_kinds(weights: &EdgeWeights) -> Vec<EdgeKind> {
    EdgeKind::ALL
        .into_iter()
        .filter(|kind| edge_kind_weight(weights, *kind) > 0.0)
        .collect()
}

/// Node in the expanded subgraph
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: Uuid,
    /// Hops from the nearest seed
    pub hop: usize,
    /// Best decayed path weight from any seed
    pub proximity: f32,
    pub is_seed: bool,
}

/// Traversed edge between two arena slots, carrying its effective weight
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Link {
    pub from: usize,
    pub to: usize,
    pub weight: f32,
}

/// Expanded neighbourhood; arena order is discovery order
#[derive(Debug, Clone, Default)]
pub struct Subgraph {
    nodes: Vec<Node>,
    index: HashMap<Uuid, usize>,
    links: Vec<Link>,
}

impl Subgraph {
    fn with_seeds(seeds: &[Uuid]) -> Self {
        let mut subgraph = Self::default();
        for &id in seeds {
            if !subgraph.index.contains_key(&id) {
                subgraph.index.insert(id, subgraph.nodes.len());
                subgraph.nodes.push(Node {
                    id,
                    hop: 0,
                    proximity: 1.0,
                    is_seed: true,
                });
            }
        }
        subgraph
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn slot(&self, id: &Uuid) -> Option<usize> {
        self.index.get(id).copied()
    }
}

/// Traversal bounds
#[derive(Debug, Clone)]
pub struct ExpansionParams {
    pub max_hops: usize,
    pub max_nodes: usize,
    pub hop_decay: f32,
    pub edge_weights: EdgeWeights,
    pub timeout: Duration,
    /// Any failed hop fails the whole expansion
    pub fail_fast: bool,
}

/// Subgraph plus the hop that could not be read, if any
#[derive(Debug, Clone)]
pub struct Expansion {
    pub subgraph: Subgraph,
    pub gap: Option<RetrievalGap>,
    /// Node cap was hit
    pub truncated: bool,
}

/// Expand from `seeds` up to `params.max_hops` hops.
///
/// A failed hop either aborts (`fail_fast`) or ends expansion with what was
/// collected so far and a recorded gap.
pub async fn expand(store: &dyn GraphStore, seeds: &[Uuid], params: &ExpansionParams) -> Result<Expansion> {
    let mut subgraph = Subgraph::with_seeds(seeds);
    let kinds = active_kinds(&params.edge_weights);
    let mut frontier: Vec<usize> = (0..subgraph.nodes.len()).collect();
    let mut gap = None;
    let mut truncated = false;

    for hop in 0..params.max_hops {
        if frontier.is_empty() || kinds.is_empty() {
            break;
        }

        let ids: Vec<Uuid> = frontier.iter().map(|&slot| subgraph.nodes[slot].id).collect();
        let edges = match with_timeout("neighbors", params.timeout, store.neighbors(&ids, &kinds)).await {
            Ok(edges) => edges,
            Err(e) if params.fail_fast => return Err(e),
            Err(e) => {
                tracing::warn!(hop = hop + 1, error = %e, "Graph expansion stopped early");
                gap = Some(RetrievalGap::new(format!("neighbors hop {}", hop + 1), &e));
                break;
            }
        };

        let mut next = Vec::new();
        for edge in edges {
            let Some(from) = subgraph.slot(&edge.source) else {
                continue;
            };
            let weight = edge_kind_weight(&params.edge_weights, edge.kind) * edge.weight.max(0.0);
            if weight <= 0.0 {
                continue;
            }
            let reach = subgraph.nodes[from].proximity * params.hop_decay * weight;

            let to = match subgraph.slot(&edge.target) {
                Some(slot) => {
                    // Only nodes not yet expanded can still improve
                    let node = &mut subgraph.nodes[slot];
                    if node.hop == hop + 1 && reach > node.proximity {
                        node.proximity = reach;
                    }
                    slot
                }
                None => {
                    if subgraph.nodes.len() >= params.max_nodes {
                        truncated = true;
                        continue;
                    }
                    let slot = subgraph.nodes.len();
                    subgraph.index.insert(edge.target, slot);
                    subgraph.nodes.push(Node {
                        id: edge.target,
                        hop: hop + 1,
                        proximity: reach,
                        is_seed: false,
                    });
                    next.push(slot);
                    slot
                }
            };

            subgraph.links.push(Link { from, to, weight });
        }

        tracing::debug!(hop = hop + 1, discovered = next.len(), total = subgraph.nodes.len(), "Expanded hop");
        frontier = next;
    }

    Ok(Expansion {
        subgraph,
        gap,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphforge_common::graph::InMemoryGraph;
    use graphforge_common::models::Entity;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    /// 1 - 2 - 3 - 4 chain with a 3 -> 1 back edge
    fn chain() -> InMemoryGraph {
        let mut builder = InMemoryGraph::builder();
        for n in 1..=4 {
            builder.add_entity(Entity::new(id(n), format!("E{}", n), "concept"));
        }
        builder.add_edge(id(1), id(2), EdgeKind::Semantic, 1.0).unwrap();
        builder.add_edge(id(2), id(3), EdgeKind::Semantic, 1.0).unwrap();
        builder.add_edge(id(3), id(4), EdgeKind::Contains, 1.0).unwrap();
        builder.add_edge(id(3), id(1), EdgeKind::SimilarTo, 1.0).unwrap();
        builder.build()
    }

    fn params(max_hops: usize) -> ExpansionParams {
        ExpansionParams {
            max_hops,
            max_nodes: 100,
            hop_decay: 0.5,
            edge_weights: EdgeWeights::default(),
            timeout: Duration::from_secs(1),
            fail_fast: false,
        }
    }

    #[tokio::test]
    async fn test_hop_bound_and_cycle() {
        let graph = chain();

        let one = expand(&graph, &[id(1)], &params(1)).await.unwrap();
        let ids: Vec<_> = one.subgraph.nodes().iter().map(|n| n.id).collect();
        // Node 3 is one hop away through the similarity back edge
        assert_eq!(ids, vec![id(1), id(2), id(3)]);

        let two = expand(&graph, &[id(1)], &params(2)).await.unwrap();
        assert_eq!(two.subgraph.len(), 4);
        assert!(two.gap.is_none());
        // Seed keeps full proximity despite the cycle
        assert_eq!(two.subgraph.nodes()[0].proximity, 1.0);
    }

    #[tokio::test]
    async fn test_proximity_decays_by_edge_kind() {
        let graph = chain();
        let expansion = expand(&graph, &[id(1)], &params(1)).await.unwrap();
        let subgraph = expansion.subgraph;

        let semantic = &subgraph.nodes()[subgraph.slot(&id(2)).unwrap()];
        let similar = &subgraph.nodes()[subgraph.slot(&id(3)).unwrap()];
        assert!((semantic.proximity - 0.5).abs() < 1e-6);
        assert!((similar.proximity - 0.25).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_node_cap() {
        let graph = chain();
        let mut capped = params(3);
        capped.max_nodes = 2;

        let expansion = expand(&graph, &[id(1)], &capped).await.unwrap();
        assert_eq!(expansion.subgraph.len(), 2);
        assert!(expansion.truncated);
    }

    #[test]
    fn test_zero_weight_kinds_are_skipped() {
        let weights = EdgeWeights {
            similar_to: 0.0,
            ..EdgeWeights::default()
        };
        assert_eq!(active_kinds(&weights), vec![EdgeKind::Semantic, EdgeKind::Contains]);
    }
}
