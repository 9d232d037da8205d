//! Graph retrieval engine
//!
//! One `retrieve` call runs:
//! 1. Seed resolution (ids, then names)
//! 2. Bounded expansion over typed edges
//! 3. Proximity (decayed paths or personalized propagation)
//! 4. Node ranking with importance and community alignment
//! 5. Text-unit resolution, validated at the evidence boundary
//! 6. Optional similarity blend, then the denoising pipeline
//!
//! Fast mode treats any failed read as fatal. Full mode keeps going with
//! whatever was read and records a gap. At the seed stage only a timeout
//! is absorbed; other store failures still fail the pass.

use crate::propagation::{personalized_pagerank, PropagationConfig};
use crate::ranking::{rank_nodes, RankedNode};
use crate::seeds::{resolve_seeds, SeedInput};
use crate::semantic::blend_similarity;
use crate::traversal::{expand, ExpansionParams};
use graphforge_common::config::{Propagation, RetrievalConfig};
use graphforge_common::denoise::{admit, Admitted, DenoisePipeline};
use graphforge_common::embeddings::Embedder;
use graphforge_common::errors::{AppError, ErrorCode, Result};
use graphforge_common::graph::GraphStore;
use graphforge_common::metrics::{self, StageTimer};
use graphforge_common::models::{ContextStats, Entity, EvidenceSet};
use graphforge_common::text;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

/// Bound a graph read by `timeout`
pub(crate) async fn with_timeout<T, F>(operation: &str, timeout: Duration, read: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, read).await {
        Ok(result) => result,
        Err(_) => {
            metrics::record_graph_timeout(operation);
            Err(AppError::RetrievalTimeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}

/// Traversal depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    /// Single hop from directly named entities; failures are fatal
    Fast,
    /// Multi-hop traversal; failures leave gaps
    Full,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Fast => "fast",
            RetrievalMode::Full => "full",
        }
    }
}

/// A stage that could not be read during a non-fatal retrieval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalGap {
    pub stage: String,
    pub code: ErrorCode,
}

impl RetrievalGap {
    pub fn new(stage: impl Into<String>, error: &AppError) -> Self {
        Self {
            stage: stage.into(),
            code: error.code(),
        }
    }
}

/// One retrieval pass
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalRequest {
    /// Text used for seed extraction and similarity scoring
    pub query_text: String,
    /// Explicit seeds; extracted from `query_text` when empty
    pub seeds: SeedInput,
    pub mode: RetrievalMode,
}

impl RetrievalRequest {
    /// Seeds come from the query text
    pub fn for_text(query_text: impl Into<String>, mode: RetrievalMode) -> Self {
        Self {
            query_text: query_text.into(),
            seeds: SeedInput::default(),
            mode,
        }
    }

    /// Seeds are known entities
    pub fn for_entities(query_text: impl Into<String>, entity_ids: Vec<Uuid>, mode: RetrievalMode) -> Self {
        Self {
            query_text: query_text.into(),
            seeds: SeedInput {
                entity_ids,
                terms: Vec::new(),
            },
            mode,
        }
    }
}

/// Ranked nodes and the denoised evidence they resolve to
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalOutcome {
    pub mode: RetrievalMode,
    pub seeds: Vec<Entity>,
    pub nodes: Vec<RankedNode>,
    pub evidence: EvidenceSet,
    pub stats: ContextStats,
    pub gaps: Vec<RetrievalGap>,
    /// Nodes reached before ranking
    pub expanded: usize,
}

impl RetrievalOutcome {
    pub fn empty(mode: RetrievalMode, seeds: Vec<Entity>) -> Self {
        Self {
            mode,
            seeds,
            nodes: Vec::new(),
            evidence: EvidenceSet::empty(),
            stats: ContextStats::default(),
            gaps: Vec::new(),
            expanded: 0,
        }
    }

    /// Seeds followed by ranked nodes, without duplicates
    pub fn discovered_entity_ids(&self) -> Vec<Uuid> {
        let mut seen = HashSet::new();
        self.seeds
            .iter()
            .map(|e| e.id)
            .chain(self.nodes.iter().map(|n| n.entity.id))
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

/// Graph retrieval over a read-only store
pub struct GraphRetriever {
    store: Arc<dyn GraphStore>,
    embedder: Option<Arc<dyn Embedder>>,
    config: RetrievalConfig,
    denoiser: DenoisePipeline,
}

impl GraphRetriever {
    pub fn new(store: Arc<dyn GraphStore>, config: RetrievalConfig, denoiser: DenoisePipeline) -> Self {
        Self {
            store,
            embedder: None,
            config,
            denoiser,
        }
    }

    /// Enable the similarity blend (used when `semantic_weight > 0`)
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn denoiser(&self) -> &DenoisePipeline {
        &self.denoiser
    }

    /// Seed terms for free text. Fast mode prefers explicit mentions.
    pub fn seed_terms(&self, text: &str, mode: RetrievalMode) -> Vec<String> {
        if mode == RetrievalMode::Fast {
            let mut mentions = text::extract_mentions(text);
            if !mentions.is_empty() {
                mentions.truncate(self.config.max_seed_terms);
                return mentions;
            }
        }
        text::seed_terms(text, self.config.max_seed_terms)
    }

    #[instrument(skip_all, fields(mode = request.mode.as_str(), store = self.store.name()))]
    pub async fn retrieve(&self, request: &RetrievalRequest) -> Result<RetrievalOutcome> {
        let timer = StageTimer::start();
        let mode = request.mode;
        let fail_fast = mode == RetrievalMode::Fast;
        let timeout = self.config.graph_timeout();
        let store = self.store.as_ref();

        // 1. Seeds
        let mut seed_input = request.seeds.clone();
        if seed_input.is_empty() {
            seed_input.terms = self.seed_terms(&request.query_text, mode);
        }
        let seeds = match resolve_seeds(store, &seed_input, timeout).await {
            Ok(seeds) => seeds,
            Err(e @ AppError::RetrievalTimeout { .. }) if !fail_fast => {
                tracing::warn!(error = %e, "Seed lookup timed out, nothing to expand");
                metrics::record_retrieval(timer.elapsed_secs(), mode.as_str(), 0);
                let mut outcome = RetrievalOutcome::empty(mode, Vec::new());
                outcome.gaps.push(RetrievalGap::new("seeds", &e));
                return Ok(outcome);
            }
            Err(e) => return Err(e),
        };
        if seeds.is_empty() {
            tracing::info!(terms = seed_input.terms.len(), "No seed entities resolved");
            metrics::record_retrieval(timer.elapsed_secs(), mode.as_str(), 0);
            return Ok(RetrievalOutcome::empty(mode, seeds));
        }
        let seed_ids: Vec<Uuid> = seeds.iter().map(|e| e.id).collect();

        // 2. Expansion
        let (max_hops, max_ranked) = match mode {
            RetrievalMode::Fast => (self.config.fast_max_hops, self.config.fast_max_ranked),
            RetrievalMode::Full => (self.config.full_max_hops, self.config.full_max_ranked),
        };
        let params = ExpansionParams {
            max_hops,
            max_nodes: self.config.max_expanded_nodes.max(seed_ids.len()),
            hop_decay: self.config.hop_decay,
            edge_weights: self.config.edge_weights.clone(),
            timeout,
            fail_fast,
        };
        let expansion = expand(store, &seed_ids, &params).await?;
        let mut gaps: Vec<RetrievalGap> = expansion.gap.into_iter().collect();
        let subgraph = expansion.subgraph;

        // 3. Proximity
        let proximity: Vec<f32> = match self.config.propagation {
            Propagation::Bfs => subgraph.nodes().iter().map(|n| n.proximity).collect(),
            Propagation::Personalized => personalized_pagerank(
                &subgraph,
                &PropagationConfig {
                    damping: self.config.damping,
                    max_iterations: self.config.propagation_iterations,
                    ..PropagationConfig::default()
                },
            ),
        };

        // 4. Node attributes and ranking
        let mut entities: HashMap<Uuid, Entity> = seeds.iter().map(|e| (e.id, e.clone())).collect();
        let unknown: Vec<Uuid> = subgraph
            .nodes()
            .iter()
            .filter(|n| !n.is_seed)
            .map(|n| n.id)
            .collect();
        if !unknown.is_empty() {
            match with_timeout("get_entities", timeout, store.get_entities(&unknown)).await {
                Ok(found) => entities.extend(found.into_iter().map(|e| (e.id, e))),
                Err(e) if fail_fast => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "Ranking without node attributes");
                    gaps.push(RetrievalGap::new("get_entities", &e));
                }
            }
        }
        let nodes = rank_nodes(&subgraph, &proximity, &entities, &seeds, &self.config.weights, max_ranked);

        // 5. Evidence boundary, in node rank order
        let node_scores: HashMap<Uuid, f32> = nodes.iter().map(|n| (n.entity.id, n.score)).collect();
        let ranked_ids: Vec<Uuid> = nodes.iter().map(|n| n.entity.id).collect();
        let mut admitted = match with_timeout("text_units", timeout, store.text_units(&ranked_ids)).await {
            Ok(units) => admit(units.into_iter().map(|unit| {
                let score = node_scores.get(&unit.entity_id).copied().unwrap_or(0.0);
                (unit.payload, score)
            })),
            Err(e) if fail_fast => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Continuing without text units");
                gaps.push(RetrievalGap::new("text_units", &e));
                Admitted::default()
            }
        };

        // 6. Similarity blend and denoising
        if let Some(embedder) = self.embedder.as_deref() {
            if self.config.semantic_weight > 0.0 {
                let blended = blend_similarity(
                    embedder,
                    &request.query_text,
                    &mut admitted.chunks,
                    self.config.semantic_weight,
                )
                .await;
                match blended {
                    Ok(()) => {}
                    Err(e) if fail_fast => return Err(e),
                    Err(e) => {
                        tracing::warn!(error = %e, "Similarity blend skipped");
                        gaps.push(RetrievalGap::new("embedding", &e));
                    }
                }
            }
        }
        let denoised = self.denoiser.run_admitted(admitted);

        metrics::record_retrieval(timer.elapsed_secs(), mode.as_str(), nodes.len());
        tracing::info!(
            seeds = seeds.len(),
            expanded = subgraph.len(),
            ranked = nodes.len(),
            truncated = expansion.truncated,
            raw = denoised.stats.raw,
            deduped = denoised.stats.deduped,
            penalized = denoised.stats.penalized,
            dropped = denoised.stats.dropped,
            gaps = gaps.len(),
            latency_ms = timer.elapsed_ms(),
            "Retrieval complete"
        );

        Ok(RetrievalOutcome {
            mode,
            seeds,
            nodes,
            evidence: denoised.evidence,
            stats: denoised.stats,
            gaps,
            expanded: subgraph.len(),
        })
    }
}
