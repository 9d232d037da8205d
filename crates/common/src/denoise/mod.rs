//! Context denoising pipeline
//!
//! Cleans a raw candidate pool in three ordered layers:
//! 1. Deduplication by content hash
//! 2. Noise filtering (multiplicative score penalties, never drops)
//! 3. Token budget guard (score-sorted prefix that fits the budget)
//!
//! Each layer is a pure pool → pool function and can be disabled on its own
//! for ablation runs. Only this module builds [`EvidenceSet`]s.

use crate::config::DenoiseConfig;
use crate::metrics;
use crate::models::{Chunk, ContextStats, EvidencePayload, EvidenceSet, PayloadRejection};
use regex_lite::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::OnceLock;

/// A chunk in the pool, tagged with its position in the original fetch order
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub chunk: Chunk,
    pub fetch_rank: usize,
    /// Set once any noise penalty applied
    pub penalized: bool,
}

impl Candidate {
    /// Tag chunks with their fetch order
    pub fn pool(chunks: Vec<Chunk>) -> Vec<Candidate> {
        chunks
            .into_iter()
            .enumerate()
            .map(|(fetch_rank, chunk)| Candidate {
                chunk,
                fetch_rank,
                penalized: false,
            })
            .collect()
    }
}

/// Score descending, earliest fetch first on ties
fn rank_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.chunk
        .score
        .total_cmp(&a.chunk.score)
        .then(a.fetch_rank.cmp(&b.fetch_rank))
}

// =============================================================================
// Layer 1: deduplication
// =============================================================================

/// Collapse candidates sharing a content hash.
///
/// The highest-scored instance of each hash group survives (earliest fetch on
/// ties) and keeps its own fetch rank. Output is in fetch order.
pub fn dedup(pool: Vec<Candidate>) -> Vec<Candidate> {
    let mut best: HashMap<String, usize> = HashMap::with_capacity(pool.len());
    let mut kept: Vec<Candidate> = Vec::with_capacity(pool.len());

    for candidate in pool {
        match best.get(&candidate.chunk.content_hash) {
            Some(&slot) => {
                if rank_order(&candidate, &kept[slot]) == Ordering::Less {
                    kept[slot] = candidate;
                }
            }
            None => {
                best.insert(candidate.chunk.content_hash.clone(), kept.len());
                kept.push(candidate);
            }
        }
    }

    kept.sort_by_key(|c| c.fetch_rank);
    kept
}

// =============================================================================
// Layer 2: noise filtering
// =============================================================================

fn form_label_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // "Name: ____", "Date:", "Signature: [ ]"
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9 ()/#&'.-]{0,40}:\s*(_{2,}|\.{2,}|\[\s*\]|\(\s*\))?\s*$")
            .expect("form label pattern is valid")
    })
}

fn heading_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Optional markdown hashes or section numbering, no sentence punctuation
    PATTERN.get_or_init(|| {
        Regex::new(r"^(#{1,6}\s+)?(\d+(\.\d+)*\.?\s+|[IVX]+\.\s+)?[A-Za-z][^.!?:;]*$")
            .expect("heading pattern is valid")
    })
}

const HEADING_MAX_WORDS: usize = 12;

/// Heuristic low-value shapes and their score multipliers
#[derive(Debug, Clone)]
pub struct NoiseFilter {
    min_content_chars: usize,
    form_label_penalty: f32,
    heading_penalty: f32,
    short_content_penalty: f32,
}

impl NoiseFilter {
    pub fn new(config: &DenoiseConfig) -> Self {
        Self {
            min_content_chars: config.min_content_chars,
            form_label_penalty: config.form_label_penalty,
            heading_penalty: config.heading_penalty,
            short_content_penalty: config.short_content_penalty,
        }
    }

    /// Every non-empty line is a bare form label
    pub fn is_form_label(&self, text: &str) -> bool {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty()).peekable();
        lines.peek().is_some() && lines.all(|line| form_label_line().is_match(line))
    }

    /// A single short line without sentence punctuation
    pub fn is_bare_heading(&self, text: &str) -> bool {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        let (Some(line), None) = (lines.next(), lines.next()) else {
            return false;
        };
        line.split_whitespace().count() <= HEADING_MAX_WORDS && heading_line().is_match(line)
    }

    pub fn is_short(&self, text: &str) -> bool {
        text.trim().chars().count() < self.min_content_chars
    }

    /// Combined multiplier; 1.0 when no shape matches
    pub fn multiplier(&self, text: &str) -> f32 {
        let mut factor = 1.0;
        if self.is_form_label(text) {
            factor *= self.form_label_penalty;
        } else if self.is_bare_heading(text) {
            factor *= self.heading_penalty;
        }
        if self.is_short(text) {
            factor *= self.short_content_penalty;
        }
        factor
    }

    /// Apply penalties to the pool. Membership and order are unchanged.
    pub fn penalize(&self, pool: Vec<Candidate>) -> Vec<Candidate> {
        pool.into_iter()
            .map(|mut candidate| {
                let factor = self.multiplier(&candidate.chunk.text);
                if factor < 1.0 {
                    candidate.chunk.score *= factor;
                    candidate.penalized = true;
                }
                candidate
            })
            .collect()
    }
}

// =============================================================================
// Layer 3: token budget guard
// =============================================================================

/// Sort by rank and keep the longest prefix within `budget` tokens.
///
/// Returns the retained prefix and the number of candidates dropped.
/// With no budget the pool is only sorted.
pub fn budget_guard(mut pool: Vec<Candidate>, budget: Option<usize>) -> (Vec<Candidate>, usize) {
    pool.sort_by(rank_order);

    let Some(budget) = budget else {
        return (pool, 0);
    };

    let mut used = 0usize;
    let mut keep = pool.len();
    for (i, candidate) in pool.iter().enumerate() {
        if used + candidate.chunk.token_count > budget {
            keep = i;
            break;
        }
        used += candidate.chunk.token_count;
    }

    let dropped = pool.len() - keep;
    pool.truncate(keep);
    (pool, dropped)
}

// =============================================================================
// Evidence boundary
// =============================================================================

/// Chunks accepted at the evidence boundary
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Admitted {
    /// Accepted chunks in fetch order
    pub chunks: Vec<Chunk>,
    /// Payloads refused
    pub rejected: usize,
}

/// Validate heterogeneous payloads into chunks, assigning each the given
/// retrieval score. Invalid payloads are counted and dropped.
pub fn admit<I>(payloads: I) -> Admitted
where
    I: IntoIterator<Item = (EvidencePayload, f32)>,
{
    let mut admitted = Admitted::default();
    for (payload, score) in payloads {
        let kind = payload.kind();
        let result = payload.into_chunk().and_then(|chunk| {
            if score.is_finite() {
                Ok(chunk.with_score(score))
            } else {
                Err(PayloadRejection::NonFiniteScore)
            }
        });
        match result {
            Ok(chunk) => admitted.chunks.push(chunk),
            Err(reason) => {
                admitted.rejected += 1;
                tracing::debug!(kind, %reason, "Rejected evidence payload");
            }
        }
    }
    admitted
}

// =============================================================================
// Pipeline
// =============================================================================

/// Cleaned evidence plus per-layer counts
#[derive(Debug, Clone, PartialEq)]
pub struct DenoiseOutcome {
    pub evidence: EvidenceSet,
    pub stats: ContextStats,
}

/// Configured three-layer pipeline
#[derive(Debug, Clone)]
pub struct DenoisePipeline {
    config: DenoiseConfig,
    noise: NoiseFilter,
}

impl DenoisePipeline {
    pub fn new(config: DenoiseConfig) -> Self {
        let noise = NoiseFilter::new(&config);
        Self { config, noise }
    }

    pub fn config(&self) -> &DenoiseConfig {
        &self.config
    }

    /// Denoise chunks that passed the evidence boundary, counting the
    /// payloads refused there as raw input
    pub fn run_admitted(&self, admitted: Admitted) -> DenoiseOutcome {
        let mut outcome = self.run(admitted.chunks);
        outcome.stats.raw += admitted.rejected;
        outcome.stats.rejected = admitted.rejected;
        outcome
    }

    /// Run the enabled layers over chunks given in fetch order
    pub fn run(&self, chunks: Vec<Chunk>) -> DenoiseOutcome {
        let mut stats = ContextStats {
            raw: chunks.len(),
            ..ContextStats::default()
        };

        let mut pool = Candidate::pool(chunks);

        if self.config.enable_dedup {
            pool = dedup(pool);
        }
        stats.deduped = pool.len();
        stats.duplicates_removed = stats.raw - stats.deduped;

        if self.config.enable_noise_filter {
            pool = self.noise.penalize(pool);
        }
        stats.penalized = pool.iter().filter(|c| c.penalized).count();

        let budget = self.config.enable_budget_guard.then_some(self.config.token_budget);
        let (pool, dropped) = budget_guard(pool, budget);
        stats.dropped = dropped;

        let evidence = EvidenceSet::from_ordered(pool.into_iter().map(|c| c.chunk).collect(), budget);
        stats.final_count = evidence.len();
        stats.final_tokens = evidence.total_tokens();

        metrics::record_denoise(
            stats.raw,
            stats.duplicates_removed,
            stats.penalized,
            stats.dropped,
            stats.final_tokens,
        );
        tracing::debug!(
            raw = stats.raw,
            deduped = stats.deduped,
            penalized = stats.penalized,
            dropped = stats.dropped,
            final_tokens = stats.final_tokens,
            "Denoised evidence pool"
        );

        DenoiseOutcome { evidence, stats }
    }
}

impl Default for DenoisePipeline {
    fn default() -> Self {
        Self::new(DenoiseConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const BODY: &str = "Graph retrieval expands from seed entities over typed edges and ranks nodes.";

    fn chunk(id: u128, text: &str, score: f32) -> Chunk {
        Chunk::new(Uuid::from_u128(id), Uuid::from_u128(1000), "Doc", text).with_score(score)
    }

    fn long_text(i: usize) -> String {
        format!("{} Paragraph number {} adds distinct supporting detail.", BODY, i)
    }

    #[test]
    fn test_dedup_keeps_best_of_each_group() {
        let pool = Candidate::pool(vec![
            chunk(1, &long_text(1), 0.4),
            chunk(2, &long_text(1), 0.9),
            chunk(3, &long_text(2), 0.5),
            chunk(4, &long_text(1), 0.9),
        ]);

        let deduped = dedup(pool);

        assert_eq!(deduped.len(), 2);
        // Chunk 2 wins the tie against chunk 4 by fetch order and keeps rank 1
        assert_eq!(deduped[0].chunk.id, Uuid::from_u128(2));
        assert_eq!(deduped[0].fetch_rank, 1);
        assert_eq!(deduped[1].chunk.id, Uuid::from_u128(3));
    }

    #[test]
    fn test_noise_shapes() {
        let filter = NoiseFilter::new(&DenoiseConfig::default());

        assert!(filter.is_form_label("Name: ________\nDate:\nSignature: [ ]"));
        assert!(!filter.is_form_label(BODY));

        assert!(filter.is_bare_heading("## 3.2 Related Work"));
        assert!(filter.is_bare_heading("Introduction"));
        assert!(!filter.is_bare_heading(BODY));
        assert!(!filter.is_bare_heading("Line one\nLine two"));

        assert!(filter.is_short("Too short."));
        assert!(!filter.is_short(BODY));
        assert_eq!(filter.multiplier(BODY), 1.0);
    }

    #[test]
    fn test_penalties_multiply_without_dropping() {
        let filter = NoiseFilter::new(&DenoiseConfig::default());
        let pool = Candidate::pool(vec![chunk(1, "Introduction", 1.0), chunk(2, BODY, 1.0)]);

        let penalized = filter.penalize(pool);

        assert_eq!(penalized.len(), 2);
        // Heading (0.4) and short (0.6) both apply
        assert!((penalized[0].chunk.score - 0.24).abs() < 1e-6);
        assert!(penalized[0].penalized);
        assert!(!penalized[1].penalized);
    }

    #[test]
    fn test_budget_guard_keeps_sorted_prefix() {
        let pool = Candidate::pool(vec![
            chunk(1, &long_text(1), 0.2),
            chunk(2, &long_text(2), 0.9),
            chunk(3, &long_text(3), 0.5),
            chunk(4, &long_text(4), 0.5),
        ]);
        let per_chunk = pool[0].chunk.token_count;

        let (kept, dropped) = budget_guard(pool, Some(per_chunk * 2 + 1));

        assert_eq!(dropped, 2);
        let ids: Vec<_> = kept.iter().map(|c| c.chunk.id).collect();
        assert_eq!(ids, vec![Uuid::from_u128(2), Uuid::from_u128(3)]);
    }

    #[test]
    fn test_pipeline_stats_and_budget() {
        let mut chunks = Vec::new();
        for i in 0..20 {
            chunks.push(chunk(i as u128, &long_text(i % 5), 1.0 - i as f32 * 0.01));
        }
        let config = DenoiseConfig {
            token_budget: 60,
            ..DenoiseConfig::default()
        };

        let outcome = DenoisePipeline::new(config).run(chunks);

        assert_eq!(outcome.stats.raw, 20);
        assert_eq!(outcome.stats.deduped, 5);
        assert_eq!(outcome.stats.duplicates_removed, 15);
        assert_eq!(outcome.stats.penalized, 0);
        assert!(outcome.evidence.total_tokens() <= 60);
        assert!(outcome.stats.dropped > 0);
        assert_eq!(outcome.stats.final_count + outcome.stats.dropped, 5);
    }

    #[test]
    fn test_disabling_dedup_only_grows_pool() {
        let chunks = vec![chunk(1, BODY, 0.9), chunk(2, BODY, 0.8), chunk(3, "Introduction", 0.7)];
        let config = DenoiseConfig {
            enable_dedup: false,
            enable_budget_guard: false,
            ..DenoiseConfig::default()
        };

        let outcome = DenoisePipeline::new(config).run(chunks);

        assert_eq!(outcome.stats.deduped, 3);
        assert_eq!(outcome.stats.penalized, 1);
        assert_eq!(outcome.evidence.token_budget(), None);
        assert_eq!(outcome.evidence.chunks()[0].id, Uuid::from_u128(1));
    }

    #[test]
    fn test_rejected_payloads_are_counted() {
        let admitted = admit(vec![
            (EvidencePayload::Chunk(chunk(1, BODY, 0.0)), 0.5),
            (EvidencePayload::Chunk(chunk(2, "   ", 0.0)), 0.5),
            (EvidencePayload::Chunk(chunk(3, &long_text(3), f32::NAN)), 0.5),
            (EvidencePayload::Chunk(chunk(4, &long_text(4), 0.0)), f32::INFINITY),
        ]);
        assert_eq!(admitted.rejected, 3);
        assert_eq!(admitted.chunks[0].score, 0.5);

        let outcome = DenoisePipeline::default().run_admitted(admitted);

        assert_eq!(outcome.stats.raw, 4);
        assert_eq!(outcome.stats.rejected, 3);
        assert_eq!(outcome.evidence.len(), 1);
    }
}
