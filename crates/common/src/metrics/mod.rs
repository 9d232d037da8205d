//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with SLO-aligned histograms
//! and standardized naming conventions.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all GraphForge metrics
pub const METRICS_PREFIX: &str = "graphforge";

/// SLO-aligned histogram buckets for in-process stages (in seconds)
/// Targets: retrieval P50 < 50ms, P99 < 150ms
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001,  // 1ms
    0.005,  // 5ms
    0.010,  // 10ms
    0.025,  // 25ms
    0.050,  // 50ms - P50 target
    0.075,  // 75ms
    0.100,  // 100ms
    0.150,  // 150ms - P99 target
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s
];

/// Buckets for provider calls and end-to-end answers (typically slower)
pub const PROVIDER_BUCKETS: &[f64] = &[
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.000,  // 2s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
    60.00,  // 60s
];

/// Histograms exported with [`PROVIDER_BUCKETS`]
pub const PROVIDER_HISTOGRAMS: &[&str] = &[
    "answer_duration_seconds",
    "provider_call_duration_seconds",
    "synthesis_duration_seconds",
];

fn name(suffix: &str) -> String {
    format!("{}_{}", METRICS_PREFIX, suffix)
}

/// Register all metric descriptions
pub fn register_metrics() {
    // Answer metrics
    describe_counter!(name("answers_total"), Unit::Count, "Answered requests by route and outcome");
    describe_histogram!(name("answer_duration_seconds"), Unit::Seconds, "End-to-end answer latency in seconds");

    // Routing metrics
    describe_counter!(name("route_decisions_total"), Unit::Count, "Route decisions by route and decision source");
    describe_counter!(name("route_cache_hits_total"), Unit::Count, "Route cache hits");
    describe_counter!(name("route_cache_misses_total"), Unit::Count, "Route cache misses");

    // Retrieval metrics
    describe_histogram!(name("retrieval_duration_seconds"), Unit::Seconds, "Graph retrieval latency in seconds");
    describe_gauge!(name("retrieval_nodes_count"), Unit::Count, "Ranked nodes produced by the last retrieval");
    describe_counter!(name("graph_timeouts_total"), Unit::Count, "Graph store reads that exceeded their budget");

    // Denoising metrics
    describe_counter!(name("denoise_raw_total"), Unit::Count, "Candidates entering the denoising pipeline");
    describe_counter!(name("denoise_duplicates_total"), Unit::Count, "Candidates collapsed by deduplication");
    describe_counter!(name("denoise_penalized_total"), Unit::Count, "Candidates penalized by the noise filter");
    describe_counter!(name("denoise_dropped_total"), Unit::Count, "Candidates cut by the token budget guard");
    describe_histogram!(name("context_tokens"), Unit::Count, "Tokens in the final evidence set");

    // Workflow metrics
    describe_counter!(name("sub_questions_total"), Unit::Count, "Sub-question retrievals by outcome");

    // Provider metrics
    describe_counter!(name("provider_calls_total"), Unit::Count, "Outbound provider calls by kind and status");
    describe_histogram!(name("provider_call_duration_seconds"), Unit::Seconds, "Outbound provider call latency in seconds");

    // Synthesis metrics
    describe_histogram!(name("synthesis_duration_seconds"), Unit::Seconds, "Synthesis latency in seconds");
    describe_counter!(name("citations_stripped_total"), Unit::Count, "Citation markers removed for pointing outside the evidence set");

    tracing::info!("Metrics registered");
}

/// Helper to time a stage and record it on drop of the guard
pub struct StageTimer {
    start: Instant,
}

impl StageTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Record a route decision
pub fn record_route(route: &str, source: &str) {
    counter!(name("route_decisions_total"), "route" => route.to_string(), "source" => source.to_string())
        .increment(1);
}

/// Record a route cache lookup
pub fn record_route_cache(hit: bool) {
    if hit {
        counter!(name("route_cache_hits_total")).increment(1);
    } else {
        counter!(name("route_cache_misses_total")).increment(1);
    }
}

/// Record denoising layer counts
pub fn record_denoise(raw: usize, duplicates: usize, penalized: usize, dropped: usize, final_tokens: usize) {
    counter!(name("denoise_raw_total")).increment(raw as u64);
    counter!(name("denoise_duplicates_total")).increment(duplicates as u64);
    counter!(name("denoise_penalized_total")).increment(penalized as u64);
    counter!(name("denoise_dropped_total")).increment(dropped as u64);
    histogram!(name("context_tokens")).record(final_tokens as f64);
}

/// Record one retrieval pass
pub fn record_retrieval(duration_secs: f64, mode: &str, node_count: usize) {
    histogram!(name("retrieval_duration_seconds"), "mode" => mode.to_string()).record(duration_secs);
    gauge!(name("retrieval_nodes_count"), "mode" => mode.to_string()).set(node_count as f64);
}

/// Record a graph read that ran past its timeout
pub fn record_graph_timeout(operation: &str) {
    counter!(name("graph_timeouts_total"), "operation" => operation.to_string()).increment(1);
}

/// Record a settled sub-question
pub fn record_sub_question(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!(name("sub_questions_total"), "outcome" => outcome).increment(1);
}

/// Record an outbound provider attempt. `status` is one of
/// success, error, retry, rate_limited, timeout.
pub fn record_provider_call(kind: &str, status: &str, duration_secs: f64) {
    counter!(name("provider_calls_total"), "kind" => kind.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(name("provider_call_duration_seconds"), "kind" => kind.to_string()).record(duration_secs);
}

/// Record a synthesis pass
pub fn record_synthesis(duration_secs: f64, answer_kind: &str, stripped_citations: usize) {
    histogram!(name("synthesis_duration_seconds"), "answer_kind" => answer_kind.to_string())
        .record(duration_secs);
    if stripped_citations > 0 {
        counter!(name("citations_stripped_total")).increment(stripped_citations as u64);
    }
}

/// Record a finished request
pub fn record_answer(duration_secs: f64, route: &str, outcome: &str) {
    counter!(name("answers_total"), "route" => route.to_string(), "outcome" => outcome.to_string())
        .increment(1);
    histogram!(name("answer_duration_seconds"), "route" => route.to_string()).record(duration_secs);
}
