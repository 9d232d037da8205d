//! Configuration management for GraphForge
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default.toml, config/{APP_ENV}.toml, config/local.toml)
//! - Default values

use crate::errors::{AppError, Result};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Graph store database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// LLM provider configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Outbound provider rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Query router configuration
    #[serde(default)]
    pub router: RouterConfig,

    /// Graph retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Context denoising configuration
    #[serde(default)]
    pub denoise: DenoiseConfig,

    /// Multi-hop workflow configuration
    #[serde(default)]
    pub workflow: WorkflowConfig,

    /// Synthesis configuration
    #[serde(default)]
    pub synthesis: SynthesisConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum concurrent requests
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary graph store URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

/// Timeout, retry and output contract for one kind of provider call
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CallPolicy {
    pub timeout_ms: u64,
    /// Retries for transient failures (timeouts, 5xx)
    pub max_retries: u32,
    /// Retries while the provider keeps throttling
    pub max_rate_limit_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Output token ceiling (0 means not applicable)
    pub max_tokens: usize,
}

impl CallPolicy {
    pub fn new(timeout_ms: u64, max_retries: u32, max_tokens: usize) -> Self {
        Self {
            timeout_ms,
            max_retries,
            max_tokens,
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 1,
            max_rate_limit_retries: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            max_tokens: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Chat provider. Only `openai` can be built from config.
    pub provider: String,

    /// API key for the chat provider
    pub api_key: Option<String>,

    /// API base URL (for OpenAI-compatible endpoints)
    pub api_base: Option<String>,

    /// Chat model
    pub model: String,

    /// Route classification call
    pub classification: CallPolicy,

    /// Query decomposition call
    pub decomposition: CallPolicy,

    /// Answer synthesis call
    pub synthesis: CallPolicy,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            api_key: None,
            api_base: None,
            model: crate::DEFAULT_CHAT_MODEL.to_string(),
            classification: CallPolicy::new(10_000, 1, 16),
            decomposition: CallPolicy::new(20_000, 1, 512),
            synthesis: CallPolicy::new(60_000, 1, 900),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, hashing, none
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    pub model: String,

    /// Embedding dimension
    pub dimension: usize,

    /// Texts per embedding request
    pub batch_size: usize,

    /// Call contract for one batch request
    pub policy: CallPolicy,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            api_key: None,
            api_base: None,
            model: crate::DEFAULT_EMBEDDING_MODEL.to_string(),
            dimension: 256,
            batch_size: 64,
            policy: CallPolicy::new(30_000, 3, 0),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Outbound provider requests per second
    pub requests_per_second: u32,

    /// Burst capacity
    pub burst: u32,

    /// Enable outbound pacing
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 20,
            burst: 40,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Heuristic confidence needed to skip the classifier
    pub confidence_threshold: f32,

    /// Call the classifier when heuristics are not confident
    pub enable_classifier: bool,

    /// Longest query (in words) still eligible for fast lookup
    pub fast_lookup_max_words: usize,

    /// Live sessions kept by the registry
    pub max_sessions: usize,

    /// Route decisions cached per session; the oldest is evicted first
    pub max_cached_routes: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.75,
            enable_classifier: true,
            fast_lookup_max_words: 12,
            max_sessions: 10_000,
            max_cached_routes: 256,
        }
    }
}

/// How seed proximity is computed over the expanded subgraph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Propagation {
    /// Decayed best-path proximity from the nearest seed
    Bfs,
    /// Personalized PageRank teleporting to the seeds
    Personalized,
}

/// Multiplier per edge kind applied during expansion
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EdgeWeights {
    pub semantic: f32,
    pub contains: f32,
    pub similar_to: f32,
}

impl Default for EdgeWeights {
    fn default() -> Self {
        Self {
            semantic: 1.0,
            contains: 0.7,
            similar_to: 0.5,
        }
    }
}

/// Weights of the final node rank. Empirically tuned; toggle one at a time
/// (set to 0.0) to measure its contribution.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RankingWeights {
    pub proximity: f32,
    pub importance: f32,
    pub community: f32,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            proximity: 0.6,
            importance: 0.25,
            community: 0.15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Hops for fast-path lookups
    pub fast_max_hops: usize,

    /// Hops for full traversal
    pub full_max_hops: usize,

    /// Cap on nodes collected during expansion
    pub max_expanded_nodes: usize,

    /// Ranked nodes kept in fast mode
    pub fast_max_ranked: usize,

    /// Ranked nodes kept in full mode
    pub full_max_ranked: usize,

    /// Candidate terms sent to entity resolution
    pub max_seed_terms: usize,

    /// Proximity decay per hop (bfs propagation)
    pub hop_decay: f32,

    pub edge_weights: EdgeWeights,

    pub weights: RankingWeights,

    pub propagation: Propagation,

    /// Damping factor for personalized propagation
    pub damping: f32,

    /// Iteration cap for personalized propagation
    pub propagation_iterations: usize,

    /// Per-read graph store timeout
    pub graph_timeout_ms: u64,

    /// Weight of query/chunk embedding similarity in chunk scores (0 disables)
    pub semantic_weight: f32,
}

impl RetrievalConfig {
    pub fn graph_timeout(&self) -> Duration {
        Duration::from_millis(self.graph_timeout_ms)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            fast_max_hops: 1,
            full_max_hops: 2,
            max_expanded_nodes: 200,
            fast_max_ranked: 8,
            full_max_ranked: 24,
            max_seed_terms: 16,
            hop_decay: 0.5,
            edge_weights: EdgeWeights::default(),
            weights: RankingWeights::default(),
            propagation: Propagation::Bfs,
            damping: 0.85,
            propagation_iterations: 30,
            graph_timeout_ms: 5_000,
            semantic_weight: 0.0,
        }
    }
}

/// Denoising layer toggles and parameters
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DenoiseConfig {
    pub enable_dedup: bool,
    pub enable_noise_filter: bool,
    pub enable_budget_guard: bool,

    /// Token budget for the assembled context
    pub token_budget: usize,

    /// Chunks shorter than this (in characters) are penalized
    pub min_content_chars: usize,

    /// Score multiplier for form-label-only chunks
    pub form_label_penalty: f32,

    /// Score multiplier for bare headings
    pub heading_penalty: f32,

    /// Score multiplier for chunks under `min_content_chars`
    pub short_content_penalty: f32,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        Self {
            enable_dedup: true,
            enable_noise_filter: true,
            enable_budget_guard: true,
            token_budget: 6_000,
            min_content_chars: 60,
            form_label_penalty: 0.3,
            heading_penalty: 0.4,
            short_content_penalty: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Concurrent sub-question workers
    pub max_concurrency: usize,

    /// Cap on sub-questions produced by decomposition
    pub max_sub_questions: usize,

    /// Deadline for the whole fan-out stage
    pub global_timeout_ms: u64,
}

impl WorkflowConfig {
    pub fn global_timeout(&self) -> Duration {
        Duration::from_millis(self.global_timeout_ms)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_sub_questions: 5,
            global_timeout_ms: 45_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Characters of chunk text kept in citation previews
    pub preview_chars: usize,

    pub concise_max_tokens: usize,
    pub standard_max_tokens: usize,
    pub detailed_max_tokens: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            preview_chars: 200,
            concise_max_tokens: 400,
            standard_max_tokens: 900,
            detailed_max_tokens: 1600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error) or a full EnvFilter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for logs
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 90 }
fn default_max_concurrent() -> usize { 64 }
fn default_database_url() -> String { "postgres://localhost/graphforge".to_string() }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "graphforge".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            max_concurrent_requests: default_max_concurrent(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            read_url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__WORKFLOW__MAX_CONCURRENCY=8
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Reject values that would break pipeline invariants
    pub fn validate(&self) -> Result<()> {
        if self.denoise.token_budget == 0 {
            return Err(config_error("denoise.token_budget must be positive"));
        }
        for (name, penalty) in [
            ("form_label_penalty", self.denoise.form_label_penalty),
            ("heading_penalty", self.denoise.heading_penalty),
            ("short_content_penalty", self.denoise.short_content_penalty),
        ] {
            if !(penalty > 0.0 && penalty <= 1.0) {
                return Err(config_error(&format!("denoise.{} must be in (0, 1]", name)));
            }
        }
        if self.server.max_concurrent_requests == 0 {
            return Err(config_error("server.max_concurrent_requests must be positive"));
        }
        if self.router.max_sessions == 0 || self.router.max_cached_routes == 0 {
            return Err(config_error("router session limits must be positive"));
        }
        if self.workflow.max_concurrency == 0 {
            return Err(config_error("workflow.max_concurrency must be positive"));
        }
        if self.workflow.max_sub_questions == 0 {
            return Err(config_error("workflow.max_sub_questions must be positive"));
        }
        if self.embedding.batch_size == 0 {
            return Err(config_error("embedding.batch_size must be positive"));
        }

        let r = &self.retrieval;
        let weights = [
            ("weights.proximity", r.weights.proximity),
            ("weights.importance", r.weights.importance),
            ("weights.community", r.weights.community),
            ("edge_weights.semantic", r.edge_weights.semantic),
            ("edge_weights.contains", r.edge_weights.contains),
            ("edge_weights.similar_to", r.edge_weights.similar_to),
            ("hop_decay", r.hop_decay),
            ("semantic_weight", r.semantic_weight),
        ];
        for (name, value) in weights {
            if !value.is_finite() || value < 0.0 {
                return Err(config_error(&format!("retrieval.{} must be a non-negative number", name)));
            }
        }
        if r.semantic_weight > 1.0 {
            return Err(config_error("retrieval.semantic_weight must be at most 1.0"));
        }
        if !(r.damping > 0.0 && r.damping < 1.0) {
            return Err(config_error("retrieval.damping must be in (0, 1)"));
        }

        Ok(())
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}

fn config_error(message: &str) -> AppError {
    AppError::Configuration {
        message: message.to_string(),
    }
}
