//! GraphForge Common Library
//!
//! Shared code for the GraphForge retrieval core including:
//! - Data model (chunks, entities, queries, evidence sets)
//! - Graph store contract and read-only store implementations
//! - Embedding and LLM provider abstractions
//! - Context denoising pipeline
//! - Error types and handling
//! - Configuration management
//! - Outbound call resilience (timeouts, retries, rate limiting)
//! - Metrics and observability

pub mod config;
pub mod denoise;
pub mod embeddings;
pub mod errors;
pub mod graph;
pub mod llm;
pub mod metrics;
pub mod models;
pub mod resilience;
pub mod text;

// Re-export commonly used types
pub use config::AppConfig;
pub use denoise::{DenoiseOutcome, DenoisePipeline};
pub use embeddings::Embedder;
pub use errors::{AppError, Result};
pub use graph::GraphStore;
pub use llm::LlmClient;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding model
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Default chat model
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
