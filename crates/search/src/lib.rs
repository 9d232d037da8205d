//! GraphForge Graph Retrieval Engine
//!
//! Seed-based traversal over the read-only property graph:
//! - Seed resolution from entity ids or free-text terms
//! - Bounded expansion over semantic, containment and similarity edges
//! - Decayed-path or personalized-propagation proximity
//! - Ranking with precomputed importance and community alignment
//! - Evidence assembly through the denoising pipeline

pub mod engine;
pub mod propagation;
pub mod ranking;
pub mod seeds;
pub mod semantic;
pub mod traversal;

pub use engine::{GraphRetriever, RetrievalGap, RetrievalMode, RetrievalOutcome, RetrievalRequest};
pub use ranking::RankedNode;
pub use seeds::SeedInput;
