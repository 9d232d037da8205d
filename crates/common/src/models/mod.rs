//! Request-scoped data model for the retrieval core
//!
//! Chunks and entities are owned by the indexing collaborator and only read
//! here; everything else lives for the duration of one request.

mod chunk;
mod entity;
mod evidence;
mod query;

pub use chunk::{Chunk, PageRange};
pub use entity::{EdgeKind, Entity, GraphEdge, TextUnit};
pub use evidence::{AggregateSummary, ContextStats, EvidencePayload, EvidenceSet, PayloadRejection};
pub use query::{Query, Route, SamplingConfig, Verbosity};
