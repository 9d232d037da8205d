//! Query/chunk similarity blend
//!
//! The query and every candidate chunk go to the embedder in a single
//! `embed_batch` call; the provider splits it into `batch_size` groups.

use graphforge_common::embeddings::{cosine_similarity, Embedder};
use graphforge_common::errors::{AppError, Result};
use graphforge_common::models::Chunk;

/// Blend cosine similarity into chunk scores:
/// `score = (1 - weight) * score + weight * max(0, cos(query, chunk))`
pub async fn blend_similarity(embedder: &dyn Embedder, query: &str, chunks: &mut [Chunk], weight: f32) -> Result<()> {
    if chunks.is_empty() || weight <= 0.0 {
        return Ok(());
    }

    let mut texts = Vec::with_capacity(chunks.len() + 1);
    texts.push(query.to_string());
    texts.extend(chunks.iter().map(|c| c.text.clone()));

    let vectors = embedder.embed_batch(&texts).await?;
    let Some((query_vector, chunk_vectors)) = vectors.split_first() else {
        return Err(AppError::EmbeddingError {
            message: "embedder returned no vectors".to_string(),
        });
    };
    if chunk_vectors.len() != chunks.len() {
        return Err(AppError::EmbeddingError {
            message: format!("expected {} vectors, got {}", texts.len(), vectors.len()),
        });
    }

    for (chunk, vector) in chunks.iter_mut().zip(chunk_vectors) {
        let similarity = cosine_similarity(query_vector, vector).max(0.0);
        chunk.score = (1.0 - weight) * chunk.score + weight * similarity;
    }
    Ok(())
}
