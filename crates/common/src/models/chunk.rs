//! Text chunk produced by the indexing collaborator

use crate::text::{content_hash, estimate_tokens};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Page or section span of a chunk within its source document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,

    pub text: String,

    /// Digest of the normalized text; equal hashes mean duplicate content
    pub content_hash: String,

    pub document_id: Uuid,

    pub document_title: String,

    pub pages: Option<PageRange>,

    pub section: Option<String>,

    /// Retrieval score, higher is better
    pub score: f32,

    /// Token count for context budgeting
    pub token_count: usize,
}

impl Chunk {
    /// Build a chunk, deriving its content hash and token count from the text
    pub fn new(
        id: Uuid,
        document_id: Uuid,
        document_title: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let text = text.into();
        Self {
            id,
            content_hash: content_hash(&text),
            token_count: estimate_tokens(&text),
            text,
            document_id,
            document_title: document_title.into(),
            pages: None,
            section: None,
            score: 0.0,
        }
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = score;
        self
    }

    pub fn with_pages(mut self, start: u32, end: u32) -> Self {
        self.pages = Some(PageRange { start, end });
        self
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_derives_hash_and_tokens() {
        let a = Chunk::new(Uuid::from_u128(1), Uuid::from_u128(10), "Doc", "Same text here.");
        let b = Chunk::new(Uuid::from_u128(2), Uuid::from_u128(11), "Other", "same   TEXT here.");

        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.token_count, 4);
        assert_eq!(a.score, 0.0);
    }
}
