//! Vector Store - passage storage trait and similarity utilities
//!
//! The retriever only talks to storage through [`VectorStore`]; the SQLite
//! implementation lives in `store.rs`.

use async_trait::async_trait;

use super::error::KnowledgeResult;
use super::store::Passage;

// ============================================================================
// Types
// ============================================================================

/// Passage row staged for insertion
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub owner_id: i64,
    pub file_name: String,
    /// Ingestion generation tag, invisible to queries until published
    pub generation: String,
    /// 0-based position within the file
    pub chunk_index: usize,
    /// Sanitized chunk text (non-empty, no null bytes)
    pub content: String,
    pub preview: String,
    /// Byte size of the originating file
    pub size: u64,
    pub display_type: String,
    pub embedding: Vec<f32>,
}

/// Delete/scope filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassageFilter {
    pub owner_id: i64,
    /// `None` matches every file of the owner
    pub file_name: Option<String>,
}

impl PassageFilter {
    pub fn owner(owner_id: i64) -> Self {
        Self {
            owner_id,
            file_name: None,
        }
    }

    pub fn file(owner_id: i64, file_name: impl Into<String>) -> Self {
        Self {
            owner_id,
            file_name: Some(file_name.into()),
        }
    }
}

/// Similarity-ranked query hit
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub passage: Passage,
    /// `1 - cosine_distance`
    pub similarity: f32,
}

// ============================================================================
// VectorStore Trait
// ============================================================================

/// Passage storage with a vector column
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert staged rows, returning the number written
    async fn insert_batch(&self, entries: &[VectorEntry]) -> KnowledgeResult<usize>;

    /// Delete every passage matching the filter, returning the number removed
    async fn delete_by_filter(&self, filter: &PassageFilter) -> KnowledgeResult<usize>;

    /// Owner-scoped passages by descending similarity.
    ///
    /// With a threshold, only hits with `similarity >= threshold` are returned.
    async fn query_similar(
        &self,
        owner_id: i64,
        query_embedding: &[f32],
        limit: usize,
        threshold: Option<f32>,
    ) -> KnowledgeResult<Vec<VectorMatch>>;
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Cosine similarity in `[-1.0, 1.0]`; 0.0 for mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Serialize an embedding as little-endian f32 bytes
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`encode_embedding`]; trailing partial floats are ignored
pub fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
