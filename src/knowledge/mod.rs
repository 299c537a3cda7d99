//! Knowledge module - owner-scoped hybrid retrieval store
//!
//! - Store: SQLite passages, generation pointers, keyword matching
//! - Vector: embedding storage + cosine similarity behind `VectorStore`
//! - Hybrid: ingestion pipeline and RRF fusion of both channels
//! - Chunker: recursive separator-based text splitting with overlap

mod chunker;
mod error;
mod hybrid;
mod keywords;
mod lock;
mod store;
mod vector;

// Re-exports
pub use chunker::{default_chunker, recursive_chunker, ChunkConfig, Chunker, RecursiveChunker};
pub use error::{KnowledgeError, KnowledgeResult};
pub use hybrid::{
    fuse_rankings, FileDetail, FileListing, FusionConfig, HybridRetriever, RetrieverConfig,
    RetrieverStats, SearchMethod, SearchResponse, SearchResult, UploadReport,
    DEFAULT_MIN_SIMILARITY, DEFAULT_PAGE_SIZE, DEFAULT_SEARCH_LIMIT, MAX_PAGE_SIZE,
};
pub use keywords::{escape_like, KeywordExtractor, DEFAULT_MAX_KEYWORDS};
pub use lock::{IngestGuard, IngestLocks};
pub use store::{get_data_dir, FileSummary, KeywordMatch, KnowledgeStore, Passage, StoreStats};
pub use vector::{
    cosine_similarity, decode_embedding, encode_embedding, PassageFilter, VectorEntry,
    VectorMatch, VectorStore,
};
