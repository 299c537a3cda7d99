//! knowledge-rag - hybrid document retrieval engine
//!
//! Documents (pdf, docx, doc, txt, md, xlsx, xls) are normalized to text,
//! chunked, embedded and stored per owner in SQLite. Search fuses a vector
//! similarity channel and a keyword channel with Reciprocal Rank Fusion.

pub mod cli;
pub mod collector;
pub mod embedding;
pub mod extractor;
pub mod knowledge;

// Re-exports
pub use embedding::{
    create_embedder, get_api_key, has_api_key, EmbeddingConfig, EmbeddingProvider, HashEmbedding,
    OpenAiCompatibleEmbedding,
};
pub use extractor::{DisplayType, DocumentNormalizer, FileFormat, FormatParser};
pub use knowledge::{
    get_data_dir, ChunkConfig, Chunker, FileDetail, FileListing, FileSummary, FusionConfig,
    HybridRetriever, KnowledgeError, KnowledgeResult, KnowledgeStore, Passage, RetrieverConfig,
    SearchMethod, SearchResponse, SearchResult, UploadReport, VectorStore,
};
