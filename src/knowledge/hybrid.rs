//! Hybrid retrieval - ingestion, vector + keyword search, RRF fusion
//!
//! Ingestion: normalize → chunk → embed → stage under a new generation →
//! publish. The previous generation of a file stays visible until the new
//! one is published, and a failed ingestion discards only its own rows.
//!
//! Search runs the vector and keyword channels concurrently and fuses the
//! two rankings with weighted Reciprocal Rank Fusion. If one channel fails
//! the other one is used alone.
//!
//! ref: https://www.elastic.co/blog/hybrid-search-rrf

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;

use crate::embedding::EmbeddingProvider;
use crate::extractor::{file_extension, DisplayType, DocumentNormalizer, FileFormat, NormalizedDocument};

use super::chunker::{recursive_chunker, ChunkConfig, Chunker};
use super::error::{KnowledgeError, KnowledgeResult};
use super::keywords::{KeywordExtractor, DEFAULT_MAX_KEYWORDS};
use super::lock::IngestLocks;
use super::store::{get_data_dir, FileSummary, KeywordMatch, KnowledgeStore, Passage, StoreStats};
use super::vector::{PassageFilter, VectorEntry, VectorMatch, VectorStore};

pub const DEFAULT_SEARCH_LIMIT: usize = 5;
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.3;
pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;
pub const DEFAULT_EMBED_BATCH_SIZE: usize = 25;

// ============================================================================
// Configuration
// ============================================================================

/// Weighted RRF parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionConfig {
    /// Smoothing constant; larger values flatten the rank curve
    pub k: f64,
    pub vector_weight: f64,
    pub keyword_weight: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            k: 60.0,
            vector_weight: 0.7,
            keyword_weight: 0.3,
        }
    }
}

/// Retriever configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrieverConfig {
    pub chunk: ChunkConfig,
    pub fusion: FusionConfig,
    /// Preview length in characters
    pub preview_chars: usize,
    /// Embedding requests in flight per ingestion
    pub embed_concurrency: usize,
    /// Chunks per `embed_batch` call
    pub embed_batch_size: usize,
    pub max_keywords: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            chunk: ChunkConfig::default(),
            fusion: FusionConfig::default(),
            preview_chars: 200,
            embed_concurrency: 1,
            embed_batch_size: DEFAULT_EMBED_BATCH_SIZE,
            max_keywords: DEFAULT_MAX_KEYWORDS,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Result of one ingestion
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReport {
    pub file_name: String,
    #[serde(rename = "type")]
    pub display_type: String,
    pub chunk_count: usize,
}

/// Which channel(s) produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    Vector,
    Keyword,
    Hybrid,
}

/// Fused search hit
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: i64,
    pub file_name: String,
    pub content: String,
    pub preview: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub display_type: String,
    /// Vector similarity, if the vector channel returned this passage
    pub similarity: Option<f32>,
    /// Number of query keywords contained in the passage
    pub keyword_score: usize,
    pub hybrid_score: f64,
    pub method: SearchMethod,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
}

/// One page of grouped files
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileListing {
    pub items: Vec<FileSummary>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

/// File reconstructed from its passages
///
/// Passages are concatenated as stored, so overlap regions appear twice.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDetail {
    pub id: i64,
    pub file_name: String,
    #[serde(rename = "type")]
    pub display_type: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieverStats {
    #[serde(flatten)]
    pub store: StoreStats,
    pub embedder: String,
    pub dimension: usize,
}

// ============================================================================
// HybridRetriever
// ============================================================================

/// Hybrid retriever
///
/// Owns the passage store, the embedding provider, the chunker, the
/// normalizer and the per-file ingestion locks.
pub struct HybridRetriever {
    store: KnowledgeStore,
    vector: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Box<dyn Chunker>,
    normalizer: Arc<DocumentNormalizer>,
    keywords: KeywordExtractor,
    locks: IngestLocks,
    config: RetrieverConfig,
}

impl HybridRetriever {
    pub fn new(store: KnowledgeStore, embedder: Arc<dyn EmbeddingProvider>) -> KnowledgeResult<Self> {
        Self::with_config(store, embedder, RetrieverConfig::default())
    }

    pub fn with_config(
        store: KnowledgeStore,
        embedder: Arc<dyn EmbeddingProvider>,
        config: RetrieverConfig,
    ) -> KnowledgeResult<Self> {
        config.chunk.validate()?;

        Ok(Self {
            vector: Arc::new(store.clone()),
            store,
            embedder,
            chunker: recursive_chunker(config.chunk),
            normalizer: Arc::new(DocumentNormalizer::new()),
            keywords: KeywordExtractor::new(config.max_keywords),
            locks: IngestLocks::new(),
            config,
        })
    }

    /// Open `<data_dir>/knowledge.db`
    pub fn open(data_dir: &Path, embedder: Arc<dyn EmbeddingProvider>) -> KnowledgeResult<Self> {
        let store = KnowledgeStore::open(&data_dir.join("knowledge.db"))?;
        Self::new(store, embedder)
    }

    /// Open at the default data directory
    pub fn open_default(embedder: Arc<dyn EmbeddingProvider>) -> KnowledgeResult<Self> {
        Self::open(&get_data_dir(), embedder)
    }

    /// Replace the vector channel (inserts and similarity queries)
    pub fn with_vector_store(mut self, vector: Arc<dyn VectorStore>) -> Self {
        self.vector = vector;
        self
    }

    pub fn with_normalizer(mut self, normalizer: DocumentNormalizer) -> Self {
        self.normalizer = Arc::new(normalizer);
        self
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------------

    /// Ingest a file, replacing any previous generation of the same name.
    ///
    /// Failures surface as `IngestionFailed(cause)`.
    pub async fn upload_file(
        &self,
        owner_id: i64,
        bytes: Vec<u8>,
        file_name: &str,
        mime_type: &str,
    ) -> KnowledgeResult<UploadReport> {
        let _guard = self.locks.acquire(owner_id, file_name).await;

        self.ingest(owner_id, bytes, file_name, mime_type)
            .await
            .map_err(|e| {
                tracing::warn!("Ingestion of {} for owner {} failed: {}", file_name, owner_id, e);
                e.into_ingestion_failure()
            })
    }

    async fn ingest(
        &self,
        owner_id: i64,
        bytes: Vec<u8>,
        file_name: &str,
        mime_type: &str,
    ) -> KnowledgeResult<UploadReport> {
        let size = bytes.len() as u64;
        let document = self.normalize(bytes, file_name).await?;

        let display_type = DisplayType::resolve(&file_extension(file_name), mime_type);
        let preview = make_preview(
            &document.text,
            document.format == FileFormat::Md,
            self.config.preview_chars,
        );

        let chunks: Vec<String> = self
            .chunker
            .chunk(&document.text)
            .into_iter()
            .map(|chunk| sanitize_content(&chunk))
            .filter(|chunk| !chunk.trim().is_empty())
            .collect();

        if chunks.is_empty() {
            return Err(KnowledgeError::EmptyContent);
        }
        tracing::debug!("{}: {} chunks via {}", file_name, chunks.len(), self.chunker.name());

        let batches: Vec<Vec<String>> = chunks
            .chunks(self.config.embed_batch_size.max(1))
            .map(<[String]>::to_vec)
            .collect();
        let embeddings: Vec<Vec<f32>> = stream::iter(batches)
            .map(|batch| self.embed_chunks(batch))
            .buffered(self.config.embed_concurrency.max(1))
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .flatten()
            .collect();

        let generation = uuid::Uuid::new_v4().to_string();
        let display = display_type.to_string();
        let entries: Vec<VectorEntry> = chunks
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(chunk_index, (content, embedding))| VectorEntry {
                owner_id,
                file_name: file_name.to_string(),
                generation: generation.clone(),
                chunk_index,
                content,
                preview: preview.clone(),
                size,
                display_type: display.clone(),
                embedding,
            })
            .collect();
        let chunk_count = entries.len();

        let removed = match self.stage_and_publish(owner_id, file_name, &generation, &entries).await {
            Ok(removed) => removed,
            Err(e) => {
                let file = file_name.to_string();
                let tag = generation.clone();
                if let Err(cleanup) = self
                    .store
                    .run_blocking(move |store| store.discard_generation(owner_id, &file, &tag))
                    .await
                {
                    tracing::warn!("Failed to discard generation {}: {}", generation, cleanup);
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Ingested {} for owner {} ({} chunks, replaced {} passages)",
            file_name,
            owner_id,
            chunk_count,
            removed
        );

        Ok(UploadReport {
            file_name: file_name.to_string(),
            display_type: display,
            chunk_count,
        })
    }

    /// Parse on the blocking pool; a panicking parser becomes `CorruptDocument`
    async fn normalize(&self, bytes: Vec<u8>, file_name: &str) -> KnowledgeResult<NormalizedDocument> {
        let normalizer = Arc::clone(&self.normalizer);
        let name = file_name.to_string();

        match tokio::task::spawn_blocking(move || normalizer.normalize(&bytes, &name)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(KnowledgeError::CorruptDocument(format!(
                "parser crashed while reading {}",
                file_name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn stage_and_publish(
        &self,
        owner_id: i64,
        file_name: &str,
        generation: &str,
        entries: &[VectorEntry],
    ) -> KnowledgeResult<usize> {
        self.vector.insert_batch(entries).await?;

        let file = file_name.to_string();
        let tag = generation.to_string();
        self.store
            .run_blocking(move |store| store.publish_generation(owner_id, &file, &tag))
            .await
    }

    async fn embed_text(&self, text: &str) -> KnowledgeResult<Vec<f32>> {
        let embedding = self
            .embedder
            .embed(text)
            .await
            .map_err(|e| KnowledgeError::EmbeddingProvider(format!("{:#}", e)))?;

        self.check_dimension(&embedding)?;
        Ok(embedding)
    }

    /// One `embed_batch` call; the provider must answer every input
    async fn embed_chunks(&self, texts: Vec<String>) -> KnowledgeResult<Vec<Vec<f32>>> {
        let embeddings = self
            .embedder
            .embed_batch(&texts)
            .await
            .map_err(|e| KnowledgeError::EmbeddingProvider(format!("{:#}", e)))?;

        if embeddings.len() != texts.len() {
            return Err(KnowledgeError::EmbeddingProvider(format!(
                "{} returned {} embeddings for {} inputs",
                self.embedder.name(),
                embeddings.len(),
                texts.len()
            )));
        }
        for embedding in &embeddings {
            self.check_dimension(embedding)?;
        }
        Ok(embeddings)
    }

    fn check_dimension(&self, embedding: &[f32]) -> KnowledgeResult<()> {
        let expected = self.embedder.dimension();
        if embedding.len() != expected {
            return Err(KnowledgeError::EmbeddingProvider(format!(
                "{} returned {} dimensions, expected {}",
                self.embedder.name(),
                embedding.len(),
                expected
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------------

    /// Hybrid search over the owner's passages
    pub async fn search(
        &self,
        owner_id: i64,
        query: &str,
        limit: usize,
        min_similarity: f32,
    ) -> KnowledgeResult<SearchResponse> {
        validate_search(query, limit, min_similarity)?;
        let candidates = limit.saturating_mul(2);

        let (vector, keyword) = tokio::join!(
            self.vector_search(owner_id, query, candidates, min_similarity),
            self.keyword_search(owner_id, query, candidates),
        );

        let (vector_hits, keyword_hits) = match (vector, keyword) {
            (Ok(v), Ok(k)) => (v, k),
            (Ok(v), Err(e)) => {
                tracing::warn!("Keyword search failed, using vector results only: {}", e);
                (v, Vec::new())
            }
            (Err(e), Ok(k)) => {
                tracing::warn!("Vector search failed, using keyword results only: {}", e);
                (Vec::new(), k)
            }
            (Err(vector_err), Err(keyword_err)) => {
                tracing::warn!("Keyword search failed: {}", keyword_err);
                return Err(vector_err.into_search_failure());
            }
        };

        tracing::debug!(
            "Search candidates: {} vector, {} keyword",
            vector_hits.len(),
            keyword_hits.len()
        );

        let results = fuse_rankings(&vector_hits, &keyword_hits, limit, &self.config.fusion);
        Ok(SearchResponse { results })
    }

    /// Vector channel: owner-scoped passages with `similarity >= min_similarity`
    pub async fn vector_search(
        &self,
        owner_id: i64,
        query: &str,
        limit: usize,
        min_similarity: f32,
    ) -> KnowledgeResult<Vec<VectorMatch>> {
        let query_embedding = self.embed_text(query).await?;
        self.vector
            .query_similar(owner_id, &query_embedding, limit, Some(min_similarity))
            .await
    }

    /// Keyword channel: passages ranked by matched keyword count
    pub async fn keyword_search(
        &self,
        owner_id: i64,
        query: &str,
        limit: usize,
    ) -> KnowledgeResult<Vec<KeywordMatch>> {
        let keywords = self.keywords.extract(query);
        if keywords.is_empty() {
            tracing::debug!("No keywords in query, keyword channel empty");
            return Ok(Vec::new());
        }

        tracing::debug!("Keywords: {:?}", keywords);
        self.store
            .run_blocking(move |store| store.search_keywords(owner_id, &keywords, limit))
            .await
    }

    // ------------------------------------------------------------------------
    // Listing / Detail / Delete
    // ------------------------------------------------------------------------

    /// Files of an owner, newest first
    pub async fn list(&self, owner_id: i64, page: usize, page_size: usize) -> KnowledgeResult<FileListing> {
        self.list_filtered(owner_id, page, page_size, &[]).await
    }

    /// [`list`](Self::list) restricted to the given display types (empty = all)
    pub async fn list_filtered(
        &self,
        owner_id: i64,
        page: usize,
        page_size: usize,
        types: &[DisplayType],
    ) -> KnowledgeResult<FileListing> {
        if page == 0 {
            return Err(KnowledgeError::Validation("page must be at least 1".to_string()));
        }
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(KnowledgeError::Validation(format!(
                "pageSize must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        let offset = (page - 1)
            .checked_mul(page_size)
            .filter(|offset| i64::try_from(*offset).is_ok())
            .ok_or_else(|| KnowledgeError::Validation("page is out of range".to_string()))?;
        let labels: Vec<String> = types.iter().map(|t| t.to_string()).collect();
        let (items, total) = self
            .store
            .run_blocking(move |store| store.list_files(owner_id, &labels, page_size, offset))
            .await?;

        Ok(FileListing {
            items,
            total,
            page,
            page_size,
            total_pages: total.div_ceil(page_size),
        })
    }

    /// Delete a file's passages; `id` must be one of its passages owned by `owner_id`
    pub async fn delete(&self, owner_id: i64, id: i64, file_name: &str) -> KnowledgeResult<usize> {
        let _guard = self.locks.acquire(owner_id, file_name).await;

        let file = file_name.to_string();
        let exists = self
            .store
            .run_blocking(move |store| store.passage_exists(owner_id, id, &file))
            .await?;
        if !exists {
            return Err(KnowledgeError::NotFoundOrUnauthorized);
        }

        let removed = self
            .vector
            .delete_by_filter(&PassageFilter::file(owner_id, file_name))
            .await?;

        tracing::info!("Deleted {} for owner {} ({} passages)", file_name, owner_id, removed);
        Ok(removed)
    }

    /// Reconstruct the file that passage `id` belongs to
    pub async fn detail(&self, owner_id: i64, id: i64) -> KnowledgeResult<FileDetail> {
        let (passage, passages) = self
            .store
            .run_blocking(move |store| {
                let passage = store
                    .find_passage(owner_id, id)?
                    .ok_or(KnowledgeError::NotFoundOrUnauthorized)?;
                let passages = store.file_passages(owner_id, &passage.file_name)?;
                Ok((passage, passages))
            })
            .await?;

        let content = passages
            .iter()
            .map(|p| p.content.as_str())
            .collect::<String>();

        Ok(FileDetail {
            id,
            file_name: passage.file_name,
            display_type: passage.display_type,
            content,
        })
    }

    /// Remove everything stored for an owner
    pub async fn delete_owner(&self, owner_id: i64) -> KnowledgeResult<usize> {
        let removed = self.vector.delete_by_filter(&PassageFilter::owner(owner_id)).await?;
        tracing::info!("Purged owner {} ({} passages)", owner_id, removed);
        Ok(removed)
    }

    pub async fn stats(&self) -> KnowledgeResult<RetrieverStats> {
        let store = self.store.run_blocking(|store| store.stats()).await?;
        Ok(RetrieverStats {
            store,
            embedder: self.embedder.name().to_string(),
            dimension: self.embedder.dimension(),
        })
    }
}

// ============================================================================
// Rank Fusion
// ============================================================================

/// Weighted Reciprocal Rank Fusion
///
/// A passage at 1-based rank `r` in a list gains `weight / (k + r)` from that
/// list. Scores are summed per passage id; ties are broken by id so the
/// output does not depend on which channel finished first.
pub fn fuse_rankings(
    vector_hits: &[VectorMatch],
    keyword_hits: &[KeywordMatch],
    limit: usize,
    fusion: &FusionConfig,
) -> Vec<SearchResult> {
    struct Fused<'a> {
        passage: &'a Passage,
        score: f64,
        similarity: Option<f32>,
        keyword_score: Option<usize>,
    }

    let mut fused: HashMap<i64, Fused<'_>> = HashMap::new();

    for (rank, hit) in vector_hits.iter().enumerate() {
        let entry = fused.entry(hit.passage.id).or_insert(Fused {
            passage: &hit.passage,
            score: 0.0,
            similarity: None,
            keyword_score: None,
        });
        entry.score += rrf_contribution(fusion.vector_weight, fusion.k, rank + 1);
        entry.similarity = Some(hit.similarity);
    }

    for (rank, hit) in keyword_hits.iter().enumerate() {
        let entry = fused.entry(hit.passage.id).or_insert(Fused {
            passage: &hit.passage,
            score: 0.0,
            similarity: None,
            keyword_score: None,
        });
        entry.score += rrf_contribution(fusion.keyword_weight, fusion.k, rank + 1);
        entry.keyword_score = Some(hit.match_count);
    }

    let mut ranked: Vec<Fused<'_>> = fused.into_values().collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.passage.id.cmp(&b.passage.id))
    });
    ranked.truncate(limit);

    ranked
        .into_iter()
        .map(|hit| {
            let method = match (hit.similarity.is_some(), hit.keyword_score.is_some()) {
                (true, true) => SearchMethod::Hybrid,
                (false, true) => SearchMethod::Keyword,
                _ => SearchMethod::Vector,
            };

            SearchResult {
                id: hit.passage.id,
                file_name: hit.passage.file_name.clone(),
                content: hit.passage.content.clone(),
                preview: hit.passage.preview.clone(),
                size: hit.passage.size,
                display_type: hit.passage.display_type.clone(),
                similarity: hit.similarity,
                keyword_score: hit.keyword_score.unwrap_or(0),
                hybrid_score: hit.score,
                method,
            }
        })
        .collect()
}

#[inline]
fn rrf_contribution(weight: f64, k: f64, rank: usize) -> f64 {
    weight / (k + rank as f64)
}

// ============================================================================
// Helper Functions
// ============================================================================

fn validate_search(query: &str, limit: usize, min_similarity: f32) -> KnowledgeResult<()> {
    if query.trim().is_empty() {
        return Err(KnowledgeError::Validation("query must not be empty".to_string()));
    }
    if limit == 0 {
        return Err(KnowledgeError::Validation("limit must be at least 1".to_string()));
    }
    if !(-1.0..=1.0).contains(&min_similarity) {
        return Err(KnowledgeError::Validation(format!(
            "minSimilarity must be within [-1, 1], got {}",
            min_similarity
        )));
    }
    Ok(())
}

fn sanitize_content(text: &str) -> String {
    text.replace('\0', "")
}

/// First `max_chars` characters without null bytes; horizontal whitespace
/// runs collapse to one space unless `keep_whitespace`
fn make_preview(text: &str, keep_whitespace: bool, max_chars: usize) -> String {
    let cleaned = sanitize_content(text);
    if keep_whitespace {
        return cleaned.chars().take(max_chars).collect();
    }

    let mut preview = String::new();
    let mut count = 0;
    let mut in_run = false;

    for c in cleaned.chars() {
        if count >= max_chars {
            break;
        }
        if c == ' ' || c == '\t' {
            if in_run {
                continue;
            }
            in_run = true;
            preview.push(' ');
        } else {
            in_run = false;
            preview.push(c);
        }
        count += 1;
    }

    preview
}

// ============================================================================
// Tests
// ============================================================================
