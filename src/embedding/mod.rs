//! Embedding providers - text → fixed-length vectors
//!
//! - `OpenAiCompatibleEmbedding`: any `/embeddings` endpoint speaking the
//!   OpenAI wire format (DashScope compatible mode by default)
//! - `HashEmbedding`: offline, deterministic character-trigram hashing
//!
//! ## Usage
//! ```rust,ignore
//! let embedder = OpenAiCompatibleEmbedding::from_env()?;
//! let embedding = embedder.embed("Hello, world!").await?;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// Embedding provider
///
/// Passed explicitly into the retriever; implementations own their own
/// clients and rate limits.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts (default: sequential calls)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Vector length produced by this provider
    fn dimension(&self) -> usize;

    fn name(&self) -> &str;
}

// ============================================================================
// Configuration
// ============================================================================

/// DashScope OpenAI-compatible endpoint
pub const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
pub const DEFAULT_MODEL: &str = "text-embedding-v1";
pub const DEFAULT_DIMENSION: usize = 1536;

/// Rate limiter settings
const RATE_LIMIT_RPM: u32 = 120;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
/// Minimum delay between calls
const MIN_DELAY_MS: u64 = 100;
/// Retries on 429 / transport errors
const MAX_RETRIES: u32 = 3;
/// Initial retry backoff (ms), doubled per attempt
const INITIAL_BACKOFF_MS: u64 = 2000;
/// Inputs per batch request
const MAX_BATCH_INPUTS: usize = 25;

/// Embedding endpoint configuration
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
}

impl EmbeddingConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            dimension: DEFAULT_DIMENSION,
        }
    }

    /// Read `DASHSCOPE_API_KEY` / `OPENAI_API_KEY`, `EMBEDDING_BASE_URL`,
    /// `EMBEDDING_MODEL` and `EMBEDDING_DIMENSION`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(get_api_key()?);

        if let Some(url) = non_empty_env("EMBEDDING_BASE_URL") {
            config.base_url = url;
        }
        if let Some(model) = non_empty_env("EMBEDDING_MODEL") {
            config.model = model;
        }
        if let Some(dim) = non_empty_env("EMBEDDING_DIMENSION") {
            config.dimension = dim
                .parse()
                .with_context(|| format!("Invalid EMBEDDING_DIMENSION: {}", dim))?;
        }

        Ok(config)
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.base_url.trim_end_matches('/'))
    }
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// Rate Limiter with minimum delay between requests
#[derive(Debug)]
struct RateLimiter {
    requests: Vec<Instant>,
    max_requests: u32,
    window: Duration,
    min_delay: Duration,
    last_request: Option<Instant>,
}

impl RateLimiter {
    fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            requests: Vec::new(),
            max_requests,
            window,
            min_delay: Duration::from_millis(MIN_DELAY_MS),
            last_request: None,
        }
    }

    /// Wait until another request is allowed
    async fn acquire(&mut self) {
        // burst guard
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                let wait_time = self.min_delay - elapsed;
                tracing::debug!("Min delay: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        let now = Instant::now();
        self.requests.retain(|&t| now.duration_since(t) < self.window);

        if self.requests.len() >= self.max_requests as usize {
            if let Some(&oldest) = self.requests.first() {
                let wait_time = self.window.saturating_sub(now.duration_since(oldest));
                if !wait_time.is_zero() {
                    tracing::debug!("Rate limit reached, waiting {:?}", wait_time);
                    tokio::time::sleep(wait_time).await;
                }
                let now = Instant::now();
                self.requests.retain(|&t| now.duration_since(t) < self.window);
            }
        }

        let now = Instant::now();
        self.requests.push(now);
        self.last_request = Some(now);
    }
}

// ============================================================================
// OpenAI-compatible Embedding
// ============================================================================

/// `/embeddings` client (OpenAI wire format)
#[derive(Debug)]
pub struct OpenAiCompatibleEmbedding {
    config: EmbeddingConfig,
    client: reqwest::Client,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl OpenAiCompatibleEmbedding {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        if config.dimension == 0 {
            anyhow::bail!("Invalid dimension: 0");
        }
        if config.api_key.trim().is_empty() {
            anyhow::bail!("Embedding API key is empty");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let rate_limiter = Arc::new(Mutex::new(RateLimiter::new(
            RATE_LIMIT_RPM,
            RATE_LIMIT_WINDOW,
        )));

        Ok(Self {
            config,
            client,
            rate_limiter,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(EmbeddingConfig::from_env()?)
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    /// One `/embeddings` call with rate limiting and 429 backoff
    async fn request(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let expected = inputs.len();
        let request = EmbedRequest {
            model: self.config.model.clone(),
            input: inputs,
            encoding_format: "float",
        };
        let url = self.config.endpoint();

        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..=MAX_RETRIES {
            {
                let mut limiter = self.rate_limiter.lock().await;
                limiter.acquire().await;
            }

            let response = match self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&request)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = Some(anyhow::anyhow!("Failed to send embedding request: {}", e));
                    if attempt < MAX_RETRIES {
                        let backoff = Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt));
                        tracing::warn!(
                            "Request failed, retrying in {:?} (attempt {}/{})",
                            backoff,
                            attempt + 1,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    break;
                }
            };

            let status = response.status();
            let body = response
                .text()
                .await
                .context("Failed to read response body")?;

            if status.is_success() {
                return parse_embed_response(&body, expected);
            }

            if status.as_u16() == 429 {
                let backoff = Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt));
                tracing::warn!(
                    "Rate limit hit (429), backing off {:?} (attempt {}/{})",
                    backoff,
                    attempt + 1,
                    MAX_RETRIES
                );
                last_error = Some(anyhow::anyhow!("Rate limit exceeded (429)"));

                if attempt < MAX_RETRIES {
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            } else {
                // other errors fail immediately
                if let Ok(error) = serde_json::from_str::<ApiError>(&body) {
                    anyhow::bail!("Embedding API error ({}): {}", status, error.error.message);
                }
                anyhow::bail!("Embedding API error ({}): {}", status, body);
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("Embedding failed after {} retries", MAX_RETRIES)))
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
    encoding_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Debug, Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Embeddings ordered by their `index` field
fn parse_embed_response(body: &str, expected: usize) -> Result<Vec<Vec<f32>>> {
    let mut response: EmbedResponse =
        serde_json::from_str(body).context("Failed to parse embedding response")?;

    if response.data.len() != expected {
        anyhow::bail!(
            "Embedding response has {} vectors, expected {}",
            response.data.len(),
            expected
        );
    }

    response.data.sort_by_key(|d| d.index);
    Ok(response.data.into_iter().map(|d| d.embedding).collect())
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatibleEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.config.dimension]);
        }

        self.request(vec![text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Embedding response was empty"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());

        for (i, batch) in texts.chunks(MAX_BATCH_INPUTS).enumerate() {
            tracing::debug!(
                "Embedding batch {}/{}",
                i + 1,
                texts.len().div_ceil(MAX_BATCH_INPUTS)
            );
            results.extend(self.request(batch.to_vec()).await?);
        }

        Ok(results)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

// ============================================================================
// Hash Embedding (offline)
// ============================================================================

pub const HASH_EMBEDDING_DIMENSION: usize = 256;

/// Deterministic character-trigram embedder
///
/// Each lowercase trigram is FNV-1a hashed into a bucket; the histogram is
/// L2-normalized. Texts shorter than three characters hash as one token.
#[derive(Debug, Clone, Copy)]
pub struct HashEmbedding {
    dimension: usize,
}

impl Default for HashEmbedding {
    fn default() -> Self {
        Self::new(HASH_EMBEDDING_DIMENSION)
    }
}

impl HashEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().filter(|c| !c.is_whitespace()).collect();

        if chars.is_empty() {
            return vector;
        }

        let mut add = |token: &[char]| {
            let mut hash = 1469598103934665603u64;
            for c in token {
                let mut utf8 = [0u8; 4];
                for byte in c.encode_utf8(&mut utf8).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        };

        if chars.len() < 3 {
            add(&chars);
        } else {
            for window in chars.windows(3) {
                add(window);
            }
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hash-trigram"
    }
}

// ============================================================================
// API Key Management
// ============================================================================

const API_KEY_VARS: &[&str] = &["DASHSCOPE_API_KEY", "OPENAI_API_KEY"];

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// API key from the environment
///
/// Priority:
/// 1. `DASHSCOPE_API_KEY`
/// 2. `OPENAI_API_KEY`
pub fn get_api_key() -> Result<String> {
    for var in API_KEY_VARS {
        if let Some(key) = non_empty_env(var) {
            tracing::debug!("Using API key from {}", var);
            return Ok(key);
        }
    }

    anyhow::bail!("API key not found. Set DASHSCOPE_API_KEY or OPENAI_API_KEY environment variable.")
}

pub fn has_api_key() -> bool {
    API_KEY_VARS.iter().any(|var| non_empty_env(var).is_some())
}

// ============================================================================
// Factory Function
// ============================================================================

/// Remote provider from the environment
pub fn create_embedder() -> Result<OpenAiCompatibleEmbedding> {
    if !has_api_key() {
        anyhow::bail!(
            "DASHSCOPE_API_KEY or OPENAI_API_KEY not set.\n\
             Set: export DASHSCOPE_API_KEY=your-api-key\n\
             Or run with --offline to use the local hash embedder."
        );
    }

    let embedder = OpenAiCompatibleEmbedding::from_env()?;
    tracing::info!(
        "Using {} embedding at {} (dimension: {})",
        embedder.config.model,
        embedder.config.base_url,
        embedder.config.dimension
    );
    Ok(embedder)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::cosine_similarity;

    #[test]
    fn test_invalid_config() {
        let mut config = EmbeddingConfig::new("fake_key");
        config.dimension = 0;
        let err = OpenAiCompatibleEmbedding::new(config).unwrap_err();
        assert!(err.to_string().contains("Invalid dimension"));

        assert!(OpenAiCompatibleEmbedding::new(EmbeddingConfig::new("  ")).is_err());
    }

    #[test]
    fn test_endpoint_join() {
        let mut config = EmbeddingConfig::new("k");
        config.base_url = "http://localhost:8080/v1/".to_string();
        assert_eq!(config.endpoint(), "http://localhost:8080/v1/embeddings");
        assert_eq!(
            EmbeddingConfig::new("k").endpoint(),
            "https://dashscope.aliyuncs.com/compatible-mode/v1/embeddings"
        );
    }

    #[test]
    fn test_parse_embed_response_orders_by_index() {
        let body = r#"{"data":[{"embedding":[0.5,0.5],"index":1},{"embedding":[1.0,0.0],"index":0}],"model":"m"}"#;
        let vectors = parse_embed_response(body, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);

        assert!(parse_embed_response(body, 3).is_err());
        assert!(parse_embed_response("not json", 1).is_err());
    }

    #[tokio::test]
    async fn test_empty_text_skips_request() {
        let embedder = OpenAiCompatibleEmbedding::new(EmbeddingConfig::new("fake_key")).unwrap();
        let vector = embedder.embed("   ").await.unwrap();
        assert_eq!(vector.len(), DEFAULT_DIMENSION);
        assert!(vector.iter().all(|v| *v == 0.0));
    }

    #[tokio::test]
    async fn test_hash_embedding_deterministic() {
        let embedder = HashEmbedding::default();
        let first = embedder.embed("Hydraulic pressure and flow").await.unwrap();
        let second = embedder.embed("Hydraulic pressure and flow").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), HASH_EMBEDDING_DIMENSION);
    }

    #[test]
    fn test_hash_embedding_similarity() {
        let embedder = HashEmbedding::new(512);
        let query = embedder.embed_sync("hydraulic pump pressure");
        let close = embedder.embed_sync("pressure of the hydraulic pump");
        let far = embedder.embed_sync("quarterly marketing budget");

        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));

        let norm: f32 = query.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);

        assert!(embedder.embed_sync("ab").iter().any(|v| *v > 0.0));
        assert!(embedder.embed_sync("").iter().all(|v| *v == 0.0));
    }

    /// Local `/embeddings` endpoint: answers in reverse index order and
    /// records the input count of every request. Inputs look like "text <n>"
    /// and embed to `[n, 1, 0, 0]`.
    async fn spawn_embedding_server(batches: Arc<std::sync::Mutex<Vec<usize>>>) -> String {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let batches = Arc::clone(&batches);
                tokio::spawn(async move {
                    let body = read_request_body(&mut socket).await;
                    let request: serde_json::Value = serde_json::from_slice(&body).unwrap();
                    let inputs = request["input"].as_array().unwrap().clone();
                    batches.lock().unwrap().push(inputs.len());

                    let data: Vec<serde_json::Value> = inputs
                        .iter()
                        .enumerate()
                        .rev()
                        .map(|(index, input)| {
                            let n: f32 = input
                                .as_str()
                                .unwrap()
                                .trim_start_matches("text ")
                                .parse()
                                .unwrap();
                            serde_json::json!({ "embedding": [n, 1.0, 0.0, 0.0], "index": index })
                        })
                        .collect();
                    let payload = serde_json::json!({ "data": data, "model": "stub" }).to_string();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        payload.len(),
                        payload
                    );
                    socket.write_all(response.as_bytes()).await.unwrap();
                    let _ = socket.shutdown().await;
                });
            }
        });

        format!("http://{}", addr)
    }

    async fn read_request_body(socket: &mut tokio::net::TcpStream) -> Vec<u8> {
        use tokio::io::AsyncReadExt;

        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut header_end = None;
        let mut content_length = 0;

        loop {
            if let Some(end) = header_end {
                if buf.len() >= end + content_length {
                    return buf[end..end + content_length].to_vec();
                }
            }

            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before the body arrived");
            buf.extend_from_slice(&chunk[..n]);

            if header_end.is_none() {
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                    content_length = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .map(|value| value.trim().parse().unwrap())
                        .unwrap_or(0);
                    header_end = Some(pos + 4);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_embed_batch_splits_requests() {
        let batches = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut config = EmbeddingConfig::new("test-key");
        config.base_url = spawn_embedding_server(Arc::clone(&batches)).await;
        config.dimension = 4;
        let embedder = OpenAiCompatibleEmbedding::new(config).unwrap();

        let texts: Vec<String> = (0..30).map(|i| format!("text {}", i)).collect();
        let vectors = embedder.embed_batch(&texts).await.unwrap();

        assert_eq!(*batches.lock().unwrap(), vec![MAX_BATCH_INPUTS, 30 - MAX_BATCH_INPUTS]);
        assert_eq!(vectors.len(), 30);
        for (i, vector) in vectors.iter().enumerate() {
            assert_eq!(vector, &vec![i as f32, 1.0, 0.0, 0.0]);
        }
    }

    #[tokio::test]
    async fn test_hash_embed_batch_default() {
        let embedder = HashEmbedding::new(16);
        let texts = vec!["one".to_string(), "two".to_string()];
        let vectors = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], embedder.embed_sync("one"));
    }
}
