//! CLI module
//!
//! knowledge-rag command definitions and implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::collector::{CollectionStats, CollectorConfig, FileCollector};
use crate::embedding::{create_embedder, has_api_key, EmbeddingProvider, HashEmbedding};
use crate::extractor::DisplayType;
use crate::knowledge::{
    get_data_dir, HybridRetriever, KnowledgeStore, SearchMethod, DEFAULT_MIN_SIMILARITY,
    DEFAULT_PAGE_SIZE, DEFAULT_SEARCH_LIMIT,
};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "knowledge-rag")]
#[command(version, about = "Hybrid document retrieval engine", long_about = None)]
pub struct Cli {
    /// Data directory (holds knowledge.db)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Use the local hash embedder instead of the remote provider
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ingest a file or a folder
    Ingest {
        #[arg(long)]
        owner: i64,

        /// File to ingest
        #[arg(long)]
        file: Option<PathBuf>,

        /// Folder to ingest (recursive)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Hybrid search
    Query {
        #[arg(long)]
        owner: i64,

        query: String,

        #[arg(short, long, default_value_t = DEFAULT_SEARCH_LIMIT)]
        limit: usize,

        /// Minimum cosine similarity for the vector channel
        #[arg(long, default_value_t = DEFAULT_MIN_SIMILARITY, allow_hyphen_values = true)]
        min_similarity: f32,

        #[arg(long)]
        json: bool,
    },

    /// List ingested files, newest first
    List {
        #[arg(long)]
        owner: i64,

        #[arg(long, default_value_t = 1)]
        page: usize,

        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: usize,

        /// Display type filter (pdf, docx, doc, markdown, text, xlsx, xls)
        #[arg(long = "type")]
        types: Vec<String>,

        #[arg(long)]
        json: bool,
    },

    /// Delete a file by one of its passage ids
    Delete {
        #[arg(long)]
        owner: i64,

        #[arg(long)]
        id: i64,

        #[arg(long)]
        file_name: String,
    },

    /// Show the reconstructed text of a file
    Detail {
        #[arg(long)]
        owner: i64,

        #[arg(long)]
        id: i64,

        #[arg(long)]
        json: bool,
    },

    /// Remove everything stored for an owner
    Purge {
        #[arg(long)]
        owner: i64,
    },

    /// Show status
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// Resolved global options
struct Session {
    data_dir: PathBuf,
    offline: bool,
}

impl Session {
    fn db_path(&self) -> PathBuf {
        self.data_dir.join("knowledge.db")
    }

    fn embedder(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        if self.offline {
            return Ok(Arc::new(HashEmbedding::default()));
        }

        if !has_api_key() {
            bail!(
                "No embedding API key configured.\n\n\
                 Set one of:\n  \
                 export DASHSCOPE_API_KEY=your-api-key\n  \
                 export OPENAI_API_KEY=your-api-key\n\n\
                 or pass --offline to use the local hash embedder"
            );
        }

        let embedder = create_embedder().context("Failed to create embedding client")?;
        Ok(Arc::new(embedder))
    }

    fn retriever(&self) -> Result<HybridRetriever> {
        HybridRetriever::open(&self.data_dir, self.embedder()?)
            .context("Failed to initialize HybridRetriever")
    }

    /// Retriever for commands that never embed (list / detail / delete / purge)
    fn store_retriever(&self) -> Result<HybridRetriever> {
        HybridRetriever::open(&self.data_dir, Arc::new(HashEmbedding::default()))
            .context("Failed to initialize HybridRetriever")
    }
}

/// Run a CLI command
pub async fn run(cli: Cli) -> Result<()> {
    let session = Session {
        data_dir: cli.data_dir.unwrap_or_else(get_data_dir),
        offline: cli.offline,
    };

    match cli.command {
        Commands::Ingest { owner, file, dir } => cmd_ingest(&session, owner, file, dir).await,
        Commands::Query {
            owner,
            query,
            limit,
            min_similarity,
            json,
        } => cmd_query(&session, owner, &query, limit, min_similarity, json).await,
        Commands::List {
            owner,
            page,
            page_size,
            types,
            json,
        } => cmd_list(&session, owner, page, page_size, &types, json).await,
        Commands::Delete {
            owner,
            id,
            file_name,
        } => cmd_delete(&session, owner, id, &file_name).await,
        Commands::Detail { owner, id, json } => cmd_detail(&session, owner, id, json).await,
        Commands::Purge { owner } => cmd_purge(&session, owner).await,
        Commands::Status => cmd_status(&session).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Ingest files through the full pipeline
async fn cmd_ingest(
    session: &Session,
    owner: i64,
    file: Option<PathBuf>,
    dir: Option<PathBuf>,
) -> Result<()> {
    let collector = FileCollector::new(CollectorConfig::default());

    let files = if let Some(ref file_path) = file {
        match collector.collect_file(file_path)? {
            Some(f) => vec![f],
            None => {
                println!("[!] Unsupported or oversized file: {:?}", file_path);
                return Ok(());
            }
        }
    } else if let Some(ref dir_path) = dir {
        collector.collect_directory(dir_path)?
    } else {
        bail!("Specify either --file or --dir");
    };

    if files.is_empty() {
        println!("[!] Nothing to ingest.");
        return Ok(());
    }

    let stats = CollectionStats::from_files(&files);
    let breakdown = stats
        .by_format
        .iter()
        .map(|(ext, count)| format!("{}: {}", ext, count))
        .collect::<Vec<_>>()
        .join(", ");
    println!("[*] {} files ({})", stats.total_files, breakdown);
    println!("    Total size: {}", format_bytes(stats.total_size as usize));
    println!();

    let retriever = session.retriever()?;

    let mut success_count = 0;
    let mut error_count = 0;

    for (i, collected) in files.iter().enumerate() {
        let file_name = collected.file_name();
        print!(
            "[{}/{}] [{}] {}... ",
            i + 1,
            files.len(),
            collected.format.extension().to_uppercase(),
            file_name
        );

        let bytes = match read_file(&collected.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                println!("failed: {:#}", e);
                error_count += 1;
                continue;
            }
        };

        match retriever
            .upload_file(owner, bytes, file_name, collected.format.mime_type())
            .await
        {
            Ok(report) => {
                println!("{} chunks", report.chunk_count);
                success_count += 1;
            }
            Err(e) => {
                println!("failed: {}", e);
                error_count += 1;
            }
        }
    }

    println!();
    println!("[OK] Done: {} succeeded, {} failed", success_count, error_count);

    Ok(())
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))
}

/// Hybrid search (vector + keyword)
async fn cmd_query(
    session: &Session,
    owner: i64,
    query: &str,
    limit: usize,
    min_similarity: f32,
    json: bool,
) -> Result<()> {
    let retriever = session.retriever()?;

    let response = retriever
        .search(owner, query, limit, min_similarity)
        .await
        .context("Search failed")?;

    if json {
        return print_json(&response);
    }

    if response.results.is_empty() {
        println!("[!] No results for \"{}\".", query);
        return Ok(());
    }

    println!("[OK] {} results for \"{}\":\n", response.results.len(), query);

    for (i, result) in response.results.iter().enumerate() {
        let method_str = match result.method {
            SearchMethod::Vector => "VEC",
            SearchMethod::Keyword => "KEY",
            SearchMethod::Hybrid => "HYB",
        };
        let similarity = result
            .similarity
            .map(|s| format!("{:.3}", s))
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{}. [{}] [score: {:.4}] #{} {}",
            i + 1,
            method_str,
            result.hybrid_score,
            result.id,
            result.file_name
        );
        println!(
            "   similarity: {} | keywords: {}",
            similarity, result.keyword_score
        );
        println!("   {}", truncate_text(&result.content, 200));
        println!();
    }

    Ok(())
}

/// List files
async fn cmd_list(
    session: &Session,
    owner: i64,
    page: usize,
    page_size: usize,
    types: &[String],
    json: bool,
) -> Result<()> {
    let retriever = session.store_retriever()?;
    let types: Vec<DisplayType> = types.iter().map(|t| DisplayType::from_label(t)).collect();

    let listing = retriever
        .list_filtered(owner, page, page_size, &types)
        .await
        .context("Failed to list files")?;

    if json {
        return print_json(&listing);
    }

    if listing.items.is_empty() {
        println!("[!] No files stored for owner {}.", owner);
        return Ok(());
    }

    println!(
        "[OK] Files (page {}/{}, {} total):\n",
        listing.page, listing.total_pages, listing.total
    );

    for item in &listing.items {
        println!("  #{:<6} [{}] {}", item.id, item.display_type, item.file_name);
        println!(
            "          {} | {}",
            item.created_at.format("%Y-%m-%d %H:%M"),
            format_bytes(item.size as usize)
        );
        println!("          {}", truncate_text(&item.preview, 80));
        println!();
    }

    Ok(())
}

/// Delete a file
async fn cmd_delete(session: &Session, owner: i64, id: i64, file_name: &str) -> Result<()> {
    let retriever = session.store_retriever()?;

    let removed = retriever
        .delete(owner, id, file_name)
        .await
        .context("Delete failed")?;

    println!("[OK] Deleted {} ({} passages)", file_name, removed);
    Ok(())
}

/// Show file detail
async fn cmd_detail(session: &Session, owner: i64, id: i64, json: bool) -> Result<()> {
    let retriever = session.store_retriever()?;

    let detail = retriever
        .detail(owner, id)
        .await
        .context("Failed to load file")?;

    if json {
        return print_json(&detail);
    }

    println!("[OK] {} [{}]", detail.file_name, detail.display_type);
    println!();
    println!("{}", detail.content);
    Ok(())
}

/// Remove all data of an owner
async fn cmd_purge(session: &Session, owner: i64) -> Result<()> {
    let retriever = session.store_retriever()?;

    let removed = retriever
        .delete_owner(owner)
        .await
        .context("Purge failed")?;

    println!("[OK] Removed {} passages for owner {}", removed, owner);
    Ok(())
}

/// Show status
async fn cmd_status(session: &Session) -> Result<()> {
    println!("knowledge-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("[*] Data directory: {}", session.data_dir.display());

    if session.offline {
        println!("[*] Embeddings: offline hash embedder");
    } else if has_api_key() {
        println!("[OK] API key: configured");
    } else {
        println!("[!] API key: not set");
        println!("    export DASHSCOPE_API_KEY=your-key (or pass --offline)");
    }

    match KnowledgeStore::open(&session.db_path()) {
        Ok(store) => match store.stats() {
            Ok(stats) => {
                println!(
                    "[OK] Stored: {} files, {} passages, {} owners",
                    stats.file_count, stats.passage_count, stats.owner_count
                );
                println!(
                    "     Total content: {}",
                    format_bytes(stats.total_content_bytes)
                );
                if stats.staged_count > 0 {
                    println!("[!] {} staged passages from interrupted ingestions", stats.staged_count);
                }
            }
            Err(e) => {
                println!("[!] Failed to read stats: {}", e);
            }
        },
        Err(e) => {
            println!("[!] Failed to open KnowledgeStore: {}", e);
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", out);
    Ok(())
}

/// Truncate text (UTF-8 safe)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
