//! File collection
//!
//! Gathers local files and folders for ingestion. Honors .gitignore patterns
//! and only keeps extensions the document normalizer understands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use ignore::WalkBuilder;

use crate::extractor::FileFormat;

// ============================================================================
// Collected File
// ============================================================================

/// A file accepted for ingestion
#[derive(Debug, Clone)]
pub struct CollectedFile {
    pub path: PathBuf,
    pub format: FileFormat,
    /// Size in bytes
    pub size: u64,
    pub modified_at: Option<SystemTime>,
}

impl CollectedFile {
    /// `Ok(None)` for unsupported extensions and non-regular files
    pub fn from_path(path: PathBuf) -> Result<Option<Self>> {
        let Some(format) = format_of(&path) else {
            return Ok(None);
        };

        let metadata = std::fs::metadata(&path)
            .with_context(|| format!("Failed to read metadata: {:?}", path))?;

        if !metadata.is_file() {
            return Ok(None);
        }

        Ok(Some(Self {
            path,
            format,
            size: metadata.len(),
            modified_at: metadata.modified().ok(),
        }))
    }

    /// File name used as the ingestion key
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
    }
}

fn format_of(path: &Path) -> Option<FileFormat> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(FileFormat::from_extension)
}

// ============================================================================
// File Collector
// ============================================================================

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub respect_gitignore: bool,
    pub include_hidden: bool,
    /// Byte limit per file, 0 = unlimited
    pub max_file_size: u64,
    /// Restrict to these formats (empty = every supported format)
    pub formats: Vec<FileFormat>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            respect_gitignore: true,
            include_hidden: false,
            max_file_size: 50 * 1024 * 1024, // 50MB
            formats: vec![],
        }
    }
}

pub struct FileCollector {
    config: CollectorConfig,
}

impl FileCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(CollectorConfig::default())
    }

    /// Collect a single file
    pub fn collect_file(&self, path: &Path) -> Result<Option<CollectedFile>> {
        let abs_path = absolute(path)?;

        if !abs_path.exists() {
            anyhow::bail!("File not found: {:?}", abs_path);
        }

        if !abs_path.is_file() {
            anyhow::bail!("Not a file: {:?}", abs_path);
        }

        let file = CollectedFile::from_path(abs_path)?;
        Ok(file.filter(|f| self.should_include(f)))
    }

    /// Collect a directory recursively
    pub fn collect_directory(&self, path: &Path) -> Result<Vec<CollectedFile>> {
        let abs_path = absolute(path)?;

        if !abs_path.exists() {
            anyhow::bail!("Directory not found: {:?}", abs_path);
        }

        if !abs_path.is_dir() {
            anyhow::bail!("Not a directory: {:?}", abs_path);
        }

        let walker = WalkBuilder::new(&abs_path)
            .hidden(!self.config.include_hidden)
            .git_ignore(self.config.respect_gitignore)
            .git_global(self.config.respect_gitignore)
            .git_exclude(self.config.respect_gitignore)
            .build();

        let mut files = Vec::new();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Failed to read entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }

            match CollectedFile::from_path(entry.path().to_path_buf()) {
                Ok(Some(file)) if self.should_include(&file) => files.push(file),
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to collect file: {}", e),
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        tracing::info!("Collected {} files from {:?}", files.len(), abs_path);
        Ok(files)
    }

    fn should_include(&self, file: &CollectedFile) -> bool {
        if self.config.max_file_size > 0 && file.size > self.config.max_file_size {
            tracing::debug!("Skipping large file: {:?} ({} bytes)", file.path, file.size);
            return false;
        }

        self.config.formats.is_empty() || self.config.formats.contains(&file.format)
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
pub struct CollectionStats {
    pub total_files: usize,
    pub total_size: u64,
    /// Files per extension
    pub by_format: BTreeMap<&'static str, usize>,
}

impl CollectionStats {
    pub fn from_files(files: &[CollectedFile]) -> Self {
        let mut stats = Self::default();

        for file in files {
            stats.total_files += 1;
            stats.total_size += file.size;
            *stats.by_format.entry(file.format.extension()).or_default() += 1;
        }

        stats
    }
}

// ============================================================================
// Tests
// ============================================================================
