//! Text Chunking Module
//!
//! Splits normalized document text into ordered, overlapping passages.
//! Separators are tried from highest to lowest priority (paragraph, line,
//! CJK sentence, Latin sentence, space); pieces that still exceed the size
//! bound fall through to a hard character split.

use super::error::{KnowledgeError, KnowledgeResult};

/// Separator priority, highest first
pub const DEFAULT_SEPARATORS: &[&str] = &[
    "\n\n", // paragraph
    "\n",   // line
    "。", "！", "？", "；", // CJK sentence terminators
    ". ", "! ", "? ", "; ", // Latin sentence terminators
    " ",
];

// ============================================================================
// Chunk Configuration
// ============================================================================

/// Chunking configuration (sizes are in characters, not bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Upper bound for a chunk before the overlap prefix is added
    pub chunk_size: usize,
    /// Trailing characters of the previous chunk prepended to the next one
    pub chunk_overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

impl ChunkConfig {
    /// Larger passages for long-form documents
    pub fn for_rag() -> Self {
        Self {
            chunk_size: 1500,
            chunk_overlap: 300,
        }
    }

    /// No overlap, fewer embedding calls
    pub fn for_fast() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 0,
        }
    }

    pub fn validate(&self) -> KnowledgeResult<()> {
        if self.chunk_size == 0 {
            return Err(KnowledgeError::Validation(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(KnowledgeError::Validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// Text chunking strategy
pub trait Chunker: Send + Sync {
    /// Split text into ordered, non-empty passages
    fn chunk(&self, text: &str) -> Vec<String>;

    fn name(&self) -> &'static str;
}

// ============================================================================
// RecursiveChunker
// ============================================================================

/// Recursive separator chunker
///
/// 1. Split on the highest-priority separator present in the text
/// 2. Greedily merge the pieces back up to `chunk_size`
/// 3. Recurse with the next separator into pieces that are still too large
/// 4. Hard-split at the size boundary once separators run out
/// 5. Prefix every chunk after the first with the previous chunk's tail
///
/// Separators stay attached to the piece they terminate, so the pieces of
/// step 1-4 concatenate back to the input text. Whitespace-only pieces join
/// their neighbour instead of standing alone, so a chunk may exceed
/// `chunk_size` by one whitespace run.
pub struct RecursiveChunker {
    config: ChunkConfig,
    separators: Vec<String>,
}

impl RecursiveChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self::with_separators(config, DEFAULT_SEPARATORS)
    }

    pub fn with_defaults() -> Self {
        Self::new(ChunkConfig::default())
    }

    pub fn with_separators(config: ChunkConfig, separators: &[&str]) -> Self {
        Self {
            config,
            separators: separators
                .iter()
                .filter(|sep| !sep.is_empty())
                .map(|sep| sep.to_string())
                .collect(),
        }
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Size-bounded pieces before overlap is applied
    fn split_pieces(&self, text: &str) -> Vec<String> {
        let mut pieces = Vec::new();
        self.split_recursive(text, 0, &mut pieces);
        attach_blank_pieces(pieces)
    }

    fn split_recursive(&self, text: &str, level: usize, out: &mut Vec<String>) {
        let size = self.config.chunk_size.max(1);
        if char_len(text) <= size {
            out.push(text.to_string());
            return;
        }

        let found = self.separators[level.min(self.separators.len())..]
            .iter()
            .position(|sep| text.contains(sep.as_str()));

        let Some(offset) = found else {
            hard_split(text, size, out);
            return;
        };

        let sep_level = level + offset;
        let separator = self.separators[sep_level].as_str();

        let mut buffer = String::new();
        let mut buffer_len = 0;

        for piece in text.split_inclusive(separator) {
            let piece_len = char_len(piece);

            if piece_len > size {
                if !buffer.is_empty() {
                    out.push(std::mem::take(&mut buffer));
                    buffer_len = 0;
                }
                self.split_recursive(piece, sep_level + 1, out);
                continue;
            }

            if !buffer.is_empty() && buffer_len + piece_len > size {
                out.push(std::mem::take(&mut buffer));
                buffer_len = 0;
            }

            buffer.push_str(piece);
            buffer_len += piece_len;
        }

        if !buffer.is_empty() {
            out.push(buffer);
        }
    }

    /// Prefix each chunk with the trailing `chunk_overlap` characters of the previous one
    fn apply_overlap(&self, pieces: Vec<String>) -> Vec<String> {
        let overlap = self.config.chunk_overlap;
        if overlap == 0 || pieces.len() < 2 {
            return pieces;
        }

        let mut result: Vec<String> = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let chunk = match result.last() {
                Some(prev) => format!("{}{}", tail_chars(prev, overlap), piece),
                None => piece,
            };
            result.push(chunk);
        }
        result
    }
}

impl Chunker for RecursiveChunker {
    fn chunk(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return vec![];
        }

        let pieces = self.split_pieces(text);
        self.apply_overlap(pieces)
    }

    fn name(&self) -> &'static str {
        "RecursiveChunker"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

#[inline]
fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn hard_split(text: &str, size: usize, out: &mut Vec<String>) {
    let chars: Vec<char> = text.chars().collect();
    for window in chars.chunks(size) {
        out.push(window.iter().collect());
    }
}

/// Fold whitespace-only pieces into the previous piece, or into the first
/// non-blank one when they lead the text
fn attach_blank_pieces(raw: Vec<String>) -> Vec<String> {
    let mut pieces: Vec<String> = Vec::with_capacity(raw.len());
    let mut leading = String::new();

    for piece in raw {
        if piece.trim().is_empty() {
            match pieces.last_mut() {
                Some(prev) => prev.push_str(&piece),
                None => leading.push_str(&piece),
            }
        } else if pieces.is_empty() && !leading.is_empty() {
            pieces.push(std::mem::take(&mut leading) + &piece);
        } else {
            pieces.push(piece);
        }
    }
    pieces
}

/// Last `count` characters of `text` (UTF-8 safe)
fn tail_chars(text: &str, count: usize) -> &str {
    let total = char_len(text);
    if total <= count {
        return text;
    }
    let start = text
        .char_indices()
        .nth(total - count)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    &text[start..]
}

// ============================================================================
// Factory Functions
// ============================================================================

pub fn default_chunker() -> Box<dyn Chunker> {
    Box::new(RecursiveChunker::with_defaults())
}

pub fn recursive_chunker(config: ChunkConfig) -> Box<dyn Chunker> {
    Box::new(RecursiveChunker::new(config))
}

// ============================================================================
// Tests
// ============================================================================
