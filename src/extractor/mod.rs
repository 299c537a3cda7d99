//! Document normalization
//!
//! Raw upload bytes + file name → plain text.
//! - pdf: pdf-extract
//! - docx / doc: OOXML parser first, legacy Word scanner as fallback
//! - txt / md: UTF-8 text
//! - xlsx / xls: calamine, one CSV block per non-empty sheet

pub mod pdf;
pub mod sheet;
pub mod text;
pub mod word;

use std::collections::HashMap;
use std::fmt;

use crate::knowledge::{KnowledgeError, KnowledgeResult};

pub use pdf::PdfParser;
pub use sheet::SpreadsheetParser;
pub use text::PlainTextParser;
pub use word::{DocxParser, LegacyWordParser};

// ============================================================================
// File Formats
// ============================================================================

/// Supported upload formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileFormat {
    Pdf,
    Docx,
    Doc,
    Txt,
    Md,
    Xlsx,
    Xls,
}

impl FileFormat {
    pub const ALL: [FileFormat; 7] = [
        FileFormat::Pdf,
        FileFormat::Docx,
        FileFormat::Doc,
        FileFormat::Txt,
        FileFormat::Md,
        FileFormat::Xlsx,
        FileFormat::Xls,
    ];

    /// Case-insensitive extension lookup (no leading dot)
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "doc" => Some(Self::Doc),
            "txt" => Some(Self::Txt),
            "md" => Some(Self::Md),
            "xlsx" => Some(Self::Xlsx),
            "xls" => Some(Self::Xls),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Doc => "doc",
            Self::Txt => "txt",
            Self::Md => "md",
            Self::Xlsx => "xlsx",
            Self::Xls => "xls",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Docx => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            Self::Doc => "application/msword",
            Self::Txt => "text/plain",
            Self::Md => "text/markdown",
            Self::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            Self::Xls => "application/vnd.ms-excel",
        }
    }

    pub fn display_type(&self) -> DisplayType {
        match self {
            Self::Pdf => DisplayType::Pdf,
            Self::Docx => DisplayType::Docx,
            Self::Doc => DisplayType::Doc,
            Self::Txt => DisplayType::Text,
            Self::Md => DisplayType::Markdown,
            Self::Xlsx => DisplayType::Xlsx,
            Self::Xls => DisplayType::Xls,
        }
    }
}

/// Label shown to callers for a file's format
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DisplayType {
    Pdf,
    Docx,
    Doc,
    Markdown,
    Text,
    Xlsx,
    Xls,
    /// Unmapped extension: the declared mime type
    Other(String),
}

impl DisplayType {
    /// Display type for an extension, falling back to the mime type
    pub fn resolve(extension: &str, mime_type: &str) -> Self {
        FileFormat::from_extension(extension)
            .map(|format| format.display_type())
            .unwrap_or_else(|| Self::Other(mime_type.to_string()))
    }

    /// Parse a stored / user-supplied label
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "pdf" => Self::Pdf,
            "docx" => Self::Docx,
            "doc" => Self::Doc,
            "markdown" | "md" => Self::Markdown,
            "text" | "txt" => Self::Text,
            "xlsx" => Self::Xlsx,
            "xls" => Self::Xls,
            _ => Self::Other(label.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Doc => "doc",
            Self::Markdown => "markdown",
            Self::Text => "text",
            Self::Xlsx => "xlsx",
            Self::Xls => "xls",
            Self::Other(mime) => mime,
        }
    }
}

impl fmt::Display for DisplayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercased extension of a file name, without the dot
pub fn file_extension(file_name: &str) -> String {
    std::path::Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

// ============================================================================
// Parsers
// ============================================================================

/// Bytes → text for one format
pub trait FormatParser: Send + Sync {
    /// Extract text; `Ok("")` means the document carried no text
    fn parse(&self, bytes: &[u8]) -> KnowledgeResult<String>;

    fn name(&self) -> &'static str;
}

/// Parsers tried in order until one yields non-blank text
pub struct ParserChain {
    parsers: Vec<Box<dyn FormatParser>>,
}

impl ParserChain {
    pub fn single(parser: impl FormatParser + 'static) -> Self {
        Self {
            parsers: vec![Box::new(parser)],
        }
    }

    pub fn with_fallback(
        primary: impl FormatParser + 'static,
        fallback: impl FormatParser + 'static,
    ) -> Self {
        Self {
            parsers: vec![Box::new(primary), Box::new(fallback)],
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.parsers.iter().map(|p| p.name()).collect()
    }

    /// Run the chain.
    ///
    /// A lone parser propagates its own error (or `EmptyContent`). A chain
    /// with a fallback that ends without text is a `CorruptDocument`.
    fn run(&self, bytes: &[u8]) -> KnowledgeResult<String> {
        let mut failures = Vec::new();

        for parser in &self.parsers {
            match parser.parse(bytes) {
                Ok(text) if !text.trim().is_empty() => return Ok(text),
                Ok(_) => {
                    tracing::debug!("{} produced no text", parser.name());
                    failures.push(format!("{}: no text", parser.name()));
                    if self.parsers.len() == 1 {
                        return Err(KnowledgeError::EmptyContent);
                    }
                }
                Err(e) => {
                    tracing::debug!("{} failed: {}", parser.name(), e);
                    if self.parsers.len() == 1 {
                        return Err(e);
                    }
                    failures.push(format!("{}: {}", parser.name(), e));
                }
            }
        }

        Err(KnowledgeError::CorruptDocument(failures.join("; ")))
    }
}

// ============================================================================
// Document Normalizer
// ============================================================================

/// Normalized document text
#[derive(Debug, Clone)]
pub struct NormalizedDocument {
    pub text: String,
    pub format: FileFormat,
}

/// Extension → parser chain registry
pub struct DocumentNormalizer {
    chains: HashMap<FileFormat, ParserChain>,
}

impl Default for DocumentNormalizer {
    fn default() -> Self {
        let mut normalizer = Self::empty();
        normalizer.register(FileFormat::Pdf, ParserChain::single(PdfParser));
        normalizer.register(
            FileFormat::Docx,
            ParserChain::with_fallback(DocxParser, LegacyWordParser),
        );
        normalizer.register(
            FileFormat::Doc,
            ParserChain::with_fallback(DocxParser, LegacyWordParser),
        );
        normalizer.register(FileFormat::Txt, ParserChain::single(PlainTextParser));
        normalizer.register(FileFormat::Md, ParserChain::single(PlainTextParser));
        normalizer.register(FileFormat::Xlsx, ParserChain::single(SpreadsheetParser::xlsx()));
        normalizer.register(FileFormat::Xls, ParserChain::single(SpreadsheetParser::xls()));
        normalizer
    }
}

impl DocumentNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry without any parsers
    pub fn empty() -> Self {
        Self {
            chains: HashMap::new(),
        }
    }

    /// Register (or replace) the chain for a format
    pub fn register(&mut self, format: FileFormat, chain: ParserChain) {
        self.chains.insert(format, chain);
    }

    /// Raw bytes → non-blank text
    pub fn normalize(&self, bytes: &[u8], file_name: &str) -> KnowledgeResult<NormalizedDocument> {
        let extension = file_extension(file_name);
        let format = FileFormat::from_extension(&extension)
            .ok_or_else(|| KnowledgeError::UnsupportedFormat(extension.clone()))?;

        let chain = self
            .chains
            .get(&format)
            .ok_or_else(|| KnowledgeError::UnsupportedFormat(extension.clone()))?;

        let text = chain.run(bytes)?;
        if text.trim().is_empty() {
            return Err(KnowledgeError::EmptyContent);
        }

        tracing::debug!(
            "Normalized {} via {:?} ({} chars)",
            file_name,
            chain.names(),
            text.chars().count()
        );

        Ok(NormalizedDocument { text, format })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted(KnowledgeResult<&'static str>);

    impl FormatParser for Scripted {
        fn parse(&self, _bytes: &[u8]) -> KnowledgeResult<String> {
            match &self.0 {
                Ok(text) => Ok(text.to_string()),
                Err(e) => Err(KnowledgeError::CorruptDocument(e.to_string())),
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    #[test]
    fn test_extension_lookup() {
        assert_eq!(FileFormat::from_extension("PDF"), Some(FileFormat::Pdf));
        assert_eq!(FileFormat::from_extension("md"), Some(FileFormat::Md));
        assert_eq!(FileFormat::from_extension("pptx"), None);
        assert_eq!(file_extension("Report.Final.DOCX"), "docx");
        assert_eq!(file_extension("README"), "");
    }

    #[test]
    fn test_display_types() {
        assert_eq!(DisplayType::resolve("md", "text/markdown").as_str(), "markdown");
        assert_eq!(DisplayType::resolve("txt", "text/plain").as_str(), "text");
        assert_eq!(DisplayType::resolve("xls", "x").as_str(), "xls");
        assert_eq!(
            DisplayType::resolve("csv", "text/csv"),
            DisplayType::Other("text/csv".to_string())
        );
        assert_eq!(DisplayType::from_label("Markdown"), DisplayType::Markdown);
        for format in FileFormat::ALL {
            let display = format.display_type();
            assert_eq!(DisplayType::from_label(display.as_str()), display);
        }
    }

    #[test]
    fn test_unsupported_format() {
        let normalizer = DocumentNormalizer::new();
        let err = normalizer.normalize(b"data", "slides.pptx").unwrap_err();
        assert!(matches!(err, KnowledgeError::UnsupportedFormat(ref ext) if ext == "pptx"));

        let err = normalizer.normalize(b"data", "no_extension").unwrap_err();
        assert_eq!(err.kind(), "unsupported_format");
    }

    #[test]
    fn test_plain_text_and_blank() {
        let normalizer = DocumentNormalizer::new();
        let doc = normalizer.normalize("# Title\n\nBody".as_bytes(), "notes.MD").unwrap();
        assert_eq!(doc.format, FileFormat::Md);
        assert_eq!(doc.text, "# Title\n\nBody");

        let err = normalizer.normalize(b"  \n\t ", "blank.txt").unwrap_err();
        assert!(matches!(err, KnowledgeError::EmptyContent));
    }

    #[test]
    fn test_fallback_used_when_primary_empty() {
        let chain = ParserChain::with_fallback(Scripted(Ok("   ")), Scripted(Ok("legacy text")));
        assert_eq!(chain.run(b"").unwrap(), "legacy text");

        let chain = ParserChain::with_fallback(
            Scripted(Err(KnowledgeError::CorruptDocument("bad zip".into()))),
            Scripted(Ok("legacy text")),
        );
        assert_eq!(chain.run(b"").unwrap(), "legacy text");
    }

    #[test]
    fn test_exhausted_fallback_is_corrupt() {
        let chain = ParserChain::with_fallback(Scripted(Ok("")), Scripted(Ok("")));
        assert!(matches!(chain.run(b""), Err(KnowledgeError::CorruptDocument(_))));

        let normalizer = DocumentNormalizer::new();
        let err = normalizer.normalize(b"not a word file", "memo.doc").unwrap_err();
        assert_eq!(err.kind(), "corrupt_document");
    }

    #[test]
    fn test_single_parser_errors_propagate() {
        let chain = ParserChain::single(Scripted(Ok("")));
        assert!(matches!(chain.run(b""), Err(KnowledgeError::EmptyContent)));

        let normalizer = DocumentNormalizer::new();
        let err = normalizer.normalize(b"not a pdf", "scan.pdf").unwrap_err();
        assert_eq!(err.kind(), "corrupt_document");
    }

    #[test]
    fn test_custom_registration() {
        let mut normalizer = DocumentNormalizer::empty();
        assert!(normalizer.normalize(b"x", "a.txt").is_err());

        normalizer.register(FileFormat::Txt, ParserChain::single(Scripted(Ok("custom"))));
        assert_eq!(normalizer.normalize(b"x", "a.txt").unwrap().text, "custom");
    }
}
