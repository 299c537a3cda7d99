//! PDF text extraction via pdf-extract

use crate::knowledge::{KnowledgeError, KnowledgeResult};

use super::FormatParser;

/// Full-text PDF parser
pub struct PdfParser;

impl FormatParser for PdfParser {
    fn parse(&self, bytes: &[u8]) -> KnowledgeResult<String> {
        let text = pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| KnowledgeError::CorruptDocument(format!("PDF: {}", e)))?;

        if text.trim().is_empty() {
            tracing::warn!("No text extracted from PDF. It might be a scanned document.");
            return Ok(String::new());
        }

        Ok(join_pages(&text))
    }

    fn name(&self) -> &'static str {
        "PdfParser"
    }
}

/// Form feeds become paragraph breaks so chunking prefers page boundaries
fn join_pages(text: &str) -> String {
    text.split('\x0c')
        .map(str::trim)
        .filter(|page| !page.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_pages_with_formfeed() {
        let text = "Page 1 content\x0c\nPage 2 content \x0c\x0cPage 3 content";
        assert_eq!(
            join_pages(text),
            "Page 1 content\n\nPage 2 content\n\nPage 3 content"
        );
    }

    #[test]
    fn test_join_pages_no_separator() {
        let text = "Just some text without page breaks";
        assert_eq!(join_pages(text), text);
    }

    #[test]
    fn test_invalid_pdf_is_corrupt() {
        let err = PdfParser.parse(b"not a pdf").unwrap_err();
        assert!(matches!(err, KnowledgeError::CorruptDocument(_)));
    }
}
