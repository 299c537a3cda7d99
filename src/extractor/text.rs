//! Plain text / markdown

use crate::knowledge::KnowledgeResult;

use super::FormatParser;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// UTF-8 decoder (invalid sequences replaced, BOM stripped)
pub struct PlainTextParser;

impl FormatParser for PlainTextParser {
    fn parse(&self, bytes: &[u8]) -> KnowledgeResult<String> {
        let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn name(&self) -> &'static str {
        "PlainTextParser"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbatim_utf8() {
        let text = "液压泵 manual\r\n\ttabs  kept";
        assert_eq!(PlainTextParser.parse(text.as_bytes()).unwrap(), text);
    }

    #[test]
    fn test_bom_and_invalid_bytes() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(b"ok\xFFend");
        assert_eq!(PlainTextParser.parse(&bytes).unwrap(), "ok\u{FFFD}end");
    }
}
