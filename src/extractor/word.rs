//! Word documents
//!
//! `DocxParser` reads `word/document.xml` out of the OOXML zip. The legacy
//! `.doc` format (OLE2 compound file) has no structured reader here; instead
//! `LegacyWordParser` scans the container for UTF-16LE and 8-bit text runs
//! and keeps whichever encoding recovers more text.

use std::io::{Cursor, Read};

use quick_xml::events::Event;

use crate::knowledge::{KnowledgeError, KnowledgeResult};

use super::FormatParser;

const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const OLE2_SIGNATURE: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Runs with fewer alphanumeric characters are treated as binary noise
const MIN_RUN_ALNUM: usize = 4;

/// Compound-file stream names that show up as UTF-16 text in the directory
const OLE2_STREAM_NAMES: &[&str] = &[
    "Root Entry",
    "WordDocument",
    "0Table",
    "1Table",
    "Data",
    "CompObj",
    "ObjectPool",
    "SummaryInformation",
    "DocumentSummaryInformation",
];

// ============================================================================
// DocxParser
// ============================================================================

/// OOXML (.docx) parser; paragraphs are joined with newlines
pub struct DocxParser;

impl FormatParser for DocxParser {
    fn parse(&self, bytes: &[u8]) -> KnowledgeResult<String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| KnowledgeError::CorruptDocument(format!("docx: {}", e)))?;

        let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
        extract_paragraphs(&xml)
    }

    fn name(&self) -> &'static str {
        "DocxParser"
    }
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> KnowledgeResult<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| KnowledgeError::CorruptDocument(format!("docx {}: {}", name, e)))?;

    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| KnowledgeError::CorruptDocument(format!("docx {}: {}", name, e)))?;

    if out.len() as u64 >= max_bytes {
        return Err(KnowledgeError::CorruptDocument(format!(
            "docx entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Collect `<w:t>` text; `</w:p>` and `<w:br/>` end a line, `<w:tab/>` is a tab
fn extract_paragraphs(xml: &[u8]) -> KnowledgeResult<String> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);

    let mut out = String::new();
    let mut in_text = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| KnowledgeError::CorruptDocument(format!("docx xml: {}", e)))?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"br" | b"cr" => out.push('\n'),
                b"tab" => out.push('\t'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(KnowledgeError::CorruptDocument(format!("docx xml: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    Ok(out.trim_end().to_string())
}

// ============================================================================
// LegacyWordParser
// ============================================================================

/// Secondary extractor for legacy binary Word files
pub struct LegacyWordParser;

impl FormatParser for LegacyWordParser {
    fn parse(&self, bytes: &[u8]) -> KnowledgeResult<String> {
        if !bytes.starts_with(&OLE2_SIGNATURE) {
            return Err(KnowledgeError::CorruptDocument(
                "not an OLE2 compound document".to_string(),
            ));
        }

        let wide = keep_text_runs(utf16_runs(bytes));
        let narrow = keep_text_runs(byte_runs(bytes));

        let text = if alnum_count(&wide) >= alnum_count(&narrow) {
            wide
        } else {
            narrow
        };
        Ok(text)
    }

    fn name(&self) -> &'static str {
        "LegacyWordParser"
    }
}

fn utf16_runs(bytes: &[u8]) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();

    for pair in bytes.chunks_exact(2) {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        match char::from_u32(unit as u32).and_then(word_char) {
            Some(c) => current.push(c),
            None => flush_run(&mut current, &mut runs),
        }
    }
    flush_run(&mut current, &mut runs);
    runs
}

fn byte_runs(bytes: &[u8]) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();

    for &b in bytes {
        // 8-bit runs are read as Latin-1; the high half only for letters
        let c = char::from(b);
        let accepted = match b {
            0x20..=0x7E | b'\t' | b'\r' | b'\n' | 0x0B => word_char(c),
            0xC0..=0xFF => Some(c),
            _ => None,
        };
        match accepted {
            Some(c) => current.push(c),
            None => flush_run(&mut current, &mut runs),
        }
    }
    flush_run(&mut current, &mut runs);
    runs
}

/// Map a decoded character to document text, `None` for binary noise
fn word_char(c: char) -> Option<char> {
    match c {
        '\r' | '\x0B' => Some('\n'),
        '\t' | '\n' => Some(c),
        ' '..='~' => Some(c),
        '\u{00A0}'..='\u{024F}'      // Latin-1 supplement, Latin extended
        | '\u{2000}'..='\u{206F}'    // general punctuation
        | '\u{3000}'..='\u{30FF}'    // CJK punctuation, kana
        | '\u{4E00}'..='\u{9FFF}'    // CJK unified ideographs
        | '\u{AC00}'..='\u{D7AF}'    // Hangul
        | '\u{FF00}'..='\u{FFEF}' => Some(c),
        _ => None,
    }
}

fn flush_run(current: &mut String, runs: &mut Vec<String>) {
    if !current.is_empty() {
        runs.push(std::mem::take(current));
    }
}

fn keep_text_runs(runs: Vec<String>) -> String {
    runs.into_iter()
        .map(|run| run.trim().to_string())
        .filter(|run| alnum_count(run) >= MIN_RUN_ALNUM)
        .filter(|run| !OLE2_STREAM_NAMES.contains(&run.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn alnum_count(text: &str) -> usize {
    text.chars().filter(|c| c.is_alphanumeric()).count()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_with_body(body: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            let xml = format!(
                "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
                body
            );
            zip.write_all(xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf
    }

    fn ole2_with(payload: &[u8]) -> Vec<u8> {
        let mut bytes = OLE2_SIGNATURE.to_vec();
        bytes.extend(std::iter::repeat(0u8).take(504));
        bytes.extend_from_slice(payload);
        bytes.extend(std::iter::repeat(0u8).take(64));
        bytes
    }

    fn utf16le(text: &str) -> Vec<u8> {
        text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    #[test]
    fn test_docx_paragraphs() {
        let docx = docx_with_body(
            "<w:p><w:r><w:t>Pump </w:t></w:r><w:r><w:t>manual</w:t></w:r></w:p>\
             <w:p><w:r><w:t>Step&amp;check</w:t><w:tab/><w:t>ok</w:t></w:r></w:p>",
        );
        let text = DocxParser.parse(&docx).unwrap();
        assert_eq!(text, "Pump manual\nStep&check\tok");
    }

    #[test]
    fn test_docx_without_text_is_empty() {
        let docx = docx_with_body("<w:p/>");
        assert!(DocxParser.parse(&docx).unwrap().trim().is_empty());
    }

    #[test]
    fn test_docx_invalid_zip() {
        let err = DocxParser.parse(b"not a zip").unwrap_err();
        assert!(matches!(err, KnowledgeError::CorruptDocument(_)));
    }

    #[test]
    fn test_legacy_requires_ole2() {
        let err = LegacyWordParser.parse(b"plain bytes").unwrap_err();
        assert!(matches!(err, KnowledgeError::CorruptDocument(_)));
    }

    #[test]
    fn test_legacy_utf16_text() {
        let mut payload = utf16le("Root Entry");
        payload.extend_from_slice(&[0, 0, 0xFF, 0xFF]);
        payload.extend(utf16le("Hydraulic pump maintenance\r液压泵维护手册"));
        let text = LegacyWordParser.parse(&ole2_with(&payload)).unwrap();

        assert!(text.contains("Hydraulic pump maintenance"));
        assert!(text.contains("液压泵维护手册"));
        assert!(!text.contains("Root Entry"));
    }

    #[test]
    fn test_legacy_8bit_text() {
        let mut payload = b"Valve inspection checklist\rSecond line".to_vec();
        payload.extend_from_slice(&[0x01, 0x02, 0x03]);
        let text = LegacyWordParser.parse(&ole2_with(&payload)).unwrap();

        assert!(text.contains("Valve inspection checklist"));
        assert!(text.contains("Second line"));
    }
}
