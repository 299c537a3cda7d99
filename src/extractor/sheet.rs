//! Spreadsheets (xlsx / xls) via calamine
//!
//! Every sheet becomes a `Sheet: <name>` header followed by its rows as CSV.
//! Sheets without any non-empty cell are skipped; blocks are separated by a
//! blank line.

use std::io::{Cursor, Read, Seek};

use calamine::Reader; // sheet_names / worksheet_range

use crate::knowledge::{KnowledgeError, KnowledgeResult};

use super::FormatParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Workbook {
    Xlsx,
    Xls,
}

/// Workbook parser for one spreadsheet container format
pub struct SpreadsheetParser {
    kind: Workbook,
}

impl SpreadsheetParser {
    pub fn xlsx() -> Self {
        Self {
            kind: Workbook::Xlsx,
        }
    }

    pub fn xls() -> Self {
        Self {
            kind: Workbook::Xls,
        }
    }
}

impl FormatParser for SpreadsheetParser {
    fn parse(&self, bytes: &[u8]) -> KnowledgeResult<String> {
        let cursor = Cursor::new(bytes.to_vec());
        match self.kind {
            Workbook::Xlsx => {
                let workbook = calamine::Xlsx::new(cursor)
                    .map_err(|e| KnowledgeError::CorruptDocument(format!("xlsx: {}", e)))?;
                render_workbook(workbook)
            }
            Workbook::Xls => {
                let workbook = calamine::Xls::new(cursor)
                    .map_err(|e| KnowledgeError::CorruptDocument(format!("xls: {}", e)))?;
                render_workbook(workbook)
            }
        }
    }

    fn name(&self) -> &'static str {
        match self.kind {
            Workbook::Xlsx => "SpreadsheetParser(xlsx)",
            Workbook::Xls => "SpreadsheetParser(xls)",
        }
    }
}

fn render_workbook<RS, R>(mut workbook: R) -> KnowledgeResult<String>
where
    RS: Read + Seek,
    R: Reader<RS>,
{
    let mut blocks = Vec::new();

    for name in workbook.sheet_names() {
        let range = match workbook.worksheet_range(&name) {
            Ok(range) => range,
            Err(e) => {
                return Err(KnowledgeError::CorruptDocument(format!(
                    "sheet {}: {:?}",
                    name, e
                )))
            }
        };

        let rows: Vec<Vec<String>> = range
            .rows()
            .map(|row| row.iter().map(cell_to_string).collect())
            .collect();

        let csv = rows_to_csv(&rows);
        if csv.is_empty() {
            tracing::debug!("Skipping empty sheet {}", name);
            continue;
        }
        blocks.push(format!("Sheet: {}\n{}", name, csv));
    }

    Ok(blocks.join("\n\n"))
}

fn cell_to_string(c: &calamine::DataType) -> String {
    use calamine::DataType as D;
    match c {
        D::Empty => String::new(),
        D::String(s) => s.clone(),
        D::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        D::Int(i) => i.to_string(),
        D::Bool(b) => if *b { "TRUE".into() } else { "FALSE".into() },
        D::Error(e) => format!("#ERR:{:?}", e),
        other => format!("{}", other),
    }
}

/// Rows as CSV lines; trailing empty cells dropped, blank rows skipped
fn rows_to_csv(rows: &[Vec<String>]) -> String {
    rows.iter()
        .filter_map(|row| {
            let last = row.iter().rposition(|cell| !cell.trim().is_empty())?;
            Some(
                row[..=last]
                    .iter()
                    .map(|cell| csv_field(cell))
                    .collect::<Vec<_>>()
                    .join(","),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn csv_field(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SHEET_NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";

    fn minimal_xlsx() -> Vec<u8> {
        let workbook = format!(
            "<?xml version=\"1.0\"?><workbook xmlns=\"{}\" xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\"><sheets>\
             <sheet name=\"Parts\" sheetId=\"1\" r:id=\"rId1\"/>\
             <sheet name=\"Blank\" sheetId=\"2\" r:id=\"rId2\"/>\
             </sheets></workbook>",
            SHEET_NS
        );
        let rels = "<?xml version=\"1.0\"?><Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">\
             <Relationship Id=\"rId1\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet\" Target=\"worksheets/sheet1.xml\"/>\
             <Relationship Id=\"rId2\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet\" Target=\"worksheets/sheet2.xml\"/>\
             </Relationships>";
        let sheet1 = format!(
            "<?xml version=\"1.0\"?><worksheet xmlns=\"{}\"><sheetData>\
             <row r=\"1\"><c r=\"A1\" t=\"inlineStr\"><is><t>part</t></is></c><c r=\"B1\" t=\"inlineStr\"><is><t>qty</t></is></c></row>\
             <row r=\"2\"><c r=\"A2\" t=\"inlineStr\"><is><t>pump, large</t></is></c><c r=\"B2\"><v>3</v></c></row>\
             </sheetData></worksheet>",
            SHEET_NS
        );
        let sheet2 = format!(
            "<?xml version=\"1.0\"?><worksheet xmlns=\"{}\"><sheetData/></worksheet>",
            SHEET_NS
        );

        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            let options = zip::write::SimpleFileOptions::default();
            for (name, body) in [
                ("xl/workbook.xml", workbook.as_str()),
                ("xl/_rels/workbook.xml.rels", rels),
                ("xl/worksheets/sheet1.xml", sheet1.as_str()),
                ("xl/worksheets/sheet2.xml", sheet2.as_str()),
            ] {
                zip.start_file(name, options).unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn test_xlsx_sheets_as_csv() {
        let text = SpreadsheetParser::xlsx().parse(&minimal_xlsx()).unwrap();
        assert_eq!(text, "Sheet: Parts\npart,qty\n\"pump, large\",3");
    }

    #[test]
    fn test_invalid_workbook_is_corrupt() {
        let err = SpreadsheetParser::xlsx().parse(b"not a zip").unwrap_err();
        assert!(matches!(err, KnowledgeError::CorruptDocument(_)));

        let err = SpreadsheetParser::xls().parse(b"not an ole file").unwrap_err();
        assert!(matches!(err, KnowledgeError::CorruptDocument(_)));
    }

    #[test]
    fn test_rows_to_csv() {
        let rows = vec![
            vec!["a".to_string(), "".to_string(), "".to_string()],
            vec!["".to_string(), "".to_string()],
            vec!["say \"hi\"".to_string(), "x\ny".to_string()],
        ];
        assert_eq!(rows_to_csv(&rows), "a\n\"say \"\"hi\"\"\",\"x\ny\"");
        assert_eq!(rows_to_csv(&[]), "");
    }
}
