use std::fmt::Display;
use std::path::Path;

use calamine::{open_workbook_auto, Reader};
use log::warn;
use serde_json::{Map, Value};

use crate::config::ExtractionConfig;
use crate::extract::document::Extracted;
use crate::extract::office::is_ole_container;

#[derive(Debug, Default, PartialEq)]
struct SheetText {
    lines: Vec<String>,
    rows: usize,
    cells: usize,
}

fn render_sheet<'a, T>(
    name: &str,
    rows: impl Iterator<Item = &'a [T]>,
    max_rows: usize,
    max_cols: usize,
) -> SheetText
where
    T: Display + 'a,
{
    let mut sheet = SheetText {
        lines: vec![format!("=== Sheet: {} ===", name)],
        ..Default::default()
    };

    for row in rows {
        let values: Vec<String> = row
            .iter()
            .take(max_cols)
            .map(|cell| cell.to_string().trim().to_owned())
            .filter(|value| !value.is_empty())
            .collect();
        if values.is_empty() {
            continue;
        }

        sheet.cells += values.len();
        sheet.lines.push(values.join(" | "));
        sheet.rows += 1;

        if sheet.rows >= max_rows {
            sheet
                .lines
                .push(format!("... (truncated at {} rows)", max_rows));
            break;
        }
    }

    sheet
}

pub fn extract(path: &Path, config: &ExtractionConfig) -> Result<Extracted, String> {
    let is_ooxml = matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("xlsx") | Some("xlsm")
    );
    if is_ooxml && is_ole_container(path) {
        return Err("File is password-protected".to_owned());
    }

    let mut workbook = match open_workbook_auto(path) {
        Ok(workbook) => workbook,
        Err(e) => {
            let message = e.to_string();
            if message.to_ascii_lowercase().contains("password") {
                return Err("File is password-protected".to_owned());
            }
            return Err(format!("File corrupted or invalid format: {}", message));
        }
    };

    let sheet_names = workbook.sheet_names().to_owned();
    let mut lines = Vec::new();
    let mut total_rows = 0;
    let mut total_cells = 0;
    let mut sheet_errors = Map::new();

    for name in &sheet_names {
        let range = match workbook.worksheet_range(name) {
            Ok(range) => range,
            Err(e) => {
                warn!(
                    "Skipping unreadable sheet '{}' in '{}': {}",
                    name,
                    path.display(),
                    e
                );
                sheet_errors.insert(name.clone(), Value::String(e.to_string()));
                continue;
            }
        };

        let sheet = render_sheet(
            name,
            range.rows(),
            config.max_spreadsheet_rows,
            config.max_spreadsheet_cols,
        );
        total_rows += sheet.rows;
        total_cells += sheet.cells;
        lines.extend(sheet.lines);
    }

    if !sheet_names.is_empty() && sheet_errors.len() == sheet_names.len() {
        return Err("No readable sheets in workbook".to_owned());
    }

    let mut extracted = Extracted::new(lines.join("\n"));
    extracted.insert("sheet_count", sheet_names.len());
    extracted.insert("sheet_names", sheet_names);
    extracted.insert("total_rows_extracted", total_rows);
    extracted.insert("total_cells_extracted", total_cells);
    if !sheet_errors.is_empty() {
        extracted.insert("sheet_errors", Value::Object(sheet_errors));
    }
    if total_cells == 0 {
        extracted.insert(
            "extraction_warning",
            "No cell values extracted (spreadsheet may be empty)",
        );
    }

    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::File;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const WORKBOOK: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Parts" sheetId="1" r:id="rId1"/><sheet name="Lost" sheetId="2" r:id="rId2"/></sheets></workbook>"#;

    const RELS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet2.xml"/></Relationships>"#;

    const PARTS_SHEET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData><row r="1"><c r="A1" t="inlineStr"><is><t>Name</t></is></c><c r="B1" t="inlineStr"><is><t>Qty</t></is></c></row><row r="2"><c r="A2" t="inlineStr"><is><t>Bolt</t></is></c><c r="B2" t="inlineStr"><is><t>12</t></is></c></row></sheetData></worksheet>"#;

    // The second sheet is declared but its part is missing from the package
    fn write_workbook(path: &Path) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, body) in [
            ("xl/workbook.xml", WORKBOOK),
            ("xl/_rels/workbook.xml.rels", RELS),
            ("xl/worksheets/sheet1.xml", PARTS_SHEET),
        ] {
            writer.start_file(name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    fn grid(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_render_skips_blank_cells_and_rows() {
        let data = grid(&[&["Name", "", "Qty"], &["", " "], &["Bolt", "M4", " 12 "]]);

        let sheet = render_sheet("Parts", data.iter().map(Vec::as_slice), 100, 100);

        assert_eq!(
            sheet.lines,
            vec!["=== Sheet: Parts ===", "Name | Qty", "Bolt | M4 | 12"]
        );
        assert_eq!(sheet.rows, 2);
        assert_eq!(sheet.cells, 5);
    }

    #[test]
    fn test_render_caps_rows_and_columns() {
        let data = grid(&[&["a", "b", "c"], &["d", "e", "f"], &["g", "h", "i"]]);

        let sheet = render_sheet("S", data.iter().map(Vec::as_slice), 2, 2);

        assert_eq!(
            sheet.lines,
            vec!["=== Sheet: S ===", "a | b", "d | e", "... (truncated at 2 rows)"]
        );
    }

    #[test]
    fn test_unreadable_sheet_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("inventory.xlsx");
        write_workbook(&file);

        let extracted = extract(&file, &ExtractionConfig::default()).unwrap();

        assert_eq!(extracted.content, "=== Sheet: Parts ===\nName | Qty\nBolt | 12");
        assert_eq!(extracted.metadata["sheet_count"], 2);
        assert_eq!(extracted.metadata["total_rows_extracted"], 2);
        assert_eq!(extracted.metadata["total_cells_extracted"], 4);
        let errors = extracted.metadata["sheet_errors"].as_object().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors.contains_key("Lost"));
        assert!(extracted.metadata.get("extraction_warning").is_none());
    }

    #[test]
    fn test_corrupt_workbook_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("broken.xlsx");
        std::fs::write(&file, "definitely not a workbook").unwrap();

        let reason = extract(&file, &ExtractionConfig::default()).unwrap_err();
        assert!(reason.starts_with("File corrupted or invalid format"), "{}", reason);
    }
}
