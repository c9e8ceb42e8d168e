use std::fs;
use std::path::Path;

use crate::config::ExtractionConfig;
use crate::extract::document::Extracted;
use crate::try_failed;

const TITLE_SCAN_LINES: usize = 5;
const TITLE_MAX_CHARS: usize = 100;
const COMMENT_PREFIXES: [&str; 5] = ["#", "//", "/*", "--", "<!--"];

/// Decode bytes as UTF-8 (BOM stripped), falling back to Latin-1, which
/// accepts any byte sequence. Returns the text and the encoding used.
pub fn decode(bytes: &[u8]) -> (String, &'static str) {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => (s.to_owned(), "utf-8"),
        Err(_) => (bytes.iter().map(|&b| b as char).collect(), "latin-1"),
    }
}

/// First short non-empty line near the top, with a leading comment marker
/// removed.
pub fn title_from_lines(content: &str) -> Option<String> {
    for line in content.lines().take(TITLE_SCAN_LINES) {
        let mut line = line.trim();
        if line.is_empty() || line.chars().count() > TITLE_MAX_CHARS {
            continue;
        }
        for prefix in COMMENT_PREFIXES {
            if let Some(rest) = line.strip_prefix(prefix) {
                line = rest.trim();
            }
        }
        if !line.is_empty() {
            return Some(line.to_owned());
        }
    }
    None
}

pub fn extract(path: &Path, _config: &ExtractionConfig) -> Result<Extracted, String> {
    let bytes = try_failed!(fs::read(path), "Cannot read file");
    let (content, encoding) = decode(&bytes);

    let mut extracted = Extracted::new(String::new());
    extracted.title = title_from_lines(&content);
    extracted.insert("encoding", encoding);
    extracted.insert("line_count", content.matches('\n').count() + 1);
    extracted.content = content;

    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_falls_back_to_latin1() {
        assert_eq!(decode("héllo".as_bytes()), ("héllo".to_owned(), "utf-8"));
        assert_eq!(decode(b"\xEF\xBB\xBFbom"), ("bom".to_owned(), "utf-8"));
        assert_eq!(decode(b"caf\xE9"), ("café".to_owned(), "latin-1"));
    }

    #[test]
    fn test_title_skips_blank_and_long_lines_and_strips_comments() {
        assert_eq!(
            title_from_lines("\n\n# Build helpers\nset -e\n").as_deref(),
            Some("Build helpers")
        );
        assert_eq!(
            title_from_lines("// Parser entry point\nfn main() {}").as_deref(),
            Some("Parser entry point")
        );
        let long = "x".repeat(150);
        assert_eq!(
            title_from_lines(&format!("{}\nshort", long)).as_deref(),
            Some("short")
        );
        assert_eq!(title_from_lines("#\n\n\n\n\nlate title"), None);
    }

    #[test]
    fn test_extract_counts_lines_and_reports_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("latin.txt");
        fs::write(&file, b"Caf\xE9 menu\nsoup\n").unwrap();

        let extracted = extract(&file, &ExtractionConfig::default()).unwrap();

        assert_eq!(extracted.content, "Café menu\nsoup\n");
        assert_eq!(extracted.title.as_deref(), Some("Café menu"));
        assert_eq!(extracted.metadata_str("encoding"), Some("latin-1"));
        assert_eq!(extracted.metadata["line_count"], 3);
    }
}
