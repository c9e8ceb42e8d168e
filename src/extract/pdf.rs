use std::path::Path;

use log::{debug, warn};
use lopdf::{Dictionary, Document, Object};

use crate::config::ExtractionConfig;
use crate::extract::document::Extracted;

const INFO_FIELDS: [(&[u8], &str); 5] = [
    (b"Title", "title"),
    (b"Author", "author"),
    (b"Subject", "subject"),
    (b"Creator", "creator"),
    (b"Producer", "producer"),
];

const PASSWORD_KEYWORDS: [&str; 5] = ["password", "encrypt", "decrypt", "protected", "cipher"];

fn looks_password_related(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    PASSWORD_KEYWORDS.iter().any(|k| message.contains(k))
}

/// PDF text strings are either UTF-16BE with a BOM or PDFDocEncoding, which
/// matches Latin-1 for printable characters.
fn decode_pdf_string(bytes: &[u8]) -> String {
    if let Some(utf16) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = utf16
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&b| b as char).collect()
}

fn info_dictionary(doc: &Document) -> Option<&Dictionary> {
    match doc.trailer.get(b"Info").ok()? {
        Object::Reference(id) => doc.get_dictionary(*id).ok(),
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

pub fn extract(path: &Path, _config: &ExtractionConfig) -> Result<Extracted, String> {
    let mut doc = match Document::load(path) {
        Ok(doc) => doc,
        Err(e) => {
            let message = e.to_string();
            if looks_password_related(&message) {
                return Err("PDF is password-protected".to_owned());
            }
            return Err(format!("Failed to open PDF: {}", message));
        }
    };

    if doc.is_encrypted() && doc.decrypt("").is_err() {
        return Err("PDF is password-protected".to_owned());
    }

    let pages = doc.get_pages();
    let mut extracted = Extracted::default();
    extracted.insert("page_count", pages.len());

    if let Some(info) = info_dictionary(&doc) {
        for (key, name) in INFO_FIELDS {
            if let Ok(Object::String(bytes, _)) = info.get(key) {
                extracted.insert_nonempty(name, Some(decode_pdf_string(bytes)));
            }
        }
    }

    let mut parts = Vec::new();
    let mut page_errors = serde_json::Map::new();
    for page_number in pages.keys() {
        match doc.extract_text(&[*page_number]) {
            Ok(text) if !text.trim().is_empty() => parts.push(text),
            Ok(_) => {}
            Err(e) => {
                debug!(
                    "Skipping page {} of '{}': {}",
                    page_number,
                    path.display(),
                    e
                );
                page_errors.insert(page_number.to_string(), e.to_string().into());
            }
        }
    }

    let content = parts.join("\n\n");
    extracted.insert("pages_extracted", parts.len());
    if !page_errors.is_empty() {
        extracted.insert("page_errors", serde_json::Value::Object(page_errors));
    }
    if content.trim().is_empty() {
        warn!("No text extracted from '{}' (image-based PDF?)", path.display());
        extracted.insert(
            "extraction_warning",
            "No text extracted (might be image-based PDF)",
        );
    }

    extracted.title = extracted.metadata_str("title").map(str::to_owned);
    extracted.content = content;

    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Stream, StringFormat};

    fn text_page(text: &str) -> Vec<Operation> {
        vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 48.into()]),
            Operation::new("Td", vec![100.into(), 600.into()]),
            Operation::new("Tj", vec![Object::string_literal(text)]),
            Operation::new("ET", vec![]),
        ]
    }

    fn write_pdf(path: &Path, text: &str, title: Option<&str>) {
        write_pdf_pages(path, vec![text_page(text)], title);
    }

    fn write_pdf_pages(path: &Path, pages: Vec<Vec<Operation>>, title: Option<&str>) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! {
                "F1" => font_id,
            },
        });

        let mut kids: Vec<Object> = Vec::new();
        for operations in pages {
            let content = Content { operations };
            let content_id =
                doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }

        let pages = dictionary! {
            "Type" => "Pages",
            "Count" => kids.len() as i64,
            "Kids" => kids,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        if let Some(title) = title {
            let info_id = doc.add_object(dictionary! {
                "Title" => Object::String(title.as_bytes().to_vec(), StringFormat::Literal),
            });
            doc.trailer.set("Info", info_id);
        }
        doc.save(path).unwrap();
    }

    #[test]
    fn test_extracts_text_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hello.pdf");
        write_pdf(&file, "Hello World!", Some("Greeting"));

        let extracted = extract(&file, &ExtractionConfig::default()).unwrap();

        assert!(extracted.content.contains("Hello World!"));
        assert_eq!(extracted.title.as_deref(), Some("Greeting"));
        assert_eq!(extracted.metadata["page_count"], 1);
        assert_eq!(extracted.metadata["pages_extracted"], 1);
    }

    #[test]
    fn test_unreadable_page_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mixed.pdf");
        // A font selection without operands cannot be decoded
        let broken = vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![]),
            Operation::new("ET", vec![]),
        ];
        write_pdf_pages(&file, vec![text_page("First page"), broken], None);

        let extracted = extract(&file, &ExtractionConfig::default()).unwrap();

        assert!(extracted.content.contains("First page"));
        assert_eq!(extracted.metadata["page_count"], 2);
        assert_eq!(extracted.metadata["pages_extracted"], 1);
        let errors = extracted.metadata["page_errors"].as_object().unwrap();
        assert_eq!(errors.keys().collect::<Vec<_>>(), vec!["2"]);
        assert!(extracted.metadata.get("extraction_warning").is_none());
    }

    #[test]
    fn test_corrupt_pdf_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("broken.pdf");
        std::fs::write(&file, b"this is not a pdf at all").unwrap();

        let reason = extract(&file, &ExtractionConfig::default()).unwrap_err();
        assert!(reason.starts_with("Failed to open PDF"), "{}", reason);
    }

    #[test]
    fn test_decode_pdf_string() {
        assert_eq!(decode_pdf_string(b"Plain"), "Plain");
        assert_eq!(
            decode_pdf_string(&[0xFE, 0xFF, 0x00, 0x48, 0x00, 0xE9]),
            "Hé"
        );
    }
}
