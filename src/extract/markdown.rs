use std::fs;
use std::path::Path;

use log::debug;
use serde_json::Value;

use crate::config::ExtractionConfig;
use crate::extract::document::Extracted;
use crate::extract::text::decode;
use crate::try_failed;

const PROMOTED_KEYS: [&str; 4] = ["tags", "date", "author", "description"];

/// Split a leading `---` YAML block from the body. Returns (yaml, body).
fn split_front_matter(content: &str) -> (Option<&str>, &str) {
    let Some(rest) = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))
    else {
        return (None, content);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(yaml), body);
        }
        offset += line.len();
    }

    (None, content)
}

fn parse_front_matter(yaml: &str) -> Option<serde_json::Map<String, Value>> {
    let parsed: serde_yaml::Value = match serde_yaml::from_str(yaml) {
        Ok(v) => v,
        Err(e) => {
            debug!("Ignoring unparsable front matter: {}", e);
            return None;
        }
    };
    match serde_json::to_value(parsed) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn heading_title(body: &str) -> Option<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| line.starts_with("# "))
        .map(|line| line.trim_start_matches('#').trim())
        .find(|title| !title.is_empty())
        .map(str::to_owned)
}

pub fn extract(path: &Path, _config: &ExtractionConfig) -> Result<Extracted, String> {
    let bytes = try_failed!(fs::read(path), "Cannot read file");
    let (content, encoding) = decode(&bytes);

    let (yaml, body) = split_front_matter(&content);
    let front_matter = yaml.and_then(parse_front_matter).unwrap_or_default();

    let mut extracted = Extracted::new(body.to_owned());
    extracted.insert("encoding", encoding);
    extracted.insert("has_frontmatter", !front_matter.is_empty());

    for key in PROMOTED_KEYS {
        match front_matter.get(key) {
            Some(Value::Null) | None => {}
            Some(Value::String(s)) => extracted.insert(key, s.clone()),
            // Dates must stay strings, tags keep their list shape
            Some(v) if key == "date" => extracted.insert(key, v.to_string()),
            Some(v) => extracted.insert(key, v.clone()),
        }
    }

    extracted.title = match front_matter.get("title") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        Some(v) if !v.is_null() && !v.is_string() => Some(v.to_string()),
        _ => None,
    }
    .or_else(|| heading_title(body));

    extracted.insert("frontmatter", Value::Object(front_matter));

    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn extract_str(content: &str) -> Extracted {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("note.md");
        fs::write(&file, content).unwrap();
        extract(&file, &ExtractionConfig::default()).unwrap()
    }

    #[test]
    fn test_front_matter_is_promoted() {
        let extracted = extract_str(
            "---\ntitle: Release Plan\ntags: [q3, roadmap]\ndate: 2026-02-05\nauthor: Sam\n---\n# Heading\nBody text\n",
        );

        assert_eq!(extracted.title.as_deref(), Some("Release Plan"));
        assert_eq!(extracted.content, "# Heading\nBody text\n");
        assert_eq!(extracted.metadata["tags"], json!(["q3", "roadmap"]));
        assert_eq!(extracted.metadata["date"], json!("2026-02-05"));
        assert_eq!(extracted.metadata["author"], json!("Sam"));
        assert_eq!(extracted.metadata["has_frontmatter"], json!(true));
        assert_eq!(extracted.metadata["frontmatter"]["title"], json!("Release Plan"));
    }

    #[test]
    fn test_heading_title_without_front_matter() {
        let extracted = extract_str("Intro line\n\n# Getting Started\n## Install\n");
        assert_eq!(extracted.title.as_deref(), Some("Getting Started"));
        assert_eq!(extracted.metadata["has_frontmatter"], json!(false));
    }

    #[test]
    fn test_no_title_falls_through() {
        let extracted = extract_str("just words\n## not a top heading\n");
        assert_eq!(extracted.title, None);
    }

    #[test]
    fn test_unterminated_front_matter_is_body() {
        let (yaml, body) = split_front_matter("---\ntitle: x\nno closing fence\n");
        assert_eq!(yaml, None);
        assert_eq!(body, "---\ntitle: x\nno closing fence\n");
    }
}
