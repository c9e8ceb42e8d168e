use serde::Serialize;
use serde_json::{Map, Value};

/// Normalized document shipped to the search index
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub source_id: String,
    pub source_name: String,
    pub path: String,
    pub basename: String,
    pub extension: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub size_bytes: u64,
    pub modified_at: i64,
    pub indexed_at: i64,
    pub content: String,
    pub title: Option<String>,
    pub metadata: Map<String, Value>,
}

/// What an extraction routine recovers from a file before it is stamped with
/// source and filesystem details.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Extracted {
    pub content: String,
    pub title: Option<String>,
    pub metadata: Map<String, Value>,
}

impl Extracted {
    pub fn new(content: String) -> Self {
        Extracted {
            content,
            ..Default::default()
        }
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_owned(), value.into());
    }

    /// Insert only when `value` is present and not blank
    pub fn insert_nonempty(&mut self, key: &str, value: Option<String>) {
        if let Some(v) = value {
            let v = v.trim();
            if !v.is_empty() {
                self.metadata.insert(key.to_owned(), Value::String(v.to_owned()));
            }
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}
