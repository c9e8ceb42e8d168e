use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use reqwest::{Client, Method, RequestBuilder};
use serde_json::json;

use crate::config::IndexConfig;
use crate::error::IndexerError;
use crate::extract::Document;

/// The external full-text index. Documents are keyed by their `id`.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn add_documents(&self, documents: &[Document]) -> Result<(), IndexerError>;

    async fn delete_documents(&self, ids: &[String]) -> Result<(), IndexerError>;

    async fn health(&self) -> Result<(), IndexerError>;
}

/// Meilisearch over its HTTP API
pub struct MeiliIndex {
    client: Client,
    base_url: String,
    index_uid: String,
    api_key: String,
}

impl MeiliIndex {
    pub fn new(config: &IndexConfig) -> Result<Self, IndexerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| IndexerError::IndexUnavailable(e.to_string()))?;

        Ok(MeiliIndex {
            client,
            base_url: config.url.trim_end_matches('/').to_owned(),
            index_uid: config.index_name.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        if self.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.api_key)
        }
    }

    async fn send(&self, what: &str, builder: RequestBuilder) -> Result<(), IndexerError> {
        match builder.send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                error!("Search index rejected {}: {} {}", what, status, body);
                Err(IndexerError::IndexUnavailable(format!(
                    "{} returned status {}",
                    what, status
                )))
            }
            Err(e) => {
                error!("Search index unreachable during {}: {}", what, e);
                Err(IndexerError::IndexUnavailable(format!("{} failed: {}", what, e)))
            }
        }
    }
}

#[async_trait]
impl SearchIndex for MeiliIndex {
    async fn add_documents(&self, documents: &[Document]) -> Result<(), IndexerError> {
        if documents.is_empty() {
            return Ok(());
        }
        let path = format!("/indexes/{}/documents?primaryKey=id", self.index_uid);
        let builder = self.request(Method::POST, &path).json(documents);
        self.send("add documents", builder).await?;
        debug!("Published {} documents to '{}'", documents.len(), self.index_uid);
        Ok(())
    }

    async fn delete_documents(&self, ids: &[String]) -> Result<(), IndexerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let path = format!("/indexes/{}/documents/delete-batch", self.index_uid);
        let builder = self.request(Method::POST, &path).json(&json!(ids));
        self.send("delete documents", builder).await?;
        debug!("Deleted {} documents from '{}'", ids.len(), self.index_uid);
        Ok(())
    }

    async fn health(&self) -> Result<(), IndexerError> {
        self.send("health check", self.request(Method::GET, "/health"))
            .await
    }
}

/// In-process index. Used by tests and for dry runs; can be switched off to
/// simulate an outage.
#[derive(Default)]
pub struct MemoryIndex {
    documents: Mutex<HashMap<String, Document>>,
    unavailable: AtomicBool,
    add_calls: AtomicUsize,
    // Number of add calls that succeed before the index goes away
    fail_adds_after: Mutex<Option<usize>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Accept `batches` more add calls, then behave as unreachable
    pub fn fail_after_batches(&self, batches: usize) {
        let done = self.add_calls.load(Ordering::SeqCst);
        *self.fail_adds_after.lock().unwrap() = Some(done + batches);
    }

    pub fn len(&self) -> usize {
        self.documents.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.documents.lock().unwrap().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Document> {
        self.documents.lock().unwrap().get(id).cloned()
    }

    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), IndexerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(IndexerError::IndexUnavailable("memory index is offline".to_owned()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn add_documents(&self, documents: &[Document]) -> Result<(), IndexerError> {
        self.check_available()?;
        let calls = self.add_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = *self.fail_adds_after.lock().unwrap() {
            if calls >= limit {
                self.set_available(false);
                return Err(IndexerError::IndexUnavailable(
                    "memory index went offline".to_owned(),
                ));
            }
        }

        let mut map = self.documents.lock().unwrap();
        for doc in documents {
            map.insert(doc.id.clone(), doc.clone());
        }
        Ok(())
    }

    async fn delete_documents(&self, ids: &[String]) -> Result<(), IndexerError> {
        self.check_available()?;
        let mut map = self.documents.lock().unwrap();
        for id in ids {
            map.remove(id);
        }
        Ok(())
    }

    async fn health(&self) -> Result<(), IndexerError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn doc(id: &str) -> Document {
        Document {
            id: id.to_owned(),
            source_id: "s".into(),
            source_name: "S".into(),
            path: format!("/r/{}", id),
            basename: id.to_owned(),
            extension: "txt".into(),
            doc_type: "text".into(),
            size_bytes: 1,
            modified_at: 0,
            indexed_at: 0,
            content: "x".into(),
            title: None,
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_memory_index_add_and_delete() {
        let index = MemoryIndex::new();
        index.add_documents(&[doc("a"), doc("b")]).await.unwrap();
        assert_eq!(index.len(), 2);

        index.delete_documents(&["a".to_owned()]).await.unwrap();
        assert!(!index.contains("a"));
        assert!(index.contains("b"));
    }

    #[tokio::test]
    async fn test_memory_index_outage() {
        let index = MemoryIndex::new();
        index.set_available(false);
        assert!(matches!(
            index.add_documents(&[doc("a")]).await,
            Err(IndexerError::IndexUnavailable(_))
        ));
        assert!(index.health().await.is_err());

        index.set_available(true);
        index.fail_after_batches(1);
        assert!(index.add_documents(&[doc("a")]).await.is_ok());
        assert!(index.add_documents(&[doc("b")]).await.is_err());
        assert!(index.contains("a"));
        assert!(!index.contains("b"));
    }

    #[test]
    fn test_document_serializes_type_field() {
        let value = serde_json::to_value(doc("a")).unwrap();
        assert_eq!(value["type"], "text");
        assert!(value.get("doc_type").is_none());
    }

    #[tokio::test]
    async fn test_meili_unreachable_is_index_unavailable() {
        let config = IndexConfig {
            url: "http://127.0.0.1:1".to_owned(),
            request_timeout_secs: 2,
            ..Default::default()
        };
        let index = MeiliIndex::new(&config).unwrap();

        assert!(matches!(
            index.health().await,
            Err(IndexerError::IndexUnavailable(_))
        ));
        // Empty batches never touch the network
        assert!(index.add_documents(&[]).await.is_ok());
        assert_eq!(index.url("/health"), "http://127.0.0.1:1/health");
    }
}
