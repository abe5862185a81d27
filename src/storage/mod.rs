//! Durable document storage
//!
//! Every durable store in the crate is a set of JSON documents addressed by
//! `(collection, key)`:
//! - `fs`: one directory per collection, one `<key>.json` per document
//! - `sqlite`: a single `documents` table
//! - `MemoryDocumentStore`: process-local, used by tests and `memory` backend

pub mod fs;
pub mod sqlite;
pub mod topic;

#[cfg(test)]
mod tests;
#[cfg(test)]
pub(crate) mod testing;

pub use fs::FsDocumentStore;
pub use sqlite::SqliteDocumentStore;
pub use topic::{TopicFeed, TopicStore};

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{FeedError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Key-value store of raw JSON documents
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Backend name for logs
    fn backend(&self) -> &'static str;

    /// Raw document body, `None` if absent
    async fn get(&self, collection: &str, key: &str) -> Result<Option<String>>;

    /// Create or replace a document. Returns once the write is durable.
    async fn put(&self, collection: &str, key: &str, body: &str) -> Result<()>;

    /// Remove a document. Returns false if it did not exist.
    async fn delete(&self, collection: &str, key: &str) -> Result<bool>;

    /// All keys in a collection, sorted ascending
    async fn list_keys(&self, collection: &str) -> Result<Vec<String>>;
}

/// Load and deserialize a document.
///
/// A body that does not parse as `T` is reported as `CorruptRecord`.
pub async fn load<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    key: &str,
) -> Result<Option<T>> {
    let Some(body) = store.get(collection, key).await? else {
        return Ok(None);
    };
    serde_json::from_str(&body)
        .map(Some)
        .map_err(|e| FeedError::corrupt(format!("{}/{}", collection, key), e))
}

/// Serialize and store a document
pub async fn save<T: Serialize + ?Sized + Sync>(
    store: &dyn DocumentStore,
    collection: &str,
    key: &str,
    value: &T,
) -> Result<()> {
    let body = serde_json::to_string_pretty(value)?;
    store.put(collection, key, &body).await
}

/// Open the backend selected in configuration
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn DocumentStore>> {
    let path = shellexpand::tilde(&config.path).to_string();
    let store: Arc<dyn DocumentStore> = match config.backend {
        StorageBackend::Fs => Arc::new(FsDocumentStore::new(&path)),
        StorageBackend::Sqlite => Arc::new(SqliteDocumentStore::connect(&path).await?),
        StorageBackend::Memory => Arc::new(MemoryDocumentStore::new()),
    };
    tracing::info!("[Storage] Opened {} store at {}", store.backend(), path);
    Ok(store)
}

/// In-memory document store
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    docs: RwLock<BTreeMap<String, BTreeMap<String, String>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection
    pub fn count(&self, collection: &str) -> usize {
        self.docs.read().get(collection).map_or(0, |c| c.len())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .docs
            .read()
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned())
    }

    async fn put(&self, collection: &str, key: &str, body: &str) -> Result<()> {
        self.docs
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), body.to_string());
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        let mut docs = self.docs.write();
        Ok(docs
            .get_mut(collection)
            .map(|c| c.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn list_keys(&self, collection: &str) -> Result<Vec<String>> {
        Ok(self
            .docs
            .read()
            .get(collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }
}
