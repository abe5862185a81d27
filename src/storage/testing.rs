//! Fault-injecting store for tests

use super::{DocumentStore, MemoryDocumentStore};
use crate::error::{FeedError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// Memory store whose writes or deletes can be made to fail per collection.
/// Reads can also be made to yield, so concurrent tasks interleave.
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: MemoryDocumentStore,
    failing_puts: RwLock<HashSet<String>>,
    failing_deletes: RwLock<HashSet<String>>,
    yield_on_get: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_puts(&self, collection: &str) {
        self.failing_puts.write().insert(collection.to_string());
    }

    pub fn fail_deletes(&self, collection: &str) {
        self.failing_deletes.write().insert(collection.to_string());
    }

    pub fn yield_reads(&self) {
        self.yield_on_get.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.failing_puts.write().clear();
        self.failing_deletes.write().clear();
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<String>> {
        if self.yield_on_get.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        self.inner.get(collection, key).await
    }

    async fn put(&self, collection: &str, key: &str, body: &str) -> Result<()> {
        if self.failing_puts.read().contains(collection) {
            return Err(FeedError::Persistence(format!("injected write failure for {}/{}", collection, key)));
        }
        self.inner.put(collection, key, body).await
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        if self.failing_deletes.read().contains(collection) {
            return Err(FeedError::Persistence(format!("injected delete failure for {}/{}", collection, key)));
        }
        self.inner.delete(collection, key).await
    }

    async fn list_keys(&self, collection: &str) -> Result<Vec<String>> {
        self.inner.list_keys(collection).await
    }
}
