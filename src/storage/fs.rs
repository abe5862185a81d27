//! Filesystem document store
//!
//! Layout: `<root>/<collection>/<key>.json`. Writes go to a hidden temp
//! file first and are renamed into place, so a reader never sees a
//! half-written document.

use super::DocumentStore;
use crate::error::{FeedError, Result};
use crate::types::validate_key;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: &str) -> Result<PathBuf> {
        let mut dir = self.root.clone();
        for segment in collection.split('/') {
            validate_key("collection segment", segment)?;
            dir.push(segment);
        }
        Ok(dir)
    }

    fn doc_path(&self, collection: &str, key: &str) -> Result<PathBuf> {
        validate_key("document key", key)?;
        Ok(self.collection_dir(collection)?.join(format!("{}.json", key)))
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    fn backend(&self) -> &'static str {
        "fs"
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<String>> {
        let path = self.doc_path(collection, key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FeedError::Persistence(format!("read {}: {}", path.display(), e))),
        }
    }

    async fn put(&self, collection: &str, key: &str, body: &str) -> Result<()> {
        let path = self.doc_path(collection, key)?;
        let dir = self.collection_dir(collection)?;
        let tmp = dir.join(format!(".{}.json.tmp", key));

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| FeedError::Persistence(format!("mkdir {}: {}", dir.display(), e)))?;

        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(body.as_bytes()).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &path).await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(FeedError::Persistence(format!("write {}: {}", path.display(), e)));
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        let path = self.doc_path(collection, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FeedError::Persistence(format!("delete {}: {}", path.display(), e))),
        }
    }

    async fn list_keys(&self, collection: &str) -> Result<Vec<String>> {
        let dir = self.collection_dir(collection)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(FeedError::Persistence(format!("list {}: {}", dir.display(), e)))
            }
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = name.strip_suffix(".json") {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}
