//! Stock producers for list and snapshot sections

use super::producer::{Candidate, Computed, SectionProducer};
use crate::error::{FeedError, Result};
use crate::storage::{load, save, DocumentStore, TopicStore};
use crate::types::RawRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Upstream collaborator supplying normalized records for a topic
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(&self, topic: &str) -> Result<Vec<RawRecord>>;
}

/// Upstream collaborator supplying a snapshot value (prices, macro, ...)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self) -> Result<serde_json::Value>;
}

/// Fire-and-forget AI classification of newly merged records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, records: Vec<RawRecord>) -> Result<()>;
}

/// List section fed from a primary source, falling back to the durable topic
pub struct TopicFeedProducer {
    name: String,
    topic: String,
    primary: Option<Arc<dyn RecordSource>>,
    topics: TopicStore,
    fallback_limit: usize,
    classifier: Option<Arc<dyn Classifier>>,
}

impl TopicFeedProducer {
    /// Producer reading only the durable topic store
    pub fn from_store(topic: &str, topics: TopicStore, limit: usize) -> Self {
        Self {
            name: format!("topic:{}", topic),
            topic: topic.to_string(),
            primary: None,
            topics,
            fallback_limit: limit,
            classifier: None,
        }
    }

    /// Use `primary` first; the topic store becomes the fallback
    pub fn with_primary(mut self, primary: Arc<dyn RecordSource>) -> Self {
        self.primary = Some(primary);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }
}

#[async_trait]
impl SectionProducer for TopicFeedProducer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn compute(&self) -> Result<Computed> {
        let Some(primary) = &self.primary else {
            let records = self.topics.recent(&self.topic, self.fallback_limit).await?;
            return Ok(Computed::live(Candidate::Records(records)));
        };

        match primary.fetch(&self.topic).await {
            Ok(records) => {
                // Keep the durable copy warm for the next outage
                if let Err(e) = self.topics.append(&self.topic, records.clone()).await {
                    warn!("[Feeds] {}: could not persist fallback copy: {}", self.name, e);
                }
                Ok(Computed::live(Candidate::Records(records)))
            }
            Err(primary_err) => {
                warn!("[Feeds] {}: primary failed, using durable topic: {}", self.name, primary_err);
                let records = self
                    .topics
                    .recent(&self.topic, self.fallback_limit)
                    .await
                    .map_err(|e| {
                        FeedError::upstream(&self.name, format!("{}; fallback: {}", primary_err, e))
                    })?;
                Ok(Computed::fallback(Candidate::Records(records)))
            }
        }
    }

    fn merged(&self, records: &[RawRecord]) {
        let Some(classifier) = &self.classifier else {
            return;
        };
        let classifier = Arc::clone(classifier);
        let batch = records.to_vec();
        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = classifier.classify(batch).await {
                warn!("[Feeds] {}: classification batch failed: {}", name, e);
            }
        });
    }
}

/// Last good snapshot kept for fallback
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSnapshot {
    pub value: serde_json::Value,
    pub saved_at: DateTime<Utc>,
}

pub(crate) const SNAPSHOT_COLLECTION: &str = "snapshots";

/// Snapshot section fed from a source, falling back to the last stored value
pub struct SnapshotFeedProducer {
    name: String,
    section: String,
    source: Arc<dyn SnapshotSource>,
    store: Arc<dyn DocumentStore>,
}

impl SnapshotFeedProducer {
    pub fn new(section: &str, source: Arc<dyn SnapshotSource>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            name: format!("snapshot:{}", section),
            section: section.to_string(),
            source,
            store,
        }
    }
}

#[async_trait]
impl SectionProducer for SnapshotFeedProducer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn compute(&self) -> Result<Computed> {
        match self.source.fetch().await {
            Ok(value) => {
                let stored = StoredSnapshot {
                    value: value.clone(),
                    saved_at: Utc::now(),
                };
                if let Err(e) = save(self.store.as_ref(), SNAPSHOT_COLLECTION, &self.section, &stored).await {
                    warn!("[Feeds] {}: could not persist fallback copy: {}", self.name, e);
                }
                Ok(Computed::live(Candidate::Snapshot(value)))
            }
            Err(primary_err) => {
                warn!("[Feeds] {}: source failed, trying stored snapshot: {}", self.name, primary_err);
                let stored =
                    load::<StoredSnapshot>(self.store.as_ref(), SNAPSHOT_COLLECTION, &self.section).await?;
                match stored {
                    Some(stored) => Ok(Computed::fallback(Candidate::Snapshot(stored.value))),
                    None => Err(FeedError::upstream(
                        &self.name,
                        format!("{}; no stored snapshot", primary_err),
                    )),
                }
            }
        }
    }
}

const INBOX_COLLECTION: &str = "inbox";

/// Snapshot source reading the document a collaborator left in `inbox/<name>`
pub struct InboxSnapshotSource {
    name: String,
    store: Arc<dyn DocumentStore>,
}

impl InboxSnapshotSource {
    pub fn new(name: &str, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            name: name.to_string(),
            store,
        }
    }
}

#[async_trait]
impl SnapshotSource for InboxSnapshotSource {
    async fn fetch(&self) -> Result<serde_json::Value> {
        load::<serde_json::Value>(self.store.as_ref(), INBOX_COLLECTION, &self.name)
            .await?
            .ok_or_else(|| FeedError::upstream(format!("inbox:{}", self.name), "no document"))
    }
}
