//! Durable per-topic record collections
//!
//! Collaborators push normalized records here (news, filings, reports by
//! source). Each topic is bounded by its own dedup ledger and list.

use super::{load, save, DocumentStore};
use crate::collections::{BoundedList, DedupLedger};
use crate::error::Result;
use crate::types::{validate_key, RawRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const FEED_KEY: &str = "feed";

/// Persisted state of one topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicFeed {
    pub records: BoundedList<RawRecord>,
    pub ledger: DedupLedger,
}

impl TopicFeed {
    pub fn new(capacity: usize, dedup_threshold: usize) -> Self {
        Self {
            records: BoundedList::new(capacity),
            ledger: DedupLedger::new(dedup_threshold),
        }
    }

    /// Merge records not seen before. Returns the merged records, oldest first.
    pub fn merge(&mut self, mut incoming: Vec<RawRecord>) -> Vec<RawRecord> {
        incoming.sort_by_key(|r| r.timestamp);
        let fresh = self.ledger.filter_new(incoming, |r| r.natural_id.as_str());
        self.records.push_all(fresh.iter().cloned());
        fresh
    }
}

/// Per-topic durable record store
#[derive(Clone)]
pub struct TopicStore {
    store: Arc<dyn DocumentStore>,
    capacity: usize,
    dedup_threshold: usize,
}

impl TopicStore {
    pub fn new(store: Arc<dyn DocumentStore>, capacity: usize, dedup_threshold: usize) -> Self {
        Self {
            store,
            capacity,
            dedup_threshold,
        }
    }

    fn collection(topic: &str) -> Result<String> {
        validate_key("topic", topic)?;
        Ok(format!("topics/{}", topic))
    }

    /// Current feed for a topic, empty if never written
    pub async fn feed(&self, topic: &str) -> Result<TopicFeed> {
        let collection = Self::collection(topic)?;
        let mut feed = load::<TopicFeed>(self.store.as_ref(), &collection, FEED_KEY)
            .await?
            .unwrap_or_else(|| TopicFeed::new(self.capacity, self.dedup_threshold));
        feed.records.set_capacity(self.capacity);
        Ok(feed)
    }

    /// Merge records into a topic and persist. Returns how many were new.
    pub async fn append(&self, topic: &str, records: Vec<RawRecord>) -> Result<usize> {
        let collection = Self::collection(topic)?;
        let mut feed = self.feed(topic).await?;
        let merged = feed.merge(records);
        if !merged.is_empty() {
            save(self.store.as_ref(), &collection, FEED_KEY, &feed).await?;
            tracing::debug!("[Topics] {}: merged {} new records", topic, merged.len());
        }
        Ok(merged.len())
    }

    /// Most recent records, newest first
    pub async fn recent(&self, topic: &str, limit: usize) -> Result<Vec<RawRecord>> {
        let feed = self.feed(topic).await?;
        Ok(feed.records.iter().take(limit).cloned().collect())
    }
}
