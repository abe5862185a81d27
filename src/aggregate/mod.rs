//! Shared aggregation cache
//!
//! The aggregate document is a set of named sections. Each section is
//! owned by exactly one producer: registering a section hands out the
//! only `SectionHandle` able to write it, while consumers read through
//! the `AggregateStore`.
//!
//! # Flow
//! ```text
//! RecordSource / TopicStore --> SectionProducer --> SectionHandle --> AggregateStore --> readers
//!                                     ^
//!                               Scheduler tick
//! ```

pub mod feeds;
pub mod producer;
pub mod scheduler;


pub use feeds::{
    Classifier, InboxSnapshotSource, RecordSource, SnapshotFeedProducer, SnapshotSource, TopicFeedProducer,
};
pub use producer::{Candidate, Computed, ProducerRunner, ProducerSpec, SectionProducer, TickOutcome};
pub use scheduler::{next_daily_run, PeriodicJob, Scheduler, Stagger};

use crate::config::SectionKind;
use crate::error::{FeedError, Result};
use crate::types::{validate_key, RawRecord, SourceTag};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Current value of a section
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SectionValue {
    /// Newest-first records
    List(Vec<RawRecord>),
    Snapshot(serde_json::Value),
}

impl SectionValue {
    fn empty(kind: SectionKind) -> Self {
        match kind {
            SectionKind::List => SectionValue::List(Vec::new()),
            SectionKind::Snapshot => SectionValue::Snapshot(serde_json::Value::Null),
        }
    }

    pub fn as_list(&self) -> Option<&[RawRecord]> {
        match self {
            SectionValue::List(items) => Some(items),
            SectionValue::Snapshot(_) => None,
        }
    }

    pub fn as_snapshot(&self) -> Option<&serde_json::Value> {
        match self {
            SectionValue::Snapshot(value) => Some(value),
            SectionValue::List(_) => None,
        }
    }
}

/// Per-section tick counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionStats {
    pub updates: u64,
    pub failures: u64,
    pub skips: u64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct SectionState {
    value: Arc<SectionValue>,
    last_updated_at: Option<DateTime<Utc>>,
    source: Option<SourceTag>,
    stats: SectionStats,
}

#[derive(Debug)]
struct SectionSlot {
    kind: SectionKind,
    state: RwLock<SectionState>,
}

/// What a reader sees of one section
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionView {
    pub name: String,
    pub kind: SectionKind,
    pub value: Arc<SectionValue>,
    /// `None` until the producer has completed a tick
    pub last_updated_at: Option<DateTime<Utc>>,
    pub source: Option<SourceTag>,
    pub stats: SectionStats,
}

impl SectionView {
    /// Age of the value, if it has ever been computed
    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.last_updated_at.map(|at| now - at)
    }
}

/// Composite document of independently refreshed sections
#[derive(Debug, Default)]
pub struct AggregateStore {
    sections: RwLock<BTreeMap<String, Arc<SectionSlot>>>,
}

impl AggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a section and return its single writer handle
    pub fn register_section(&self, name: &str, kind: SectionKind) -> Result<SectionHandle> {
        validate_key("section name", name)?;
        let mut sections = self.sections.write();
        if sections.contains_key(name) {
            return Err(FeedError::Validation(format!("section {} already registered", name)));
        }

        let slot = Arc::new(SectionSlot {
            kind,
            state: RwLock::new(SectionState {
                value: Arc::new(SectionValue::empty(kind)),
                last_updated_at: None,
                source: None,
                stats: SectionStats::default(),
            }),
        });
        sections.insert(name.to_string(), Arc::clone(&slot));
        tracing::debug!("[Aggregate] Registered {:?} section {}", kind, name);

        Ok(SectionHandle {
            name: name.to_string(),
            slot,
        })
    }

    /// Last computed value of a section, `None` for unknown names
    pub fn read(&self, name: &str) -> Option<SectionView> {
        let slot = self.sections.read().get(name).cloned()?;
        Some(view_of(name, &slot))
    }

    /// Every section, ordered by name
    pub fn snapshot(&self) -> Vec<SectionView> {
        let slots: Vec<(String, Arc<SectionSlot>)> = self
            .sections
            .read()
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect();
        slots.iter().map(|(name, slot)| view_of(name, slot)).collect()
    }

    /// The whole document as JSON keyed by section name
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .snapshot()
            .into_iter()
            .filter_map(|view| {
                let name = view.name.clone();
                serde_json::to_value(view).ok().map(|v| (name, v))
            })
            .collect();
        serde_json::Value::Object(map)
    }

    pub fn section_names(&self) -> Vec<String> {
        self.sections.read().keys().cloned().collect()
    }
}

fn view_of(name: &str, slot: &SectionSlot) -> SectionView {
    let state = slot.state.read();
    SectionView {
        name: name.to_string(),
        kind: slot.kind,
        value: Arc::clone(&state.value),
        last_updated_at: state.last_updated_at,
        source: state.source,
        stats: state.stats.clone(),
    }
}

/// Write access to exactly one section. Not `Clone`.
#[derive(Debug)]
pub struct SectionHandle {
    name: String,
    slot: Arc<SectionSlot>,
}

impl SectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SectionKind {
        self.slot.kind
    }

    /// Swap in a new value
    pub fn replace(&self, value: SectionValue, source: SourceTag, at: DateTime<Utc>) {
        let value = Arc::new(value);
        let mut state = self.slot.state.write();
        state.value = value;
        state.last_updated_at = Some(at);
        state.source = Some(source);
        state.stats.updates += 1;
    }

    /// Note a failed tick. The previous value is kept.
    pub fn record_failure(&self, error: &FeedError, at: DateTime<Utc>) {
        let mut state = self.slot.state.write();
        state.stats.failures += 1;
        state.stats.last_error = Some(error.to_string());
        state.stats.last_error_at = Some(at);
    }

    pub fn record_skip(&self) {
        self.slot.state.write().stats.skips += 1;
    }
}
