//! Section producers and their tick logic

use super::{AggregateStore, SectionHandle, SectionValue};
use crate::collections::{BoundedList, DedupLedger};
use crate::config::{SectionConfig, SectionKind};
use crate::error::{FeedError, Result};
use crate::types::{RawRecord, SourceTag};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Candidate value computed by a producer
#[derive(Debug, Clone)]
pub enum Candidate {
    /// Records for a list section, in any order
    Records(Vec<RawRecord>),
    /// Full replacement for a snapshot section
    Snapshot(serde_json::Value),
}

/// Result of one compute
#[derive(Debug, Clone)]
pub struct Computed {
    pub candidate: Candidate,
    pub source: SourceTag,
}

impl Computed {
    pub fn live(candidate: Candidate) -> Self {
        Self {
            candidate,
            source: SourceTag::Live,
        }
    }

    pub fn fallback(candidate: Candidate) -> Self {
        Self {
            candidate,
            source: SourceTag::Fallback,
        }
    }
}

/// Recomputes one section from upstream or durable fallback
#[async_trait]
pub trait SectionProducer: Send + Sync {
    /// Producer name for logs
    fn name(&self) -> &str;

    /// Compute a candidate value
    async fn compute(&self) -> Result<Computed>;

    /// Called with records that survived dedup, oldest first
    fn merged(&self, _records: &[RawRecord]) {}
}

/// Registration parameters of one producer
#[derive(Debug, Clone)]
pub struct ProducerSpec {
    pub section: String,
    pub kind: SectionKind,
    pub capacity: usize,
    pub dedup_threshold: usize,
    pub cadence: Duration,
    /// Explicit first delay; `None` lets the scheduler stagger it
    pub initial_delay: Option<Duration>,
    pub timeout: Duration,
}

impl ProducerSpec {
    pub fn list(section: &str, capacity: usize, dedup_threshold: usize, cadence: Duration) -> Self {
        Self {
            section: section.to_string(),
            kind: SectionKind::List,
            capacity,
            dedup_threshold,
            cadence,
            initial_delay: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn snapshot(section: &str, cadence: Duration) -> Self {
        Self {
            section: section.to_string(),
            kind: SectionKind::Snapshot,
            capacity: 0,
            dedup_threshold: 0,
            cadence,
            initial_delay: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl From<&SectionConfig> for ProducerSpec {
    fn from(config: &SectionConfig) -> Self {
        Self {
            section: config.name.clone(),
            kind: config.kind,
            capacity: config.capacity,
            dedup_threshold: config.dedup_threshold,
            cadence: Duration::from_secs(config.cadence_secs.max(1)),
            initial_delay: None,
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }
}

/// Outcome of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Section replaced; `merged` counts new list records (0 for snapshots)
    Updated { merged: usize },
    /// Compute failed, previous value kept
    Failed,
    /// Previous tick still in flight
    Skipped,
}

/// Dedup and size state of a list section
struct ListState {
    ledger: DedupLedger,
    items: BoundedList<RawRecord>,
}

/// Binds one producer to its section handle
pub struct ProducerRunner {
    producer: Arc<dyn SectionProducer>,
    handle: SectionHandle,
    list: Option<Mutex<ListState>>,
    running: AtomicBool,
    spec: ProducerSpec,
}

/// Clears the running flag when the tick ends, even on panic
pub(crate) struct RunningGuard<'a>(pub(crate) &'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ProducerRunner {
    /// Register the section in `store` and bind `producer` to it
    pub fn register(
        store: &AggregateStore,
        spec: ProducerSpec,
        producer: Arc<dyn SectionProducer>,
    ) -> Result<Self> {
        let handle = store.register_section(&spec.section, spec.kind)?;
        let list = match spec.kind {
            SectionKind::List => Some(Mutex::new(ListState {
                ledger: DedupLedger::new(spec.dedup_threshold),
                items: BoundedList::new(spec.capacity),
            })),
            SectionKind::Snapshot => None,
        };
        Ok(Self {
            producer,
            handle,
            list,
            running: AtomicBool::new(false),
            spec,
        })
    }

    pub fn spec(&self) -> &ProducerSpec {
        &self.spec
    }

    pub fn section(&self) -> &str {
        self.handle.name()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of ids currently held by the dedup ledger (list sections)
    pub fn ledger_len(&self) -> Option<usize> {
        self.list.as_ref().map(|l| l.lock().ledger.len())
    }

    /// Run one tick. Never returns an error: failures keep the old value.
    pub async fn tick(&self) -> TickOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("[Aggregate] {}: previous tick still running, skipping", self.section());
            self.handle.record_skip();
            return TickOutcome::Skipped;
        }
        let _guard = RunningGuard(&self.running);

        let computed = match tokio::time::timeout(self.spec.timeout, self.producer.compute()).await {
            Ok(Ok(computed)) => computed,
            Ok(Err(e)) => return self.fail(e),
            Err(_) => {
                return self.fail(FeedError::upstream(
                    self.producer.name(),
                    format!("timed out after {:?}", self.spec.timeout),
                ))
            }
        };

        match self.apply(computed) {
            Ok(merged) => TickOutcome::Updated { merged },
            Err(e) => self.fail(e),
        }
    }

    fn fail(&self, error: FeedError) -> TickOutcome {
        warn!(
            "[Aggregate] {} ({}) failed, keeping previous value: {}",
            self.section(),
            self.producer.name(),
            error
        );
        self.handle.record_failure(&error, Utc::now());
        TickOutcome::Failed
    }

    fn apply(&self, computed: Computed) -> Result<usize> {
        let now = Utc::now();
        match (computed.candidate, self.list.as_ref()) {
            (Candidate::Snapshot(value), None) => {
                self.handle.replace(SectionValue::Snapshot(value), computed.source, now);
                Ok(0)
            }
            (Candidate::Records(mut records), Some(list)) => {
                records.sort_by_key(|r| r.timestamp);
                let (fresh, items) = {
                    let mut state = list.lock();
                    let fresh = state.ledger.filter_new(records, |r| r.natural_id.as_str());
                    state.items.push_all(fresh.iter().cloned());
                    (fresh, state.items.to_vec())
                };
                self.handle.replace(SectionValue::List(items), computed.source, now);
                if !fresh.is_empty() {
                    debug!("[Aggregate] {}: merged {} new records", self.section(), fresh.len());
                    self.producer.merged(&fresh);
                }
                Ok(fresh.len())
            }
            (Candidate::Snapshot(_), Some(_)) => Err(FeedError::Internal(format!(
                "{} returned a snapshot for list section {}",
                self.producer.name(),
                self.section()
            ))),
            (Candidate::Records(_), None) => Err(FeedError::Internal(format!(
                "{} returned records for snapshot section {}",
                self.producer.name(),
                self.section()
            ))),
        }
    }
}
