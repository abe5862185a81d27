//! Bounded set of seen natural identifiers

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// Remembers which natural ids have already been merged.
///
/// Once more than `threshold` ids are held, the ledger keeps only the
/// most recently marked `threshold / 2`. Ids dropped this way are treated
/// as new if they show up again; list size is still capped by the
/// `BoundedList` they feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "LedgerDoc", into = "LedgerDoc")]
pub struct DedupLedger {
    threshold: usize,
    /// Mark order, oldest at the front
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl DedupLedger {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(2),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    pub fn seen(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Record an id. Returns false if it was already known.
    pub fn mark(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.ids.len() > self.threshold {
            self.truncate();
        }
        true
    }

    /// Drop down to the most recently marked `threshold / 2` ids
    fn truncate(&mut self) {
        let keep = self.threshold / 2;
        while self.order.len() > keep {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        tracing::debug!("Dedup ledger truncated to {} ids", keep);
    }

    /// Keep only the ids not seen before, marking them. Order is preserved.
    pub fn filter_new<T, F>(&mut self, candidates: Vec<T>, id_of: F) -> Vec<T>
    where
        F: Fn(&T) -> &str,
    {
        candidates
            .into_iter()
            .filter(|c| self.mark(id_of(c)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

/// Persisted form: threshold plus ids in mark order
#[derive(Serialize, Deserialize)]
struct LedgerDoc {
    threshold: usize,
    ids: Vec<String>,
}

impl From<LedgerDoc> for DedupLedger {
    fn from(doc: LedgerDoc) -> Self {
        let mut ledger = DedupLedger::new(doc.threshold);
        for id in &doc.ids {
            ledger.mark(id);
        }
        ledger
    }
}

impl From<DedupLedger> for LedgerDoc {
    fn from(ledger: DedupLedger) -> Self {
        LedgerDoc {
            threshold: ledger.threshold,
            ids: ledger.order.into_iter().collect(),
        }
    }
}
