//! Tiered time-series archive
//!
//! Once a day the engine snapshots the day's aggregates into a daily
//! entry, then rolls closed periods up one tier at a time:
//! daily → weekly → monthly → quarterly → yearly. A coarser entry is
//! always durably written before the finer entries it consumed are
//! deleted, so a crash in between leaves duplicates, never a gap.
//! `recover` cleans those duplicates up on startup.
//!
//! Tracked metrics that move past the threshold also get an event entry.
//! Events are never compacted.

pub mod period;
pub mod source;
pub mod summary;

#[cfg(test)]
mod tests;

pub use period::{Period, Tier};
pub use source::{AggregateDailySource, DailyObservation, DailySource, MetricObservation, StoredDailySource};
pub use summary::{MetricSummary, PeriodSummary};

use crate::aggregate::{next_daily_run, PeriodicJob};
use crate::config::ArchiveConfig;
use crate::error::{FeedError, Result};
use crate::storage::{load, save, DocumentStore};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const EVENTS_COLLECTION: &str = "archive/events";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveEntry {
    pub tier: Tier,
    pub period_key: String,
    pub summary: PeriodSummary,
    pub created_at: DateTime<Utc>,
    /// Finer entries folded into this one
    #[serde(default)]
    pub child_keys: Vec<String>,
    /// Summary of each folded child, so a rewritten child replaces its old part
    #[serde(default)]
    pub child_summaries: BTreeMap<String, PeriodSummary>,
    /// Rolled up with some children missing
    #[serde(default)]
    pub partial: bool,
}

/// A tracked metric moving past the threshold on one day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveEvent {
    pub key: String,
    pub date: NaiveDate,
    pub metric: String,
    pub reference: Decimal,
    pub value: Decimal,
    pub change_pct: Decimal,
    pub recorded_at: DateTime<Utc>,
}

/// What one compaction pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactionReport {
    /// `tier/key` of every coarser entry written
    pub written: Vec<String>,
    pub deleted: usize,
    pub partial: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub deleted: usize,
    pub rebuilt: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub daily: Option<String>,
    pub events: usize,
    pub compaction: CompactionReport,
}

/// Parse an "HH:MM" wall-clock time
pub fn parse_run_at(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| FeedError::Config(format!("archive run_at '{}': {}", value, e)))
}

/// Event key: date plus the metric with anything outside `[A-Za-z0-9.-]` replaced by `_`
pub fn event_key(date: NaiveDate, metric: &str) -> String {
    let metric: String = metric
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    format!("{}_{}", date.format("%Y-%m-%d"), metric)
}

/// A finer entry read during compaction
struct Child {
    key: String,
    entry: ArchiveEntry,
}

pub struct ArchiveEngine {
    store: Arc<dyn DocumentStore>,
    source: Arc<dyn DailySource>,
    config: ArchiveConfig,
    run_at: NaiveTime,
    cycle: tokio::sync::Mutex<()>,
}

impl ArchiveEngine {
    pub fn new(store: Arc<dyn DocumentStore>, source: Arc<dyn DailySource>, config: ArchiveConfig) -> Result<Self> {
        let run_at = parse_run_at(&config.run_at)?;
        Ok(Self {
            store,
            source,
            config,
            run_at,
            cycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn run_at(&self) -> NaiveTime {
        self.run_at
    }

    /// Next scheduled run strictly after `now`, in `now`'s time zone
    pub fn next_run_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Tz> {
        next_daily_run(now, self.run_at)
    }

    /// Snapshot `today`, then compact every closed period
    pub async fn run_cycle(&self, today: NaiveDate) -> Result<CycleReport> {
        let _cycle = self.cycle.lock().await;
        let mut report = CycleReport::default();

        match self.snapshot_day_inner(today).await {
            Ok((entry, events)) => {
                report.daily = Some(entry.period_key);
                report.events = events;
            }
            Err(e) => warn!("[Archive] Daily snapshot for {} failed, compacting anyway: {}", today, e),
        }

        report.compaction = self.compact_inner(today).await?;
        info!(
            "[Archive] Cycle {}: {} rollups, {} entries removed, {} events",
            today,
            report.compaction.written.len(),
            report.compaction.deleted,
            report.events
        );
        Ok(report)
    }

    /// Write the daily entry for `date` and any events it triggers
    pub async fn snapshot_day(&self, date: NaiveDate) -> Result<ArchiveEntry> {
        let _cycle = self.cycle.lock().await;
        self.snapshot_day_inner(date).await.map(|(entry, _)| entry)
    }

    async fn snapshot_day_inner(&self, date: NaiveDate) -> Result<(ArchiveEntry, usize)> {
        let observation = self
            .source
            .observe(date)
            .await
            .map_err(|e| FeedError::upstream("daily source", e))?;

        let period = Period::Day(date);
        if observation.metrics.is_empty() && observation.counts.is_empty() {
            if let Ok(Some(existing)) =
                load::<ArchiveEntry>(self.store.as_ref(), &Tier::Daily.collection(), &period.key()).await
            {
                info!("[Archive] Nothing observed for {}, keeping the existing daily entry", date);
                return Ok((existing, 0));
            }
        }

        let previous = self.previous_daily(date).await?;
        let now = Utc::now();

        let mut summary = PeriodSummary {
            counts: observation.counts,
            ..PeriodSummary::default()
        };
        let mut events = 0;

        for (metric, observed) in observation.metrics {
            let Some(metric_summary) = MetricSummary::from_values(&observed.values) else {
                debug!("[Archive] {} has no values on {}", metric, date);
                continue;
            };

            if self.is_tracked(&metric) {
                let reference = observed.reference.or_else(|| {
                    previous
                        .as_ref()
                        .and_then(|p| p.summary.metrics.get(&metric))
                        .map(|m| m.last)
                });
                if let Some(event) = self.detect_event(date, &metric, reference, metric_summary.last, now) {
                    save(self.store.as_ref(), EVENTS_COLLECTION, &event.key, &event).await?;
                    info!(
                        "[Archive] Event {}: {} moved {}% ({} -> {})",
                        event.key, metric, event.change_pct, event.reference, event.value
                    );
                    summary.notable_events.push(event.key);
                    events += 1;
                }
            }

            summary.metrics.insert(metric, metric_summary);
        }

        let entry = ArchiveEntry {
            tier: Tier::Daily,
            period_key: period.key(),
            summary,
            created_at: now,
            child_keys: Vec::new(),
            child_summaries: BTreeMap::new(),
            partial: false,
        };
        save(self.store.as_ref(), &Tier::Daily.collection(), &entry.period_key, &entry).await?;
        debug!("[Archive] Wrote daily {}", entry.period_key);
        Ok((entry, events))
    }

    fn is_tracked(&self, metric: &str) -> bool {
        self.config.tracked_prefixes.iter().any(|p| metric.starts_with(p.as_str()))
    }

    fn detect_event(
        &self,
        date: NaiveDate,
        metric: &str,
        reference: Option<Decimal>,
        value: Decimal,
        now: DateTime<Utc>,
    ) -> Option<ArchiveEvent> {
        let reference = reference.filter(|r| !r.is_zero())?;
        let change_pct = (value - reference) / reference.abs() * dec!(100);
        if change_pct.abs() < self.config.event_threshold_pct {
            return None;
        }
        Some(ArchiveEvent {
            key: event_key(date, metric),
            date,
            metric: metric.to_string(),
            reference,
            value,
            change_pct: change_pct.round_dp(4),
            recorded_at: now,
        })
    }

    /// Most recent readable daily entry before `date`
    async fn previous_daily(&self, date: NaiveDate) -> Result<Option<ArchiveEntry>> {
        let collection = Tier::Daily.collection();
        let cutoff = Period::Day(date).key();
        let keys = self.store.list_keys(&collection).await?;
        for key in keys.iter().rev().filter(|k| k.as_str() < cutoff.as_str()) {
            match load::<ArchiveEntry>(self.store.as_ref(), &collection, key).await {
                Ok(Some(entry)) => return Ok(Some(entry)),
                Ok(None) => {}
                Err(e) => error!("[Archive] Skipping unreadable daily {}: {}", key, e),
            }
        }
        Ok(None)
    }

    /// Roll every closed period up one tier, finest first
    pub async fn compact(&self, today: NaiveDate) -> Result<CompactionReport> {
        let _cycle = self.cycle.lock().await;
        self.compact_inner(today).await
    }

    async fn compact_inner(&self, today: NaiveDate) -> Result<CompactionReport> {
        let mut report = CompactionReport::default();
        for tier in [Tier::Daily, Tier::Weekly, Tier::Monthly, Tier::Quarterly] {
            self.compact_tier(tier, today, &mut report).await?;
        }
        Ok(report)
    }

    async fn compact_tier(&self, tier: Tier, today: NaiveDate, report: &mut CompactionReport) -> Result<()> {
        let Some(coarser) = tier.coarser() else {
            return Ok(());
        };
        let cutoff = period::retention_cutoff(tier, today, &self.config);

        for (parent, keys) in self.group_by_parent(tier).await? {
            if !parent.is_closed(today) {
                continue;
            }
            let children = self.read_children(tier, &keys).await;
            let Some(oldest) = children.first() else {
                continue;
            };

            let existing = match load::<ArchiveEntry>(self.store.as_ref(), &coarser.collection(), &parent.key()).await
            {
                Ok(existing) => existing,
                Err(e) => {
                    // Left for recover(); overwriting could drop already-deleted children
                    error!("[Archive] {} {} unreadable, not compacting into it: {}", coarser, parent, e);
                    continue;
                }
            };

            let folded: BTreeSet<&str> = existing
                .as_ref()
                .map(|e| e.child_keys.iter().map(String::as_str).collect())
                .unwrap_or_default();
            let folded_at = existing.as_ref().map(|e| e.created_at);
            // Folded children written after the parent are rewrites, not leftovers
            let fresh: Vec<&Child> = children
                .iter()
                .filter(|c| !folded.contains(c.key.as_str()) || folded_at.is_some_and(|at| c.entry.created_at > at))
                .collect();

            if !fresh.is_empty() {
                let mut covered: BTreeSet<String> = folded.iter().map(|k| k.to_string()).collect();
                covered.extend(fresh.iter().map(|c| c.key.clone()));
                let expected: BTreeSet<String> = parent.children().iter().map(Period::key).collect();
                let complete = expected.is_subset(&covered);

                if existing.is_none() && !complete {
                    let oldest_day = Period::parse(tier, &oldest.key).ok().and_then(|p| p.first_day());
                    if oldest_day.is_some_and(|d| d >= cutoff) {
                        debug!("[Archive] {} {} incomplete, waiting for children", coarser, parent);
                        continue;
                    }
                }

                let entry = self.build_entry(coarser, &parent, existing.as_ref(), &fresh, !complete);
                if let Err(e) = save(self.store.as_ref(), &coarser.collection(), &entry.period_key, &entry).await {
                    warn!("[Archive] Writing {} {} failed, keeping its children: {}", coarser, parent, e);
                    continue;
                }
                if entry.partial {
                    warn!(
                        "[Archive] {} {} rolled up from {} of {} children",
                        coarser,
                        parent,
                        entry.child_keys.len(),
                        expected.len()
                    );
                    report.partial += 1;
                }
                report.written.push(format!("{}/{}", coarser, entry.period_key));
            }

            report.deleted += self.delete_children(tier, children.iter().map(|c| c.key.as_str())).await;
        }
        Ok(())
    }

    fn build_entry(
        &self,
        tier: Tier,
        period: &Period,
        existing: Option<&ArchiveEntry>,
        fresh: &[&Child],
        partial: bool,
    ) -> ArchiveEntry {
        let mut child_summaries = existing.map(|e| e.child_summaries.clone()).unwrap_or_default();
        let mut child_keys: BTreeSet<String> = existing
            .map(|e| e.child_keys.iter().cloned().collect())
            .unwrap_or_default();
        for child in fresh {
            child_summaries.insert(child.key.clone(), child.entry.summary.clone());
            child_keys.insert(child.key.clone());
        }

        // Ordered by period key so `last` comes from the latest period
        let mut parts: Vec<(&str, &PeriodSummary)> =
            child_summaries.iter().map(|(k, s)| (k.as_str(), s)).collect();
        if let Some(existing) = existing.filter(|e| e.child_summaries.is_empty() && !e.child_keys.is_empty()) {
            // No per-child parts recorded: the old summary stands in for all of them
            let latest = existing.child_keys.iter().max().map(String::as_str).unwrap_or("");
            parts.push((latest, &existing.summary));
        }
        parts.sort_by(|a, b| a.0.cmp(b.0));
        let summary = PeriodSummary::rollup(parts.into_iter().map(|(_, s)| s));

        ArchiveEntry {
            tier,
            period_key: period.key(),
            summary,
            created_at: Utc::now(),
            child_keys: child_keys.into_iter().collect(),
            child_summaries,
            partial,
        }
    }

    /// Keys of `tier` grouped by the period they roll up into. Unparseable keys are skipped.
    async fn group_by_parent(&self, tier: Tier) -> Result<BTreeMap<Period, Vec<String>>> {
        let mut groups: BTreeMap<Period, Vec<String>> = BTreeMap::new();
        for key in self.store.list_keys(&tier.collection()).await? {
            match Period::parse(tier, &key).ok().and_then(|p| p.parent()) {
                Some(parent) => groups.entry(parent).or_default().push(key),
                None => warn!("[Archive] Ignoring unrecognized {} key {}", tier, key),
            }
        }
        Ok(groups)
    }

    /// Readable entries among `keys`, oldest first. Corrupt ones are logged and left in place.
    async fn read_children(&self, tier: Tier, keys: &[String]) -> Vec<Child> {
        let collection = tier.collection();
        let mut children = Vec::new();
        for key in keys {
            match load::<ArchiveEntry>(self.store.as_ref(), &collection, key).await {
                Ok(Some(entry)) => children.push(Child {
                    key: key.clone(),
                    entry,
                }),
                Ok(None) => {}
                Err(e) => error!("[Archive] Skipping unreadable {} {}: {}", tier, key, e),
            }
        }
        children.sort_by(|a, b| a.key.cmp(&b.key));
        children
    }

    async fn delete_children<'a, I>(&self, tier: Tier, keys: I) -> usize
    where
        I: Iterator<Item = &'a str>,
    {
        let collection = tier.collection();
        let mut deleted = 0;
        for key in keys {
            match self.store.delete(&collection, key).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => warn!("[Archive] Could not delete {} {}: {}", tier, key, e),
            }
        }
        deleted
    }

    /// Clean up after a crash between a coarser write and its deletes.
    ///
    /// Children already recorded in a readable coarser entry are deleted.
    /// An unreadable coarser entry is rebuilt from its surviving children.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let _cycle = self.cycle.lock().await;
        let mut report = RecoveryReport::default();

        for tier in [Tier::Daily, Tier::Weekly, Tier::Monthly, Tier::Quarterly] {
            let Some(coarser) = tier.coarser() else {
                continue;
            };
            let existing_parents: BTreeSet<String> =
                self.store.list_keys(&coarser.collection()).await?.into_iter().collect();

            for (parent, keys) in self.group_by_parent(tier).await? {
                if !existing_parents.contains(&parent.key()) {
                    continue;
                }
                match load::<ArchiveEntry>(self.store.as_ref(), &coarser.collection(), &parent.key()).await {
                    Ok(Some(entry)) => {
                        let mut leftovers = Vec::new();
                        for key in keys.iter().filter(|k| entry.child_keys.contains(*k)) {
                            // A child rewritten after the parent is left for compaction to fold again
                            let rewritten = matches!(
                                load::<ArchiveEntry>(self.store.as_ref(), &tier.collection(), key).await,
                                Ok(Some(child)) if child.created_at > entry.created_at
                            );
                            if !rewritten {
                                leftovers.push(key.as_str());
                            }
                        }
                        report.deleted += self.delete_children(tier, leftovers.into_iter()).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("[Archive] Rebuilding unreadable {} {}: {}", coarser, parent, e);
                        let children = self.read_children(tier, &keys).await;
                        if children.is_empty() {
                            error!("[Archive] No surviving children to rebuild {} {}", coarser, parent);
                            continue;
                        }
                        let covered: BTreeSet<String> = children.iter().map(|c| c.key.clone()).collect();
                        let expected: BTreeSet<String> = parent.children().iter().map(Period::key).collect();
                        let complete = expected.is_subset(&covered);
                        let fresh: Vec<&Child> = children.iter().collect();
                        let entry = self.build_entry(coarser, &parent, None, &fresh, !complete);

                        save(self.store.as_ref(), &coarser.collection(), &entry.period_key, &entry).await?;
                        report.rebuilt.push(format!("{}/{}", coarser, entry.period_key));
                        report.deleted += self
                            .delete_children(tier, children.iter().map(|c| c.key.as_str()))
                            .await;
                    }
                }
            }
        }

        if report.deleted > 0 || !report.rebuilt.is_empty() {
            info!(
                "[Archive] Recovery removed {} leftovers, rebuilt {} entries",
                report.deleted,
                report.rebuilt.len()
            );
        }
        Ok(report)
    }

    /// Readable entries of a tier, oldest first
    pub async fn entries(&self, tier: Tier) -> Result<Vec<ArchiveEntry>> {
        let keys = self.store.list_keys(&tier.collection()).await?;
        Ok(self.read_children(tier, &keys).await.into_iter().map(|c| c.entry).collect())
    }

    pub async fn entry(&self, tier: Tier, key: &str) -> Result<Option<ArchiveEntry>> {
        Period::parse(tier, key)?;
        load(self.store.as_ref(), &tier.collection(), key).await
    }

    /// Every readable event, oldest first
    pub async fn events(&self) -> Result<Vec<ArchiveEvent>> {
        let mut events = Vec::new();
        for key in self.store.list_keys(EVENTS_COLLECTION).await? {
            match load::<ArchiveEvent>(self.store.as_ref(), EVENTS_COLLECTION, &key).await {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => error!("[Archive] Skipping unreadable event {}: {}", key, e),
            }
        }
        Ok(events)
    }
}

/// Daily archive run for the scheduler
pub struct ArchiveJob {
    engine: Arc<ArchiveEngine>,
}

impl ArchiveJob {
    pub fn new(engine: Arc<ArchiveEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PeriodicJob for ArchiveJob {
    fn name(&self) -> &str {
        "archive"
    }

    async fn run(&self) -> Result<()> {
        self.engine.run_cycle(Local::now().date_naive()).await.map(|_| ())
    }
}
