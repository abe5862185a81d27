//! Daily observations fed to the archive

use crate::aggregate::feeds::{StoredSnapshot, SNAPSHOT_COLLECTION};
use crate::aggregate::{AggregateStore, SectionValue};
use crate::config::{SectionConfig, SectionKind};
use crate::error::Result;
use crate::storage::{load, DocumentStore, TopicStore};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricObservation {
    /// Values observed during the day, oldest first
    pub values: Vec<Decimal>,
    /// Previous close, when the upstream knows it
    pub reference: Option<Decimal>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyObservation {
    pub metrics: BTreeMap<String, MetricObservation>,
    pub counts: BTreeMap<String, u64>,
}

/// Upstream collaborator supplying one day's aggregates
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DailySource: Send + Sync {
    async fn observe(&self, date: NaiveDate) -> Result<DailyObservation>;
}

/// Observes the live aggregate: list sections become counts, numeric
/// fields of snapshot sections become `<section>:<field>` metrics.
///
/// A field may be a bare number or an object carrying `value` (or
/// `price`) and an optional `previousClose`.
pub struct AggregateDailySource {
    store: Arc<AggregateStore>,
}

impl AggregateDailySource {
    pub fn new(store: Arc<AggregateStore>) -> Self {
        Self { store }
    }
}

fn decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }
}

fn metric_of(value: &Value) -> Option<MetricObservation> {
    if let Some(v) = decimal(value) {
        return Some(MetricObservation {
            values: vec![v],
            reference: None,
        });
    }
    let obj = value.as_object()?;
    let current = obj.get("value").or_else(|| obj.get("price")).and_then(decimal)?;
    Some(MetricObservation {
        values: vec![current],
        reference: obj.get("previousClose").and_then(decimal),
    })
}

/// Fold one section's value into the observation
fn observe_section(observation: &mut DailyObservation, name: &str, value: &SectionValue) {
    match value {
        SectionValue::List(records) => {
            observation.counts.insert(name.to_string(), records.len() as u64);
        }
        SectionValue::Snapshot(Value::Object(fields)) => {
            for (field, value) in fields {
                if let Some(metric) = metric_of(value) {
                    observation.metrics.insert(format!("{}:{}", name, field), metric);
                }
            }
        }
        SectionValue::Snapshot(other) => {
            if let Some(metric) = metric_of(other) {
                observation.metrics.insert(name.to_string(), metric);
            }
        }
    }
}

#[async_trait]
impl DailySource for AggregateDailySource {
    async fn observe(&self, _date: NaiveDate) -> Result<DailyObservation> {
        let mut observation = DailyObservation::default();
        for view in self.store.snapshot() {
            if view.last_updated_at.is_none() {
                continue;
            }
            observe_section(&mut observation, &view.name, view.value.as_ref());
        }
        Ok(observation)
    }
}

/// Observes what the producers last persisted: the stored snapshot of
/// each snapshot section and the durable topic behind each list section.
/// Used when no producers run in this process.
pub struct StoredDailySource {
    store: Arc<dyn DocumentStore>,
    topics: TopicStore,
    sections: Vec<SectionConfig>,
}

impl StoredDailySource {
    pub fn new(store: Arc<dyn DocumentStore>, topics: TopicStore, sections: Vec<SectionConfig>) -> Self {
        Self { store, topics, sections }
    }
}

#[async_trait]
impl DailySource for StoredDailySource {
    async fn observe(&self, _date: NaiveDate) -> Result<DailyObservation> {
        let mut observation = DailyObservation::default();
        for section in &self.sections {
            match section.kind {
                SectionKind::Snapshot => {
                    match load::<StoredSnapshot>(self.store.as_ref(), SNAPSHOT_COLLECTION, &section.name).await {
                        Ok(Some(stored)) => {
                            observe_section(&mut observation, &section.name, &SectionValue::Snapshot(stored.value))
                        }
                        Ok(None) => {}
                        Err(e) => warn!("[Archive] Stored snapshot {} unreadable: {}", section.name, e),
                    }
                }
                SectionKind::List => {
                    let topic = section.topic.as_deref().unwrap_or(&section.name);
                    let feed = self.topics.feed(topic).await?;
                    if !feed.records.is_empty() {
                        let count = feed.records.len().min(section.capacity);
                        observation.counts.insert(section.name.clone(), count as u64);
                    }
                }
            }
        }
        Ok(observation)
    }
}
