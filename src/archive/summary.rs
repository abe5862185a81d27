//! Period summaries and their rollup

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSummary {
    pub min: Decimal,
    pub max: Decimal,
    /// Sample-weighted mean
    pub mean: Decimal,
    pub last: Decimal,
    pub samples: u64,
}

impl MetricSummary {
    /// Summary of raw observations in arrival order. `None` when empty.
    pub fn from_values(values: &[Decimal]) -> Option<Self> {
        let (&first, _) = values.split_first()?;
        let mut min = first;
        let mut max = first;
        let mut sum = Decimal::ZERO;
        for &v in values {
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        let samples = values.len() as u64;
        Some(Self {
            min,
            max,
            mean: sum / Decimal::from(samples),
            last: values[values.len() - 1],
            samples,
        })
    }

    /// Fold in a summary of a later period
    pub fn absorb(&mut self, later: &MetricSummary) {
        let total = self.samples + later.samples;
        if total > 0 {
            self.mean = (self.mean * Decimal::from(self.samples) + later.mean * Decimal::from(later.samples))
                / Decimal::from(total);
        }
        self.min = self.min.min(later.min);
        self.max = self.max.max(later.max);
        self.last = later.last;
        self.samples = total;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodSummary {
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricSummary>,
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
    /// Keys of event entries recorded within the period
    #[serde(default)]
    pub notable_events: Vec<String>,
}

impl PeriodSummary {
    /// Combine summaries given oldest first
    pub fn rollup<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = &'a PeriodSummary>,
    {
        let mut merged = PeriodSummary::default();
        for part in parts {
            for (name, metric) in &part.metrics {
                match merged.metrics.get_mut(name) {
                    Some(existing) => existing.absorb(metric),
                    None => {
                        merged.metrics.insert(name.clone(), metric.clone());
                    }
                }
            }
            for (name, count) in &part.counts {
                *merged.counts.entry(name.clone()).or_insert(0) += count;
            }
            for event in &part.notable_events {
                if !merged.notable_events.contains(event) {
                    merged.notable_events.push(event.clone());
                }
            }
        }
        merged
    }
}
