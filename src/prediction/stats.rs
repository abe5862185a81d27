//! Running prediction statistics

use super::Horizon;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HorizonStats {
    pub count: u64,
    pub mean_score: Decimal,
}

/// Aggregate scores over every evaluated prediction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionStats {
    pub count: u64,
    pub mean_score: Decimal,
    pub direction_hits: u64,
    /// Fraction of predictions with the right direction (0-1)
    pub direction_accuracy: Decimal,
    #[serde(default)]
    pub by_horizon: BTreeMap<Horizon, HorizonStats>,
    pub updated_at: Option<DateTime<Utc>>,
}

fn running_mean(mean: Decimal, count: u64, sample: Decimal) -> Decimal {
    mean + (sample - mean) / Decimal::from(count)
}

impl PredictionStats {
    /// Fold one evaluation into the totals
    pub fn record(&mut self, horizon: Horizon, score: Decimal, direction_correct: bool, at: DateTime<Utc>) {
        self.count += 1;
        self.mean_score = running_mean(self.mean_score, self.count, score);
        if direction_correct {
            self.direction_hits += 1;
        }
        self.direction_accuracy = Decimal::from(self.direction_hits) / Decimal::from(self.count);

        let bucket = self.by_horizon.entry(horizon).or_default();
        bucket.count += 1;
        bucket.mean_score = running_mean(bucket.mean_score, bucket.count, score);

        self.updated_at = Some(at);
    }
}
