//! Prediction scoring

use super::{Direction, Evaluation, Prediction};
use crate::config::PredictionConfig;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Weights and bands used to score a due prediction
#[derive(Debug, Clone)]
pub struct ScoringPolicy {
    pub flat_band_pct: Decimal,
    pub direction_weight: Decimal,
    pub error_penalty_per_pct: Decimal,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self::from(&PredictionConfig::default())
    }
}

impl From<&PredictionConfig> for ScoringPolicy {
    fn from(config: &PredictionConfig) -> Self {
        Self {
            flat_band_pct: config.flat_band_pct,
            direction_weight: config.direction_weight.clamp(Decimal::ZERO, Decimal::ONE),
            error_penalty_per_pct: config.error_penalty_per_pct,
        }
    }
}

impl ScoringPolicy {
    /// Direction of a percent move
    pub fn direction_of(&self, change_pct: Decimal) -> Direction {
        if change_pct.abs() < self.flat_band_pct {
            Direction::Flat
        } else if change_pct > Decimal::ZERO {
            Direction::Up
        } else {
            Direction::Down
        }
    }

    /// Score `prediction` against `actual_price`. `actual_price` must be positive.
    ///
    /// Returns `None` when the arithmetic overflows `Decimal`.
    pub fn evaluate(&self, prediction: &Prediction, actual_price: Decimal, now: DateTime<Utc>) -> Option<Evaluation> {
        let base = prediction.price_at_creation;
        let actual_change_pct = percent_of(actual_price.checked_sub(base)?, base)?;
        let actual_direction = self.direction_of(actual_change_pct);
        let direction_correct = actual_direction == prediction.direction;

        let price_error_pct = match prediction.target_price {
            Some(target) => Some(percent_of(actual_price.checked_sub(target)?.abs(), target)?),
            None => None,
        };

        let direction_points = if direction_correct { dec!(100) } else { Decimal::ZERO };
        let score = match price_error_pct {
            Some(error_pct) => {
                let penalty = self.error_penalty_per_pct.checked_mul(error_pct)?;
                let accuracy = dec!(100).checked_sub(penalty)?.max(Decimal::ZERO);
                self.direction_weight * direction_points + (Decimal::ONE - self.direction_weight) * accuracy
            }
            None => direction_points,
        };

        Some(Evaluation {
            actual_price,
            actual_change_pct: actual_change_pct.round_dp(4),
            actual_direction,
            direction_correct,
            price_error_pct: price_error_pct.map(|e| e.round_dp(4)),
            score: score.clamp(Decimal::ZERO, dec!(100)).round_dp(2),
            evaluated_at: now,
        })
    }
}

/// `delta` as a percentage of `base`
fn percent_of(delta: Decimal, base: Decimal) -> Option<Decimal> {
    delta.checked_div(base)?.checked_mul(dec!(100))
}
