//! Prediction ledger
//!
//! Predictions are created against an entity's current price and scored
//! once their horizon has elapsed. Active and evaluated records live in
//! separate collections; an evaluated record is written before its active
//! copy is deleted. Memory is authoritative: a failed write is queued and
//! retried at the start of the next evaluation pass.

pub mod scoring;
pub mod stats;


pub use scoring::ScoringPolicy;
pub use stats::{HorizonStats, PredictionStats};

use crate::aggregate::PeriodicJob;
use crate::config::PredictionConfig;
use crate::error::{FeedError, Result};
use crate::storage::{load, save, DocumentStore};
use crate::types::validate_key;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ACTIVE_COLLECTION: &str = "predictions/active";
const EVALUATED_COLLECTION: &str = "predictions/evaluated";
const STATS_COLLECTION: &str = "predictions";
const STATS_KEY: &str = "stats";

/// Current price of an entity, if known
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceAccessor: Send + Sync {
    async fn current_price(&self, entity_id: &str) -> Option<Decimal>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Flat,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
            Direction::Flat => write!(f, "flat"),
        }
    }
}

impl FromStr for Direction {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            "flat" => Ok(Direction::Flat),
            other => Err(FeedError::Validation(format!("unknown direction '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Horizon {
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "3d")]
    ThreeDays,
    #[serde(rename = "1w")]
    OneWeek,
    #[serde(rename = "1m")]
    OneMonth,
}

impl Horizon {
    pub fn as_str(&self) -> &'static str {
        match self {
            Horizon::OneHour => "1h",
            Horizon::FourHours => "4h",
            Horizon::OneDay => "1d",
            Horizon::ThreeDays => "3d",
            Horizon::OneWeek => "1w",
            Horizon::OneMonth => "1m",
        }
    }

    /// Time from creation until the prediction is due. A month is 30 days.
    pub fn duration(&self) -> Duration {
        match self {
            Horizon::OneHour => Duration::hours(1),
            Horizon::FourHours => Duration::hours(4),
            Horizon::OneDay => Duration::days(1),
            Horizon::ThreeDays => Duration::days(3),
            Horizon::OneWeek => Duration::weeks(1),
            Horizon::OneMonth => Duration::days(30),
        }
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Horizon {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "1h" => Ok(Horizon::OneHour),
            "4h" => Ok(Horizon::FourHours),
            "1d" => Ok(Horizon::OneDay),
            "3d" => Ok(Horizon::ThreeDays),
            "1w" => Ok(Horizon::OneWeek),
            "1m" => Ok(Horizon::OneMonth),
            other => Err(FeedError::Validation(format!("unknown horizon '{}'", other))),
        }
    }
}

/// Caller input to `create_prediction`, validated before anything is stored
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionSpec {
    pub direction: String,
    pub horizon: String,
    pub price_at_creation: Decimal,
    #[serde(default)]
    pub target_price: Option<Decimal>,
    #[serde(default)]
    pub confidence: Option<Decimal>,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub id: Uuid,
    pub entity_id: String,
    pub direction: Direction,
    pub horizon: Horizon,
    pub price_at_creation: Decimal,
    pub target_price: Option<Decimal>,
    pub confidence: Option<Decimal>,
    pub rationale: Option<String>,
    pub created_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
}

impl Prediction {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub actual_price: Decimal,
    pub actual_change_pct: Decimal,
    pub actual_direction: Direction,
    pub direction_correct: bool,
    pub price_error_pct: Option<Decimal>,
    pub score: Decimal,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatedPrediction {
    pub prediction: Prediction,
    pub evaluation: Evaluation,
}

/// Where a prediction currently lives
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionStatus {
    Active(Prediction),
    Evaluated(EvaluatedPrediction),
}

#[derive(Debug, Clone)]
enum PendingWrite {
    PutActive(Prediction),
    PutEvaluated(EvaluatedPrediction),
    DeleteActive(Uuid),
    PutStats,
}

#[derive(Default)]
struct LedgerState {
    active: BTreeMap<Uuid, Prediction>,
    stats: PredictionStats,
    pending: VecDeque<PendingWrite>,
}

pub struct PredictionLedger {
    store: Arc<dyn DocumentStore>,
    policy: ScoringPolicy,
    state: Mutex<LedgerState>,
    cycle: tokio::sync::Mutex<()>,
}

impl PredictionLedger {
    pub fn new(store: Arc<dyn DocumentStore>, config: &PredictionConfig) -> Self {
        Self {
            store,
            policy: ScoringPolicy::from(config),
            state: Mutex::new(LedgerState::default()),
            cycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Restore active predictions and statistics. Returns the number of active predictions.
    pub async fn load(&self) -> Result<usize> {
        let mut active = BTreeMap::new();
        for key in self.store.list_keys(ACTIVE_COLLECTION).await? {
            match load::<Prediction>(self.store.as_ref(), ACTIVE_COLLECTION, &key).await {
                Ok(Some(prediction)) => {
                    active.insert(prediction.id, prediction);
                }
                Ok(None) => {}
                Err(e) => error!("[Predictions] Skipping active record {}: {}", key, e),
            }
        }

        let stats = match load::<PredictionStats>(self.store.as_ref(), STATS_COLLECTION, STATS_KEY).await {
            Ok(Some(stats)) => stats,
            Ok(None) => self.rebuild_stats().await?,
            Err(e) => {
                error!("[Predictions] Statistics unreadable, rebuilding: {}", e);
                self.rebuild_stats().await?
            }
        };

        let count = active.len();
        {
            let mut state = self.state.lock();
            state.active = active;
            state.stats = stats;
        }
        info!("[Predictions] Loaded {} active predictions", count);
        Ok(count)
    }

    async fn rebuild_stats(&self) -> Result<PredictionStats> {
        let mut evaluated = self.load_evaluated(|_| true).await?;
        evaluated.sort_by_key(|e| e.evaluation.evaluated_at);

        let mut stats = PredictionStats::default();
        for record in &evaluated {
            stats.record(
                record.prediction.horizon,
                record.evaluation.score,
                record.evaluation.direction_correct,
                record.evaluation.evaluated_at,
            );
        }
        Ok(stats)
    }

    pub async fn create_prediction(&self, entity_id: &str, spec: PredictionSpec) -> Result<Prediction> {
        self.create_prediction_at(entity_id, spec, Utc::now()).await
    }

    /// Validate `spec` and store it as an active prediction created at `now`
    pub async fn create_prediction_at(
        &self,
        entity_id: &str,
        spec: PredictionSpec,
        now: DateTime<Utc>,
    ) -> Result<Prediction> {
        validate_key("entity id", entity_id)?;
        let direction: Direction = spec.direction.parse()?;
        let horizon: Horizon = spec.horizon.parse()?;

        if spec.price_at_creation <= Decimal::ZERO {
            return Err(FeedError::Validation(format!(
                "priceAtCreation must be positive, got {}",
                spec.price_at_creation
            )));
        }
        if let Some(target) = spec.target_price {
            if target <= Decimal::ZERO {
                return Err(FeedError::Validation(format!("targetPrice must be positive, got {}", target)));
            }
        }
        if let Some(confidence) = spec.confidence {
            if confidence < Decimal::ZERO || confidence > dec!(100) {
                return Err(FeedError::Validation(format!(
                    "confidence must be within 0-100, got {}",
                    confidence
                )));
            }
        }

        let prediction = Prediction {
            id: Uuid::new_v4(),
            entity_id: entity_id.to_string(),
            direction,
            horizon,
            price_at_creation: spec.price_at_creation,
            target_price: spec.target_price,
            confidence: spec.confidence,
            rationale: spec.rationale,
            created_at: now,
            due_at: now + horizon.duration(),
        };

        self.state.lock().active.insert(prediction.id, prediction.clone());

        if let Err(e) = self.put_active(&prediction).await {
            warn!("[Predictions] Could not persist {}, will retry: {}", prediction.id, e);
            self.state
                .lock()
                .pending
                .push_back(PendingWrite::PutActive(prediction.clone()));
        }

        info!(
            "[Predictions] Created {} for {}: {} over {}",
            prediction.id, entity_id, direction, horizon
        );
        Ok(prediction)
    }

    pub async fn evaluate_due_predictions(&self, prices: &dyn PriceAccessor) -> Result<Vec<EvaluatedPrediction>> {
        self.evaluate_due_predictions_at(prices, Utc::now()).await
    }

    /// Score every active prediction due at `now`. Predictions without a
    /// usable price stay active.
    pub async fn evaluate_due_predictions_at(
        &self,
        prices: &dyn PriceAccessor,
        now: DateTime<Utc>,
    ) -> Result<Vec<EvaluatedPrediction>> {
        let _cycle = self.cycle.lock().await;
        self.flush_pending().await;

        let due: Vec<Prediction> = self
            .state
            .lock()
            .active
            .values()
            .filter(|p| p.is_due(now))
            .cloned()
            .collect();

        let mut evaluated = Vec::new();
        for prediction in due {
            let actual = match prices.current_price(&prediction.entity_id).await {
                Some(price) if price > Decimal::ZERO => price,
                Some(price) => {
                    warn!(
                        "[Predictions] Ignoring non-positive price {} for {}",
                        price, prediction.entity_id
                    );
                    continue;
                }
                None => {
                    debug!("[Predictions] No price for {}, {} stays active", prediction.entity_id, prediction.id);
                    continue;
                }
            };

            let Some(evaluation) = self.policy.evaluate(&prediction, actual, now) else {
                warn!(
                    "[Predictions] Price {} for {} out of range, {} stays active",
                    actual, prediction.entity_id, prediction.id
                );
                continue;
            };
            let record = EvaluatedPrediction { evaluation, prediction };

            {
                let mut state = self.state.lock();
                state.active.remove(&record.prediction.id);
                state.stats.record(
                    record.prediction.horizon,
                    record.evaluation.score,
                    record.evaluation.direction_correct,
                    now,
                );
            }
            self.persist_evaluated(&record).await;

            info!(
                "[Predictions] {} ({} {}) scored {}",
                record.prediction.id, record.prediction.entity_id, record.prediction.horizon, record.evaluation.score
            );
            evaluated.push(record);
        }

        if !evaluated.is_empty() {
            if let Err(e) = self.put_stats().await {
                warn!("[Predictions] Could not persist statistics, will retry: {}", e);
                self.queue(PendingWrite::PutStats);
            }
        }

        Ok(evaluated)
    }

    async fn persist_evaluated(&self, record: &EvaluatedPrediction) {
        let id = record.prediction.id;
        if let Err(e) = save(self.store.as_ref(), EVALUATED_COLLECTION, &id.to_string(), record).await {
            warn!("[Predictions] Could not persist evaluation of {}, will retry: {}", id, e);
            self.queue(PendingWrite::PutEvaluated(record.clone()));
            self.queue(PendingWrite::DeleteActive(id));
            return;
        }
        if let Err(e) = self.store.delete(ACTIVE_COLLECTION, &id.to_string()).await {
            warn!("[Predictions] Could not remove active {}, will retry: {}", id, e);
            self.queue(PendingWrite::DeleteActive(id));
        }
    }

    fn queue(&self, write: PendingWrite) {
        let mut state = self.state.lock();
        if matches!(write, PendingWrite::PutStats)
            && state.pending.iter().any(|w| matches!(w, PendingWrite::PutStats))
        {
            return;
        }
        state.pending.push_back(write);
    }

    /// Retry queued writes in order, stopping at the first failure.
    /// Returns the number still pending.
    pub async fn flush_pending(&self) -> usize {
        loop {
            let next = self.state.lock().pending.front().cloned();
            let Some(write) = next else {
                return 0;
            };
            let result = match &write {
                PendingWrite::PutActive(p) => self.put_active(p).await,
                PendingWrite::PutEvaluated(r) => {
                    save(self.store.as_ref(), EVALUATED_COLLECTION, &r.prediction.id.to_string(), r).await
                }
                PendingWrite::DeleteActive(id) => self
                    .store
                    .delete(ACTIVE_COLLECTION, &id.to_string())
                    .await
                    .map(|_| ()),
                PendingWrite::PutStats => self.put_stats().await,
            };
            match result {
                Ok(()) => {
                    self.state.lock().pending.pop_front();
                }
                Err(e) => {
                    let remaining = self.state.lock().pending.len();
                    warn!("[Predictions] Retry failed, {} writes pending: {}", remaining, e);
                    return remaining;
                }
            }
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.state.lock().pending.len()
    }

    async fn put_active(&self, prediction: &Prediction) -> Result<()> {
        save(self.store.as_ref(), ACTIVE_COLLECTION, &prediction.id.to_string(), prediction).await
    }

    async fn put_stats(&self) -> Result<()> {
        let stats = self.state.lock().stats.clone();
        save(self.store.as_ref(), STATS_COLLECTION, STATS_KEY, &stats).await
    }

    /// Evaluated records still waiting to be written
    fn pending_evaluated<F>(&self, keep: F) -> Vec<EvaluatedPrediction>
    where
        F: Fn(&EvaluatedPrediction) -> bool,
    {
        self.state
            .lock()
            .pending
            .iter()
            .filter_map(|w| match w {
                PendingWrite::PutEvaluated(record) if keep(record) => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    /// Look up a prediction in memory first, then among evaluated records
    pub async fn prediction(&self, id: Uuid) -> Result<Option<PredictionStatus>> {
        let active = self.state.lock().active.get(&id).cloned();
        if let Some(active) = active {
            return Ok(Some(PredictionStatus::Active(active)));
        }
        if let Some(record) = self.pending_evaluated(|r| r.prediction.id == id).pop() {
            return Ok(Some(PredictionStatus::Evaluated(record)));
        }
        Ok(load::<EvaluatedPrediction>(self.store.as_ref(), EVALUATED_COLLECTION, &id.to_string())
            .await?
            .map(PredictionStatus::Evaluated))
    }

    /// Active predictions, earliest due first
    pub fn active(&self) -> Vec<Prediction> {
        let mut active: Vec<Prediction> = self.state.lock().active.values().cloned().collect();
        active.sort_by_key(|p| p.due_at);
        active
    }

    /// Evaluated predictions of one entity, most recently evaluated first
    pub async fn evaluated_for(&self, entity_id: &str) -> Result<Vec<EvaluatedPrediction>> {
        validate_key("entity id", entity_id)?;
        let mut records = self.load_evaluated(|r| r.prediction.entity_id == entity_id).await?;
        for record in self.pending_evaluated(|r| r.prediction.entity_id == entity_id) {
            records.retain(|r| r.prediction.id != record.prediction.id);
            records.push(record);
        }
        records.sort_by(|a, b| b.evaluation.evaluated_at.cmp(&a.evaluation.evaluated_at));
        Ok(records)
    }

    async fn load_evaluated<F>(&self, keep: F) -> Result<Vec<EvaluatedPrediction>>
    where
        F: Fn(&EvaluatedPrediction) -> bool,
    {
        let mut records = Vec::new();
        for key in self.store.list_keys(EVALUATED_COLLECTION).await? {
            match load::<EvaluatedPrediction>(self.store.as_ref(), EVALUATED_COLLECTION, &key).await {
                Ok(Some(record)) if keep(&record) => records.push(record),
                Ok(_) => {}
                Err(e) => error!("[Predictions] Skipping evaluated record {}: {}", key, e),
            }
        }
        Ok(records)
    }

    pub fn stats(&self) -> PredictionStats {
        self.state.lock().stats.clone()
    }
}

/// Scheduled evaluation pass
pub struct EvaluationJob {
    ledger: Arc<PredictionLedger>,
    prices: Arc<dyn PriceAccessor>,
}

impl EvaluationJob {
    pub fn new(ledger: Arc<PredictionLedger>, prices: Arc<dyn PriceAccessor>) -> Self {
        Self { ledger, prices }
    }
}

#[async_trait]
impl PeriodicJob for EvaluationJob {
    fn name(&self) -> &str {
        "predictions:evaluate"
    }

    async fn run(&self) -> Result<()> {
        let evaluated = self.ledger.evaluate_due_predictions(self.prices.as_ref()).await?;
        if !evaluated.is_empty() {
            info!("[Predictions] Evaluated {} predictions", evaluated.len());
        }
        Ok(())
    }
}
