//! Per-entity durable records
//!
//! Each entity (ticker, issuer, indicator) owns one collection holding:
//! - `info`: descriptive document
//! - `price`: latest quote
//! - `reports`: bounded, deduplicated list of broker reports
//! - `layers`: derived-data layers with change-gated history

pub mod layers;


pub use layers::{apply_layer_update, EntityLayer, LayerChange, LayerHistoryEntry, LayerPolicy};

use crate::config::LayersConfig;
use crate::error::Result;
use crate::prediction::PriceAccessor;
use crate::storage::{load, save, DocumentStore, TopicFeed};
use crate::types::{validate_key, RawRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

const INFO_KEY: &str = "info";
const PRICE_KEY: &str = "price";
const REPORTS_KEY: &str = "reports";
const LAYERS_KEY: &str = "layers";

/// Latest known price of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    pub price: Decimal,
    pub currency: Option<String>,
    pub as_of: DateTime<Utc>,
}

/// Result of `update_layer`
#[derive(Debug, Clone)]
pub struct LayerUpdate {
    pub layer: EntityLayer,
    pub change: LayerChange,
}

/// Durable per-entity store
#[derive(Clone)]
pub struct EntityStore {
    store: Arc<dyn DocumentStore>,
    policy: LayerPolicy,
    report_capacity: usize,
    /// Serializes read-modify-write of one entity's documents
    writers: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl EntityStore {
    pub fn new(store: Arc<dyn DocumentStore>, config: &LayersConfig) -> Self {
        Self {
            store,
            policy: LayerPolicy::from(config),
            report_capacity: config.report_capacity,
            writers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn writer(&self, entity_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.writers.lock().entry(entity_id.to_string()).or_default())
    }

    fn collection(entity_id: &str) -> Result<String> {
        validate_key("entity id", entity_id)?;
        Ok(format!("entities/{}", entity_id))
    }

    /// All layers of an entity, keyed by layer name
    pub async fn layers(&self, entity_id: &str) -> Result<BTreeMap<String, EntityLayer>> {
        let collection = Self::collection(entity_id)?;
        Ok(load(self.store.as_ref(), &collection, LAYERS_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn layer(&self, entity_id: &str, layer_name: &str) -> Result<Option<EntityLayer>> {
        Ok(self.layers(entity_id).await?.remove(layer_name))
    }

    pub async fn update_layer(&self, entity_id: &str, layer_name: &str, value: serde_json::Value) -> Result<LayerUpdate> {
        self.update_layer_at(entity_id, layer_name, value, Utc::now()).await
    }

    /// Write a layer value as of `now`, rotating history only when it changed
    pub async fn update_layer_at(
        &self,
        entity_id: &str,
        layer_name: &str,
        value: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<LayerUpdate> {
        validate_key("layer name", layer_name)?;
        let collection = Self::collection(entity_id)?;
        let writer = self.writer(entity_id);
        let _write = writer.lock().await;
        let mut layers = self.layers(entity_id).await?;

        let current = layers
            .remove(layer_name)
            .unwrap_or_else(|| EntityLayer::empty(entity_id, layer_name));
        let (updated, change) = apply_layer_update(current, value, now, &self.policy);
        layers.insert(layer_name.to_string(), updated.clone());

        save(self.store.as_ref(), &collection, LAYERS_KEY, &layers).await?;
        debug!(
            "[Entities] {}/{}: {:?}, history={}",
            entity_id,
            layer_name,
            change,
            updated.history.len()
        );

        Ok(LayerUpdate {
            layer: updated,
            change,
        })
    }

    pub async fn put_info(&self, entity_id: &str, info: &serde_json::Value) -> Result<()> {
        let collection = Self::collection(entity_id)?;
        save(self.store.as_ref(), &collection, INFO_KEY, info).await
    }

    pub async fn info(&self, entity_id: &str) -> Result<Option<serde_json::Value>> {
        let collection = Self::collection(entity_id)?;
        load(self.store.as_ref(), &collection, INFO_KEY).await
    }

    pub async fn put_price(&self, entity_id: &str, quote: &PriceQuote) -> Result<()> {
        let collection = Self::collection(entity_id)?;
        save(self.store.as_ref(), &collection, PRICE_KEY, quote).await
    }

    pub async fn price(&self, entity_id: &str) -> Result<Option<PriceQuote>> {
        let collection = Self::collection(entity_id)?;
        load(self.store.as_ref(), &collection, PRICE_KEY).await
    }

    /// Merge broker reports, dropping ones already known. Returns how many were new.
    pub async fn append_reports(&self, entity_id: &str, reports: Vec<RawRecord>) -> Result<usize> {
        let collection = Self::collection(entity_id)?;
        let writer = self.writer(entity_id);
        let _write = writer.lock().await;
        let mut feed = load::<TopicFeed>(self.store.as_ref(), &collection, REPORTS_KEY)
            .await?
            .unwrap_or_else(|| TopicFeed::new(self.report_capacity, self.report_capacity * 10));
        feed.records.set_capacity(self.report_capacity);

        let merged = feed.merge(reports);
        if !merged.is_empty() {
            save(self.store.as_ref(), &collection, REPORTS_KEY, &feed).await?;
        }
        Ok(merged.len())
    }

    /// Reports newest first
    pub async fn reports(&self, entity_id: &str) -> Result<Vec<RawRecord>> {
        let collection = Self::collection(entity_id)?;
        Ok(load::<TopicFeed>(self.store.as_ref(), &collection, REPORTS_KEY)
            .await?
            .map(|feed| feed.records.to_vec())
            .unwrap_or_default())
    }
}

#[async_trait]
impl PriceAccessor for EntityStore {
    async fn current_price(&self, entity_id: &str) -> Option<Decimal> {
        match self.price(entity_id).await {
            Ok(quote) => quote.map(|q| q.price),
            Err(e) => {
                warn!("[Entities] Price lookup for {} failed: {}", entity_id, e);
                None
            }
        }
    }
}
