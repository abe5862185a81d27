//! Change-gated layer history
//!
//! A layer keeps its latest value plus a short history of earlier
//! values. Re-saving an unchanged value only touches timestamps, so a
//! summary regenerated every cycle does not flood the history.

use crate::config::LayersConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One superseded value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerHistoryEntry {
    pub value: Value,
    /// Last write of this value before it was superseded
    pub updated_at: DateTime<Utc>,
}

/// A named category of derived data attached to an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityLayer {
    pub entity_id: String,
    pub layer_name: String,
    pub latest_value: Value,
    /// Last write of `latest_value`, refreshed by unchanged writes; `None` before the first
    pub updated_at: Option<DateTime<Utc>>,
    /// When the layer was last written, changed or not
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Oldest first
    #[serde(default)]
    pub history: Vec<LayerHistoryEntry>,
}

impl EntityLayer {
    pub fn empty(entity_id: &str, layer_name: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            layer_name: layer_name.to_string(),
            latest_value: Value::Null,
            updated_at: None,
            last_checked_at: None,
            history: Vec::new(),
        }
    }
}

/// How an update affected the layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerChange {
    /// First value ever written
    Created,
    /// Same identity as before; only timestamps moved
    Unchanged,
    /// Previous value moved into history
    Rotated,
}

/// Rules for comparing and trimming layer values
#[derive(Debug, Clone)]
pub struct LayerPolicy {
    pub history_limit: usize,
    /// Object keys ignored at any depth when comparing values
    pub volatile_fields: Vec<String>,
}

impl Default for LayerPolicy {
    fn default() -> Self {
        Self::from(&LayersConfig::default())
    }
}

impl From<&LayersConfig> for LayerPolicy {
    fn from(config: &LayersConfig) -> Self {
        Self {
            history_limit: config.history_limit,
            volatile_fields: config.volatile_fields.clone(),
        }
    }
}

impl LayerPolicy {
    /// Compare two values ignoring volatile keys
    pub fn same_identity(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Object(x), Value::Object(y)) => {
                let relevant = |k: &String| !self.volatile_fields.iter().any(|v| v == k);
                let xs: Vec<_> = x.iter().filter(|(k, _)| relevant(*k)).collect();
                let ys: Vec<_> = y.iter().filter(|(k, _)| relevant(*k)).collect();
                xs.len() == ys.len()
                    && xs.iter().all(|(k, xv)| {
                        y.get(k.as_str())
                            .map_or(false, |yv| self.same_identity(xv, yv))
                    })
            }
            (Value::Array(x), Value::Array(y)) => {
                x.len() == y.len() && x.iter().zip(y).all(|(xv, yv)| self.same_identity(xv, yv))
            }
            _ => a == b,
        }
    }
}

/// Merge `new_value` into `current`. Pure: no I/O, clock passed in.
pub fn apply_layer_update(
    mut current: EntityLayer,
    new_value: Value,
    now: DateTime<Utc>,
    policy: &LayerPolicy,
) -> (EntityLayer, LayerChange) {
    let Some(previous_at) = current.updated_at else {
        current.latest_value = new_value;
        current.updated_at = Some(now);
        current.last_checked_at = Some(now);
        return (current, LayerChange::Created);
    };

    if policy.same_identity(&current.latest_value, &new_value) {
        current.updated_at = Some(now);
        current.last_checked_at = Some(now);
        return (current, LayerChange::Unchanged);
    }

    let previous = std::mem::replace(&mut current.latest_value, new_value);
    current.history.push(LayerHistoryEntry {
        value: previous,
        updated_at: previous_at,
    });
    let over = current.history.len().saturating_sub(policy.history_limit);
    current.history.drain(..over);

    current.updated_at = Some(now);
    current.last_checked_at = Some(now);
    (current, LayerChange::Rotated)
}
