//! Core data types shared across modules

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized record pushed by an upstream collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    /// Stable identifier used for deduplication (URL, filing number, ...)
    pub natural_id: String,
    /// Source-specific payload
    pub payload: serde_json::Value,
    /// When the record was published upstream
    pub timestamp: DateTime<Utc>,
}

impl RawRecord {
    pub fn new(natural_id: impl Into<String>, payload: serde_json::Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            natural_id: natural_id.into(),
            payload,
            timestamp,
        }
    }
}

/// Where a section's current value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    /// Computed from the primary upstream
    Live,
    /// Computed from durable fallback data
    Fallback,
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceTag::Live => write!(f, "live"),
            SourceTag::Fallback => write!(f, "fallback"),
        }
    }
}

/// Reject identifiers that cannot be used as a storage key
pub fn validate_key(kind: &str, value: &str) -> crate::error::Result<()> {
    if value.trim().is_empty() {
        return Err(crate::error::FeedError::Validation(format!("{} must not be empty", kind)));
    }
    if value.contains(['/', '\\']) || value == "." || value == ".." {
        return Err(crate::error::FeedError::Validation(format!(
            "{} contains path characters: {}",
            kind, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_tag_serialization() {
        assert_eq!(serde_json::to_string(&SourceTag::Live).unwrap(), "\"live\"");
        assert_eq!(serde_json::to_string(&SourceTag::Fallback).unwrap(), "\"fallback\"");
    }

    #[test]
    fn test_raw_record_camel_case() {
        let record = RawRecord::new("n-1", serde_json::json!({"title": "x"}), Utc::now());
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"naturalId\":\"n-1\""));
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("entity id", "AAPL").is_ok());
        assert!(validate_key("entity id", "").is_err());
        assert!(validate_key("entity id", "../etc").is_err());
        assert!(validate_key("entity id", "..").is_err());
    }
}
