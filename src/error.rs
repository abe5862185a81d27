//! Error types for the feed cache

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Upstream unavailable ({source_name}): {reason}")]
    UpstreamUnavailable { source_name: String, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Corrupt record at {location}: {reason}")]
    CorruptRecord { location: String, reason: String },

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FeedError {
    pub fn upstream(source_name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::UpstreamUnavailable {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn corrupt(location: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::CorruptRecord {
            location: location.into(),
            reason: reason.to_string(),
        }
    }

    /// True for failures of the durable layer (as opposed to bad input or upstream)
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            FeedError::Persistence(_) | FeedError::Database(_) | FeedError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;
