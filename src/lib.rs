//! Market Feed Aggregator
//!
//! Keeps a continuously refreshed snapshot of independently sourced market
//! feeds, per-entity derived layers, a tiered time-series archive and a
//! prediction scoring loop.

pub mod aggregate;
pub mod archive;
pub mod collections;
pub mod config;
pub mod entity;
pub mod error;
pub mod prediction;
pub mod storage;
pub mod types;
