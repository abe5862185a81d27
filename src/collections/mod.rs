//! Bounded in-memory collections
//!
//! Backpressure against unbounded upstream volume:
//! - `BoundedList`: newest-first list with tail eviction
//! - `DedupLedger`: bounded set of already-merged natural identifiers

mod bounded;
mod dedup;


pub use bounded::BoundedList;
pub use dedup::DedupLedger;
