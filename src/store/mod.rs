//! Identity mapping store.
//!
//! A small transactional key-value engine holding SID<->unix-id pairs and
//! per-id-type high-water-mark counters. Backed by SQLite so the paired
//! records and counter updates commit atomically.

mod idmap;
mod upgrade;

pub use idmap::{IdRange, IdmapConfig, IdmapStore, StoreError};
pub use upgrade::SCHEMA_VERSION;
