//! Core index engine for an on-chain event indexer.
//!
//! This crate owns the per-index state machines that pull historical events
//! during sync, merge into a realtime feed, match raw events against
//! declarative handler patterns, and invoke handlers inside a single atomic
//! transaction per block level. The dispatcher, CLI, datasource client,
//! handler registry, and storage backend are external collaborators;
//! this crate only defines the traits they implement.

pub mod block_cache;
pub mod config;
pub mod context;
pub mod datasource;
pub mod error;
pub mod index;
pub mod metrics;
pub mod storage;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub mod test_support;

pub use error::IndexerError;
