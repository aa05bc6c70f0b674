//! The upstream event source.
//!
//! This crate never talks to a chain node itself; a real deployment plugs in
//! a concrete `Datasource` backed by an RPC/indexer client. This module only
//! defines the contract and the lazy-sequence fetcher shapes the sync path
//! iterates over.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::error::IndexerError;
use crate::types::{BigMapData, BlockHeader, Level, OperationData};

/// `(level, items)` pairs from a historical-sync fetcher, strictly ascending
/// in `level`; each tuple is non-empty.
pub type LevelBatch<T> = (Level, Vec<T>);

pub type OperationFetcherStream = Pin<Box<dyn Stream<Item = Result<LevelBatch<OperationData>, IndexerError>> + Send>>;
pub type BigMapFetcherStream = Pin<Box<dyn Stream<Item = Result<LevelBatch<BigMapData>, IndexerError>> + Send>>;

/// Parameters used to seed an operation fetcher during historical sync: the
/// address sets computed from the index's config plus the level range to
/// cover.
#[derive(Debug, Clone, Default)]
pub struct OperationFetcherParams {
    pub first_level: Level,
    pub last_level: Level,
    pub transaction_addresses: Vec<String>,
    pub origination_addresses: Vec<String>,
    /// Migration-originations fetched once at `first_level` (config type
    /// `migration`), with `originated_contract_code_hash`/`type_hash`
    /// already populated. The fetcher is expected to splice these into the
    /// level-`first_level` batch of its yielded sequence.
    pub migration_originations: Vec<OperationData>,
}

/// Parameters used to seed a `BigMapFetcher`.
#[derive(Debug, Clone, Default)]
pub struct BigMapFetcherParams {
    pub first_level: Level,
    pub last_level: Level,
    pub addresses: Vec<String>,
    pub paths: Vec<String>,
}

/// Summary of a contract used to resolve `similar_to` discriminators.
#[derive(Debug, Clone)]
pub struct ContractSummary {
    pub code_hash: i64,
    pub type_hash: i64,
}

/// The upstream data source contract. Implementations are expected to be
/// `Send + Sync` since the dispatcher may hold the same datasource across
/// multiple concurrently-scheduled indexes.
#[async_trait]
pub trait Datasource: Send + Sync {
    /// Stable identifier used as the `Head` record key.
    fn name(&self) -> &str;

    /// Current realtime head level; `None` until the realtime handshake
    /// completes.
    fn sync_level(&self) -> Option<Level>;

    async fn get_block(&self, level: Level) -> Result<BlockHeader, IndexerError>;

    async fn get_migration_originations(&self, level: Level) -> Result<Vec<OperationData>, IndexerError>;

    async fn get_contract_summary(&self, address: &str) -> Result<ContractSummary, IndexerError>;

    async fn get_originated_contracts(&self, address: &str) -> Result<Vec<String>, IndexerError>;

    async fn get_similar_contracts(&self, address: &str, strict: bool) -> Result<Vec<String>, IndexerError>;

    /// Open a lazy sequence of `(level, operations)` batches covering the
    /// requested range, strictly ascending in level.
    fn fetch_operations_by_level(&self, params: OperationFetcherParams) -> OperationFetcherStream;

    /// Open a lazy sequence of `(level, big_map_diffs)` batches.
    fn fetch_big_maps_by_level(&self, params: BigMapFetcherParams) -> BigMapFetcherStream;
}
