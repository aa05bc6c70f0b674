//! Literal fixtures and in-memory test doubles shared by this crate's own
//! test suites. Not part of the public API surface —
//! `#[cfg(test)]` only.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::block_cache::BlockCache;
use crate::context::Context;
use crate::datasource::{
    BigMapFetcherParams, BigMapFetcherStream, ContractSummary, Datasource, OperationFetcherParams, OperationFetcherStream,
};
use crate::error::{IndexerError, ReindexReason};
use crate::index::IndexDeps;
use crate::storage::{InMemoryHeadStore, InMemoryIndexStateStore, InMemoryTransactionScope};
use crate::types::{BlockHeader, HandlerArg, Level};

/// An in-memory `Datasource` whose lookups are seeded by the test, so
/// `_synchronize`'s address-gathering and `similar_to` resolution can be
/// exercised without a real chain client.
pub struct FakeDatasource {
    pub name: String,
    pub sync_level: Mutex<Option<Level>>,
    pub blocks: Mutex<HashMap<Level, BlockHeader>>,
    pub contract_summaries: Mutex<HashMap<String, ContractSummary>>,
    pub originated_contracts: Mutex<HashMap<String, Vec<String>>>,
    pub similar_contracts: Mutex<HashMap<String, Vec<String>>>,
}

impl Default for FakeDatasource {
    fn default() -> Self {
        Self {
            name: "fake".to_string(),
            sync_level: Mutex::new(Some(0)),
            blocks: Mutex::new(HashMap::new()),
            contract_summaries: Mutex::new(HashMap::new()),
            originated_contracts: Mutex::new(HashMap::new()),
            similar_contracts: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Datasource for FakeDatasource {
    fn name(&self) -> &str {
        &self.name
    }

    fn sync_level(&self) -> Option<Level> {
        *self.sync_level.lock().unwrap()
    }

    async fn get_block(&self, level: Level) -> Result<BlockHeader, IndexerError> {
        self.blocks
            .lock()
            .unwrap()
            .get(&level)
            .cloned()
            .ok_or_else(|| IndexerError::runtime(format!("no fixture block at level {level}")))
    }

    async fn get_migration_originations(&self, _level: Level) -> Result<Vec<crate::types::OperationData>, IndexerError> {
        Ok(Vec::new())
    }

    async fn get_contract_summary(&self, address: &str) -> Result<ContractSummary, IndexerError> {
        self.contract_summaries
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| IndexerError::runtime(format!("no fixture contract summary for {address}")))
    }

    async fn get_originated_contracts(&self, address: &str) -> Result<Vec<String>, IndexerError> {
        Ok(self.originated_contracts.lock().unwrap().get(address).cloned().unwrap_or_default())
    }

    async fn get_similar_contracts(&self, address: &str, _strict: bool) -> Result<Vec<String>, IndexerError> {
        Ok(self.similar_contracts.lock().unwrap().get(address).cloned().unwrap_or_default())
    }

    fn fetch_operations_by_level(&self, _params: OperationFetcherParams) -> OperationFetcherStream {
        Box::pin(futures::stream::empty())
    }

    fn fetch_big_maps_by_level(&self, _params: BigMapFetcherParams) -> BigMapFetcherStream {
        Box::pin(futures::stream::empty())
    }
}

/// An in-memory `Context` that records every fired handler and every reindex
/// request instead of invoking real user code.
#[derive(Default)]
pub struct RecordingContext {
    pub fired: Mutex<Vec<(String, String, Vec<HandlerArg>)>>,
    pub reindexed: Mutex<bool>,
}

#[async_trait]
impl Context for RecordingContext {
    async fn fire_handler(
        &self,
        callback_name: &str,
        parent_name: &str,
        _datasource: &(dyn Datasource),
        _log_prefix: &str,
        args: Vec<HandlerArg>,
    ) -> Result<(), IndexerError> {
        self.fired.lock().unwrap().push((callback_name.to_string(), parent_name.to_string(), args));
        Ok(())
    }

    async fn reindex(&self, reason: ReindexReason) -> Result<std::convert::Infallible, IndexerError> {
        *self.reindexed.lock().unwrap() = true;
        Err(IndexerError::Reindex(reason))
    }
}

/// Bundles every collaborator an index needs, plus handles to assert on
/// afterwards.
pub struct Fixture {
    pub datasource: Arc<FakeDatasource>,
    pub context: Arc<RecordingContext>,
    pub state_store: Arc<InMemoryIndexStateStore>,
    pub head_store: Arc<InMemoryHeadStore>,
    pub txn_scope: Arc<InMemoryTransactionScope>,
    pub block_cache: Arc<BlockCache>,
}

impl Fixture {
    pub fn deps(&self) -> IndexDeps {
        IndexDeps {
            datasource: self.datasource.clone(),
            context: self.context.clone(),
            state_store: self.state_store.clone(),
            head_store: self.head_store.clone(),
            txn_scope: self.txn_scope.clone(),
            block_cache: self.block_cache.clone(),
        }
    }

    pub fn fired(&self) -> Vec<(String, String, Vec<HandlerArg>)> {
        self.context.fired.lock().unwrap().clone()
    }

    pub fn was_reindexed(&self) -> bool {
        *self.context.reindexed.lock().unwrap()
    }
}

pub fn fixture_deps() -> Fixture {
    Fixture {
        datasource: Arc::new(FakeDatasource::default()),
        context: Arc::new(RecordingContext::default()),
        state_store: Arc::new(InMemoryIndexStateStore::new()),
        head_store: Arc::new(InMemoryHeadStore::new()),
        txn_scope: Arc::new(InMemoryTransactionScope::new()),
        block_cache: Arc::new(BlockCache::new()),
    }
}
