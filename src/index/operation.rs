//! `OperationIndex`: matches operation subgroups
//! against declarative handler patterns and drives the sync/realtime queue
//! for operation events.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use crate::config::{ContractConfig, OperationHandlerConfig, OperationIndexConfig, OperationType as ConfigOperationType, Pattern};
use crate::datasource::{ContractSummary, OperationFetcherParams};
use crate::error::{IndexerError, ReindexReason};
use crate::index::{extract_level, IndexCore, IndexDeps};
use crate::metrics;
use crate::types::{
    HandlerArg, IndexKind, Level, Origination, OperationData, OperationQueueItem, OperationSubgroup, OperationType, Transaction,
};

use futures::StreamExt;

/// One completed pattern match, ready to be prepared into handler args and
/// fired.
struct Matched<'a> {
    subgroup: OperationSubgroup,
    handler: &'a OperationHandlerConfig,
    bound: Vec<Option<&'a OperationData>>,
}

pub struct OperationIndex {
    core: IndexCore,
    config: OperationIndexConfig,
    queue: Mutex<VecDeque<OperationQueueItem>>,
    rollback_level: Mutex<Option<Level>>,
    head_hashes: Mutex<HashSet<String>>,
    contract_summary_cache: Mutex<HashMap<String, ContractSummary>>,
}

impl OperationIndex {
    pub fn new(config: OperationIndexConfig, deps: IndexDeps) -> Self {
        let config_hash = crate::config::IndexConfig::Operation(config.clone()).fingerprint();
        let first_level = config.first_level;
        let name = config.name.clone();
        Self {
            core: IndexCore::new(name, IndexKind::Operation, config_hash, first_level, deps),
            config,
            queue: Mutex::new(VecDeque::new()),
            rollback_level: Mutex::new(None),
            head_hashes: Mutex::new(HashSet::new()),
            contract_summary_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn core(&self) -> &IndexCore {
        &self.core
    }

    pub async fn initialize_state(&self) -> Result<(), IndexerError> {
        self.core.initialize_state().await
    }

    /// Non-blocking append from the dispatcher (,
    /// `push_operations`).
    pub fn push_operations(&self, operations: Vec<OperationData>) {
        self.queue.lock().unwrap().push_back(OperationQueueItem::Batch(operations));
    }

    /// `push_rollback`.
    pub fn push_rollback(&self, level: Level) {
        self.queue.lock().unwrap().push_back(OperationQueueItem::SingleLevelRollback(level));
    }

    /// `process()`.
    pub async fn process(&self) -> Result<(), IndexerError> {
        if let Some(last_level) = self.config.last_level {
            self.synchronize(last_level, true).await?;
            self.core.update_status(Some(crate::types::IndexStatus::Oneshot), None).await?;
            return Ok(());
        }

        let sync_level = self
            .core
            .datasource()
            .sync_level()
            .ok_or_else(|| IndexerError::runtime("datasource sync_level not yet known"))?;

        if self.core.current_level()? < sync_level {
            self.queue.lock().unwrap().clear();
            self.synchronize(sync_level, false).await?;
        } else {
            self.process_queue().await?;
        }
        Ok(())
    }

    /// `_synchronize`.
    async fn synchronize(&self, last_level: Level, cache: bool) -> Result<(), IndexerError> {
        if !self.core.enter_sync_state(last_level).await? {
            return Ok(());
        }

        let transaction_addresses = if self.config.types.contains(&ConfigOperationType::Transaction) {
            self.config.contracts.iter().map(|c| c.address.clone()).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        let origination_addresses = self.gather_origination_addresses().await?;

        // `cache` tunes the (external) fetcher's own batching only; migration
        // originations are always looked up fresh since they're a one-time
        // first-level fetch, not part of the lazy per-level sequence.
        let _ = cache;
        let mut migration_originations = Vec::new();
        if self.config.types.contains(&ConfigOperationType::Migration) {
            let mut migrations = self
                .core
                .datasource()
                .get_migration_originations(self.config.first_level)
                .await?;
            for migration in &mut migrations {
                if let Some(addr) = migration.originated_contract_address.clone() {
                    let summary = self.cache_contract_summary(&addr).await?;
                    migration.originated_contract_code_hash = Some(summary.code_hash);
                    migration.originated_contract_type_hash = Some(summary.type_hash);
                }
            }
            migration_originations = migrations;
        }

        let params = OperationFetcherParams {
            first_level: self.config.first_level,
            last_level,
            transaction_addresses,
            origination_addresses,
            migration_originations,
        };

        let mut stream = self.core.datasource().fetch_operations_by_level(params);
        while let Some(batch) = stream.next().await {
            let (_level, operations) = batch?;
            self.process_level_operations(operations).await?;
        }

        self.core.exit_sync_state(last_level).await
    }

    /// Union of explicit `originated_contract` addresses, addresses
    /// originated by each `source` contract, and addresses of contracts
    /// similar to each `similar_to` contract.
    async fn gather_origination_addresses(&self) -> Result<Vec<String>, IndexerError> {
        let mut addresses: Vec<String> = Vec::new();
        for handler in &self.config.handlers {
            for slot in &handler.pattern {
                if let Pattern::Origination { source, originated_contract, similar_to, strict, .. } = slot {
                    if let Some(c) = originated_contract {
                        addresses.push(c.address.clone());
                    }
                    if let Some(c) = source {
                        let originated = self.core.datasource().get_originated_contracts(&c.address).await?;
                        addresses.extend(originated);
                    }
                    if let Some(c) = similar_to {
                        let similar = self.core.datasource().get_similar_contracts(&c.address, *strict).await?;
                        addresses.extend(similar);
                    }
                }
            }
        }
        addresses.sort();
        addresses.dedup();
        Ok(addresses)
    }

    async fn process_queue(&self) -> Result<(), IndexerError> {
        loop {
            let item = self.queue.lock().unwrap().pop_front();
            match item {
                None => return Ok(()),
                Some(OperationQueueItem::Batch(ops)) => self.process_level_operations(ops).await?,
                Some(OperationQueueItem::SingleLevelRollback(level)) => self.single_level_rollback(level).await?,
            }
        }
    }

    /// `_process_level_operations`.
    async fn process_level_operations(&self, operations: Vec<OperationData>) -> Result<(), IndexerError> {
        if operations.is_empty() {
            return Ok(());
        }
        let level = extract_level(&operations, |op| op.level)?;

        let armed = *self.rollback_level.lock().unwrap();
        let operations = if let Some(armed_level) = armed {
            let current_level = self.core.current_level()?;
            if level != armed_level || level != current_level {
                return Err(IndexerError::runtime(format!(
                    "index `{}`: rollback armed at level {armed_level} but received batch at level {level}",
                    self.core.name()
                )));
            }
            let previous_hashes = std::mem::take(&mut *self.head_hashes.lock().unwrap());
            let incoming_hashes: HashSet<&String> = operations.iter().map(|op| &op.hash).collect();
            let missing = previous_hashes.iter().any(|h| !incoming_hashes.contains(h));
            *self.rollback_level.lock().unwrap() = None;

            if missing {
                metrics::record_reindex(self.core.name(), "rollback");
                self.core.context().reindex(ReindexReason::Rollback).await?;
                unreachable!("reindex always returns Err");
            }
            metrics::record_rollback(self.core.name(), "reconciled");
            operations
                .into_iter()
                .filter(|op| !previous_hashes.contains(&op.hash))
                .collect::<Vec<_>>()
        } else {
            let current_level = self.core.current_level()?;
            if level <= current_level {
                return Err(IndexerError::runtime(format!(
                    "index `{}`: level {level} <= state.level {current_level} outside an armed rollback",
                    self.core.name()
                )));
            }
            operations
        };

        if operations.is_empty() {
            self.core.update_status(None, Some(level)).await?;
            return Ok(());
        }

        let matches = self.match_operations(&operations).await?;

        if matches.is_empty() {
            self.core.update_status(None, Some(level)).await?;
            metrics::record_level_processed(self.core.name(), "operation");
            return Ok(());
        }

        self.core.txn_scope().begin().await?;
        let outcome = self.fire_all(&matches, level).await;
        match outcome {
            Ok(()) => {
                self.core.txn_scope().commit().await?;
                metrics::record_level_processed(self.core.name(), "operation");
                Ok(())
            }
            Err(e) => {
                let _ = self.core.txn_scope().rollback().await;
                Err(e)
            }
        }
    }

    async fn fire_all(&self, matches: &[Matched<'_>], level: Level) -> Result<(), IndexerError> {
        for m in matches {
            self.call_matched_handler(m).await?;
        }
        self.core.update_status(None, Some(level)).await
    }

    /// `_single_level_rollback`.
    async fn single_level_rollback(&self, level: Level) -> Result<(), IndexerError> {
        let current_level = self.core.current_level()?;
        let mut guard = self.rollback_level.lock().unwrap();
        if guard.is_some() {
            return Err(IndexerError::runtime(format!(
                "index `{}`: rollback already armed, re-entry is fatal",
                self.core.name()
            )));
        }
        if current_level < level {
            metrics::record_rollback(self.core.name(), "ignored");
            return Ok(());
        }
        if current_level > level {
            return Err(IndexerError::runtime(format!(
                "index `{}`: rollback at level {level} below state.level {current_level}",
                self.core.name()
            )));
        }
        *guard = Some(level);
        metrics::record_rollback(self.core.name(), "armed");
        tracing::warn!(index = %self.core.name(), level, "single-level rollback armed");
        Ok(())
    }

    /// Two-cursor pattern matcher over one subgroup's operations. The
    /// origination-dedup memo (`seen_originations`) is built fresh for this
    /// one call, scoped to this batch rather than cached on the handler
    /// config, so a repeated originated address can't leak dedup state
    /// across unrelated calls. The trailing "enough required slots matched"
    /// branch runs at most once per subgroup/handler pass and pads
    /// unvisited trailing optional slots with `None` rather than leaving
    /// `bound` shorter than the pattern, so it can never emit args of the
    /// wrong length or double-fire a handler for the same completed match.
    async fn match_operations<'a>(&self, operations: &'a [OperationData]) -> Result<Vec<Matched<'a>>, IndexerError> {
        let mut order: Vec<OperationSubgroup> = Vec::new();
        let mut groups: HashMap<OperationSubgroup, Vec<&'a OperationData>> = HashMap::new();
        {
            let mut head_hashes = self.head_hashes.lock().unwrap();
            head_hashes.clear();
            for op in operations {
                let sg = op.subgroup();
                if !groups.contains_key(&sg) {
                    order.push(sg.clone());
                }
                groups.entry(sg).or_default().push(op);
                head_hashes.insert(op.hash.clone());
            }
        }

        let mut seen_originations: HashSet<(usize, usize, String)> = HashSet::new();
        let mut matches: Vec<Matched<'a>> = Vec::new();

        for subgroup in &order {
            let ops = &groups[subgroup];

            for (handler_idx, handler) in self.config.handlers.iter().enumerate() {
                let pattern = &handler.pattern;
                if pattern.is_empty() {
                    continue;
                }

                let mut op_idx = 0usize;
                let mut pat_idx = 0usize;
                let mut bound: Vec<Option<&'a OperationData>> = Vec::new();

                while op_idx < ops.len() {
                    let op = ops[op_idx];
                    let slot = &pattern[pat_idx];
                    let is_match = self
                        .match_operation(handler_idx, pat_idx, slot, op, &mut seen_originations)
                        .await?;

                    if is_match {
                        bound.push(Some(op));
                        pat_idx += 1;
                        op_idx += 1;
                    } else if !slot.is_required() {
                        bound.push(None);
                        pat_idx += 1;
                    } else {
                        op_idx += 1;
                    }

                    if pat_idx == pattern.len() {
                        matches.push(Matched {
                            subgroup: subgroup.clone(),
                            handler,
                            bound: std::mem::take(&mut bound),
                        });
                        pat_idx = 0;
                    }
                }

                if !bound.is_empty() && pat_idx < pattern.len() {
                    let remaining_required = pattern[pat_idx..].iter().any(|s| s.is_required());
                    let required_bound = bound.iter().filter(|b| b.is_some()).count();
                    let required_total = pattern.iter().filter(|s| s.is_required()).count();
                    if !remaining_required && required_bound >= required_total {
                        for _ in pat_idx..pattern.len() {
                            bound.push(None);
                        }
                        matches.push(Matched { subgroup: subgroup.clone(), handler, bound });
                    }
                }
            }
        }

        Ok(matches)
    }

    /// `_match_operation`. `seen_originations` dedups
    /// an origination slot binding the same originated address twice within
    /// this call (invariant 5).
    async fn match_operation(
        &self,
        handler_idx: usize,
        slot_idx: usize,
        slot: &Pattern,
        op: &OperationData,
        seen_originations: &mut HashSet<(usize, usize, String)>,
    ) -> Result<bool, IndexerError> {
        let raw_match = match slot {
            Pattern::Transaction { entrypoint, destination, source, .. } => {
                if op.kind != OperationType::Transaction {
                    false
                } else if let Some(ep) = entrypoint {
                    if op.entrypoint.as_deref() != Some(ep.as_str()) {
                        false
                    } else {
                        Self::matches_contract(destination, &op.target_address) && Self::matches_contract(source, &op.sender_address)
                    }
                } else {
                    Self::matches_contract(destination, &op.target_address) && Self::matches_contract(source, &op.sender_address)
                }
            }
            Pattern::Origination { source, originated_contract, similar_to, strict, .. } => {
                if op.kind != OperationType::Origination {
                    false
                } else if !Self::matches_contract(source, &op.sender_address) {
                    false
                } else if !Self::matches_contract(originated_contract, &op.originated_contract_address) {
                    false
                } else if let Some(c) = similar_to {
                    let summary = self.cache_contract_summary(&c.address).await?;
                    if *strict {
                        op.originated_contract_code_hash == Some(summary.code_hash)
                    } else {
                        op.originated_contract_type_hash == Some(summary.type_hash)
                    }
                } else {
                    true
                }
            }
        };

        if raw_match && matches!(slot, Pattern::Origination { .. }) {
            if let Some(address) = &op.originated_contract_address {
                let key = (handler_idx, slot_idx, address.clone());
                if seen_originations.contains(&key) {
                    return Ok(false);
                }
                seen_originations.insert(key);
            }
        }

        Ok(raw_match)
    }

    fn matches_contract(constraint: &Option<ContractConfig>, actual: &Option<String>) -> bool {
        match constraint {
            None => true,
            Some(c) => actual.as_deref() == Some(c.address.as_str()),
        }
    }

    async fn cache_contract_summary(&self, address: &str) -> Result<ContractSummary, IndexerError> {
        if let Some(summary) = self.contract_summary_cache.lock().unwrap().get(address) {
            return Ok(summary.clone());
        }
        let summary = self.core.datasource().get_contract_summary(address).await?;
        self.contract_summary_cache.lock().unwrap().insert(address.to_string(), summary.clone());
        Ok(summary)
    }

    /// `_prepare_handler_args` + `_call_matched_handler`
    ///.
    async fn call_matched_handler(&self, matched: &Matched<'_>) -> Result<(), IndexerError> {
        let parent = matched
            .handler
            .parent
            .as_deref()
            .ok_or(IndexerError::ConfigInitialization)?;

        let mut args = Vec::with_capacity(matched.bound.len());
        for (slot, op) in matched.handler.pattern.iter().zip(matched.bound.iter()) {
            args.push(Self::prepare_slot_arg(slot, *op)?);
        }

        let log_prefix = format!("{}: ", matched.subgroup.hash);
        metrics::record_handler_fire(self.core.name(), &matched.handler.callback);
        self.core
            .context()
            .fire_handler(&matched.handler.callback, parent, self.core.datasource().as_ref(), &log_prefix, args)
            .await
    }

    fn prepare_slot_arg(slot: &Pattern, op: Option<&OperationData>) -> Result<HandlerArg, IndexerError> {
        let op = match op {
            None => return Ok(HandlerArg::Null),
            Some(op) => op,
        };

        match slot {
            Pattern::Transaction { entrypoint: None, .. } => Ok(HandlerArg::RawOperation(op.clone())),
            Pattern::Transaction { parameter_schema, storage_schema, .. } => {
                let parameter = Self::decode(*parameter_schema, op.parameter_json.as_ref())?;
                let storage = Self::decode(*storage_schema, op.storage.as_ref())?;
                Ok(HandlerArg::Transaction(Transaction { data: op.clone(), parameter, storage }))
            }
            Pattern::Origination { storage_schema, .. } => {
                let storage = Self::decode(*storage_schema, op.storage.as_ref())?;
                Ok(HandlerArg::Origination(Origination { data: op.clone(), storage }))
            }
        }
    }

    fn decode(schema: Option<&'static str>, raw: Option<&serde_json::Value>) -> Result<Option<serde_json::Value>, IndexerError> {
        match schema {
            None => Ok(raw.cloned()),
            Some(name) => match raw {
                Some(v) if !v.is_null() => Ok(Some(v.clone())),
                other => Err(IndexerError::invalid_data(
                    name,
                    other.cloned().unwrap_or(serde_json::Value::Null),
                    "missing or null payload for a handler slot with a declared schema",
                )),
            },
        }
    }
}
