//! Index Engine.
//!
//! `IndexCore` holds the state and behavior common to all three index
//! variants: the sync/realtime state machine, level-monotonicity checks, and
//! the startup chain-continuity check against the Block Cache. The source
//! models this as a base class the three variants inherit from; here it's
//! composition — each variant embeds an `IndexCore` and drives it through
//! its own `_synchronize`/`_process_queue` shape.

pub mod big_map;
pub mod head;
pub mod operation;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::block_cache::BlockCache;
use crate::context::Context;
use crate::datasource::Datasource;
use crate::error::{IndexerError, ReindexReason};
use crate::metrics;
use crate::storage::{GlobalTransactionScope, HeadStore, IndexStateStore};
use crate::types::{IndexKind, IndexState, IndexStatus, Level};

pub use big_map::BigMapIndex;
pub use head::HeadIndex;
pub use operation::OperationIndex;

/// Shared collaborators every index variant needs to construct its `IndexCore`.
pub struct IndexDeps {
    pub datasource: Arc<dyn Datasource>,
    pub context: Arc<dyn Context>,
    pub state_store: Arc<dyn IndexStateStore>,
    pub head_store: Arc<dyn HeadStore>,
    pub txn_scope: Arc<dyn GlobalTransactionScope>,
    pub block_cache: Arc<BlockCache>,
}

pub struct IndexCore {
    name: String,
    kind: IndexKind,
    config_hash: String,
    first_level: Level,
    deps: IndexDeps,
    state: Mutex<Option<IndexState>>,
    initialized: AtomicBool,
}

impl IndexCore {
    pub fn new(name: impl Into<String>, kind: IndexKind, config_hash: impl Into<String>, first_level: Level, deps: IndexDeps) -> Self {
        Self {
            name: name.into(),
            kind,
            config_hash: config_hash.into(),
            first_level,
            deps,
            state: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datasource(&self) -> &Arc<dyn Datasource> {
        &self.deps.datasource
    }

    pub fn context(&self) -> &Arc<dyn Context> {
        &self.deps.context
    }

    pub fn txn_scope(&self) -> &Arc<dyn GlobalTransactionScope> {
        &self.deps.txn_scope
    }

    /// Idempotent across restart; fails if called twice within one process
    /// run.
    pub async fn initialize_state(&self) -> Result<(), IndexerError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(IndexerError::runtime(format!(
                "initialize_state called twice for index `{}`",
                self.name
            )));
        }

        let (row, created) = self
            .deps
            .state_store
            .get_or_create(&self.name, self.kind, &self.config_hash, self.first_level)
            .await?;

        if !created && row.level > 0 {
            if let Some(head) = self.deps.head_store.latest(self.deps.datasource.name()).await? {
                let header = match self.deps.block_cache.get(head.level) {
                    Some(h) => h,
                    None => {
                        let h = self.deps.datasource.get_block(head.level).await?;
                        self.deps.block_cache.insert_if_absent(h.clone());
                        h
                    }
                };
                if header.hash != head.hash {
                    tracing::warn!(
                        index = %self.name,
                        level = head.level,
                        expected = %head.hash,
                        actual = %header.hash,
                        "head hash mismatch at startup"
                    );
                    metrics::record_reindex(&self.name, "block_hash_mismatch");
                    self.deps.context.reindex(ReindexReason::BlockHashMismatch).await?;
                }
            }
        }

        tracing::info!(index = %self.name, level = row.level, status = ?row.status, "index state initialized");
        *self.state.lock().unwrap() = Some(row);
        Ok(())
    }

    fn state_guard(&self) -> std::sync::MutexGuard<'_, Option<IndexState>> {
        self.state.lock().unwrap()
    }

    pub fn current_level(&self) -> Result<Level, IndexerError> {
        self.state_guard()
            .as_ref()
            .map(|s| s.level)
            .ok_or_else(|| IndexerError::runtime(format!("index `{}` state not initialized", self.name)))
    }

    pub fn current_status(&self) -> Result<IndexStatus, IndexerError> {
        self.state_guard()
            .as_ref()
            .map(|s| s.status)
            .ok_or_else(|| IndexerError::runtime(format!("index `{}` state not initialized", self.name)))
    }

    pub fn state_snapshot(&self) -> Result<IndexState, IndexerError> {
        self.state_guard()
            .clone()
            .ok_or_else(|| IndexerError::runtime(format!("index `{}` state not initialized", self.name)))
    }

    /// Transactional mutation of the persisted row, mirrored into the
    /// in-memory snapshot.
    pub async fn update_status(&self, status: Option<IndexStatus>, level: Option<Level>) -> Result<(), IndexerError> {
        self.deps.state_store.update_status(&self.name, status, level).await?;
        let mut guard = self.state_guard();
        let row = guard
            .as_mut()
            .ok_or_else(|| IndexerError::runtime(format!("index `{}` state not initialized", self.name)))?;
        if let Some(s) = status {
            row.status = s;
        }
        if let Some(l) = level {
            row.level = l;
        }
        tracing::debug!(index = %self.name, status = ?status, level = ?level, "index state updated");
        Ok(())
    }

    /// `_enter_sync_state`. Returns `Ok(false)` when
    /// there is nothing to do (already one-shot, or already at `last_level`).
    pub async fn enter_sync_state(&self, last_level: Level) -> Result<bool, IndexerError> {
        let status = self.current_status()?;
        let level = self.current_level()?;
        if status == IndexStatus::Oneshot || level == last_level {
            return Ok(false);
        }
        if level > last_level {
            return Err(IndexerError::runtime(format!(
                "index `{}`: cannot sync to last_level={last_level} below state.level={level}",
                self.name
            )));
        }
        self.update_status(Some(IndexStatus::Syncing), None).await?;
        Ok(true)
    }

    /// `_exit_sync_state`.
    pub async fn exit_sync_state(&self, last_level: Level) -> Result<(), IndexerError> {
        self.update_status(Some(IndexStatus::Realtime), Some(last_level)).await
    }
}

/// `_extract_level`: all items in a batch must share
/// one level.
pub fn extract_level<T>(items: &[T], level_of: impl Fn(&T) -> Level) -> Result<Level, IndexerError> {
    let first = items
        .first()
        .map(&level_of)
        .ok_or_else(|| IndexerError::runtime("extract_level called on an empty batch"))?;
    if items.iter().all(|item| level_of(item) == first) {
        Ok(first)
    } else {
        Err(IndexerError::runtime("batch contains items from more than one level"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_level_rejects_mixed_levels() {
        let items = vec![(1i64, "a"), (1, "b"), (2, "c")];
        let err = extract_level(&items, |i| i.0).unwrap_err();
        assert!(matches!(err, IndexerError::Runtime(_)));
    }

    #[test]
    fn extract_level_rejects_empty() {
        let items: Vec<(i64, &str)> = vec![];
        let err = extract_level(&items, |i| i.0).unwrap_err();
        assert!(matches!(err, IndexerError::Runtime(_)));
    }

    #[test]
    fn extract_level_returns_common_level() {
        let items = vec![(5i64, "a"), (5, "b")];
        assert_eq!(extract_level(&items, |i| i.0).unwrap(), 5);
    }

    #[tokio::test]
    async fn s6_startup_hash_mismatch_triggers_reindex() {
        let fixture = crate::test_support::fixture_deps();
        fixture.state_store.seed(IndexState {
            name: "idx".into(),
            kind: IndexKind::Operation,
            config_hash: "x".into(),
            template: None,
            template_values: Default::default(),
            level: 500,
            status: IndexStatus::Realtime,
        });
        fixture.head_store.seed(crate::types::HeadRecord {
            name: fixture.datasource.name.clone(),
            level: 500,
            hash: "0xAAA".into(),
            timestamp: chrono::Utc::now(),
        });
        fixture.datasource.blocks.lock().unwrap().insert(
            500,
            crate::types::BlockHeader { level: 500, hash: "0xBBB".into(), timestamp: chrono::Utc::now() },
        );

        let core = IndexCore::new("idx", IndexKind::Operation, "x", 0, fixture.deps());
        let result = core.initialize_state().await;

        assert!(matches!(result, Err(IndexerError::Reindex(ReindexReason::BlockHashMismatch))));
        assert!(fixture.was_reindexed());
    }

    #[tokio::test]
    async fn s6_startup_hash_match_does_not_reindex() {
        let fixture = crate::test_support::fixture_deps();
        fixture.state_store.seed(IndexState {
            name: "idx".into(),
            kind: IndexKind::Operation,
            config_hash: "x".into(),
            template: None,
            template_values: Default::default(),
            level: 500,
            status: IndexStatus::Realtime,
        });
        fixture.head_store.seed(crate::types::HeadRecord {
            name: fixture.datasource.name.clone(),
            level: 500,
            hash: "0xAAA".into(),
            timestamp: chrono::Utc::now(),
        });
        fixture.datasource.blocks.lock().unwrap().insert(
            500,
            crate::types::BlockHeader { level: 500, hash: "0xAAA".into(), timestamp: chrono::Utc::now() },
        );

        let core = IndexCore::new("idx", IndexKind::Operation, "x", 0, fixture.deps());
        core.initialize_state().await.unwrap();

        assert!(!fixture.was_reindexed());
        assert_eq!(core.current_level().unwrap(), 500);
    }
}
