//! `BigMapIndex`: matches big-map storage diffs by
//! contract address and storage path. Simpler than `OperationIndex` — no
//! subgroup structure, no optional slots, no single-level rollback support.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::config::BigMapIndexConfig;
use crate::error::IndexerError;
use crate::index::{extract_level, IndexCore, IndexDeps};
use crate::metrics;
use crate::types::{BigMapBatch, BigMapData, BigMapDiff, HandlerArg, IndexKind, Level};

use futures::StreamExt;

use crate::config::BigMapHandlerConfig;

struct Matched<'a> {
    handler: &'a BigMapHandlerConfig,
    diff: &'a BigMapData,
}

pub struct BigMapIndex {
    core: IndexCore,
    config: BigMapIndexConfig,
    queue: Mutex<VecDeque<BigMapBatch>>,
}

impl BigMapIndex {
    pub fn new(config: BigMapIndexConfig, deps: IndexDeps) -> Self {
        let config_hash = crate::config::IndexConfig::BigMap(config.clone()).fingerprint();
        let first_level = config.first_level;
        let name = config.name.clone();
        Self {
            core: IndexCore::new(name, IndexKind::BigMap, config_hash, first_level, deps),
            config,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn core(&self) -> &IndexCore {
        &self.core
    }

    pub async fn initialize_state(&self) -> Result<(), IndexerError> {
        self.core.initialize_state().await
    }

    pub fn push_big_maps(&self, diffs: Vec<BigMapData>) {
        self.queue.lock().unwrap().push_back(BigMapBatch(diffs));
    }

    pub async fn process(&self) -> Result<(), IndexerError> {
        if let Some(last_level) = self.config.last_level {
            self.synchronize(last_level).await?;
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
            self.synchronize(sync_level).await?;
        } else {
            self.process_queue().await?;
        }
        Ok(())
    }

    /// `_synchronize`: union of `contract.address`
    /// across handlers and union of `handler.path`.
    async fn synchronize(&self, last_level: Level) -> Result<(), IndexerError> {
        if !self.core.enter_sync_state(last_level).await? {
            return Ok(());
        }

        let mut addresses: Vec<String> = self.config.handlers.iter().map(|h| h.contract.address.clone()).collect();
        addresses.sort();
        addresses.dedup();
        let mut paths: Vec<String> = self.config.handlers.iter().map(|h| h.path.clone()).collect();
        paths.sort();
        paths.dedup();

        let params = crate::datasource::BigMapFetcherParams {
            first_level: self.config.first_level,
            last_level,
            addresses,
            paths,
        };

        let mut stream = self.core.datasource().fetch_big_maps_by_level(params);
        while let Some(batch) = stream.next().await {
            let (_level, diffs) = batch?;
            self.process_level_big_maps(diffs).await?;
        }

        self.core.exit_sync_state(last_level).await
    }

    async fn process_queue(&self) -> Result<(), IndexerError> {
        loop {
            let item = self.queue.lock().unwrap().pop_front();
            match item {
                None => return Ok(()),
                Some(BigMapBatch(diffs)) => self.process_level_big_maps(diffs).await?,
            }
        }
    }

    /// `_process_level_big_maps`: no single-level
    /// rollback support here; `level > state.level` is strictly required,
    /// equality is fatal.
    async fn process_level_big_maps(&self, diffs: Vec<BigMapData>) -> Result<(), IndexerError> {
        if diffs.is_empty() {
            return Ok(());
        }
        let level = extract_level(&diffs, |d| d.level)?;
        let current_level = self.core.current_level()?;
        if level <= current_level {
            return Err(IndexerError::runtime(format!(
                "index `{}`: big-map level {level} must exceed state.level {current_level}",
                self.core.name()
            )));
        }

        let matches = self.match_big_maps(&diffs);

        if matches.is_empty() {
            self.core.update_status(None, Some(level)).await?;
            return Ok(());
        }

        self.core.txn_scope().begin().await?;
        let outcome = self.fire_all(&matches, level).await;
        match outcome {
            Ok(()) => {
                self.core.txn_scope().commit().await?;
                metrics::record_level_processed(self.core.name(), "big_map");
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

    /// `_match_big_map` applied over the whole batch.
    fn match_big_maps<'a>(&self, diffs: &'a [BigMapData]) -> Vec<Matched<'a>> {
        let mut matches = Vec::new();
        for diff in diffs {
            for handler in &self.config.handlers {
                if handler.path == diff.path && handler.contract.address == diff.contract_address {
                    matches.push(Matched { handler, diff });
                }
            }
        }
        matches
    }

    async fn call_matched_handler(&self, matched: &Matched<'_>) -> Result<(), IndexerError> {
        let parent = matched.handler.parent.as_deref().ok_or(IndexerError::ConfigInitialization)?;
        let arg = Self::prepare_handler_arg(matched.handler, matched.diff)?;
        metrics::record_handler_fire(self.core.name(), &matched.handler.callback);
        self.core
            .context()
            .fire_handler(
                &matched.handler.callback,
                parent,
                self.core.datasource().as_ref(),
                &format!("{}: ", matched.diff.operation_id),
                vec![HandlerArg::BigMapDiff(arg)],
            )
            .await
    }

    /// `_prepare_handler_args`: decode key/value only
    /// when the action implies they're present.
    fn prepare_handler_arg(handler: &BigMapHandlerConfig, diff: &BigMapData) -> Result<BigMapDiff, IndexerError> {
        let key = if diff.action.has_key() {
            Some(Self::decode(handler.key_schema, diff.key.as_ref())?)
        } else {
            None
        };
        let value = if diff.action.has_value() {
            Some(Self::decode(handler.value_schema, diff.value.as_ref())?)
        } else {
            None
        };
        Ok(BigMapDiff { data: diff.clone(), action: diff.action, key, value })
    }

    fn decode(schema: Option<&'static str>, raw: Option<&serde_json::Value>) -> Result<serde_json::Value, IndexerError> {
        match schema {
            None => Ok(raw.cloned().unwrap_or(serde_json::Value::Null)),
            Some(name) => raw
                .cloned()
                .filter(|v| !v.is_null())
                .ok_or_else(|| IndexerError::invalid_data(name, serde_json::Value::Null, "missing key/value payload for declared schema")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContractConfig;
    use crate::test_support::fixture_deps;
    use crate::types::{BigMapAction, IndexState, IndexStatus};

    fn handler() -> BigMapHandlerConfig {
        BigMapHandlerConfig {
            callback: "on_ledger_update".into(),
            parent: Some("ledger".into()),
            contract: ContractConfig { address: "KT1A".into() },
            path: "ledger".into(),
            key_schema: None,
            value_schema: None,
        }
    }

    fn diff(level: Level, action: BigMapAction) -> BigMapData {
        BigMapData {
            level,
            operation_id: "op1".into(),
            contract_address: "KT1A".into(),
            path: "ledger".into(),
            action,
            key: Some(serde_json::json!("tz1abc")),
            value: Some(serde_json::json!(100)),
        }
    }

    #[tokio::test]
    async fn matches_and_bumps_level() {
        let config = BigMapIndexConfig { name: "ledger".into(), first_level: 0, last_level: None, handlers: vec![handler()] };
        let fixture = fixture_deps();
        fixture.state_store.seed(IndexState {
            name: "ledger".into(),
            kind: IndexKind::BigMap,
            config_hash: "x".into(),
            template: None,
            template_values: Default::default(),
            level: 10,
            status: IndexStatus::Realtime,
        });
        let index = BigMapIndex::new(config, fixture.deps());
        index.initialize_state().await.unwrap();

        index.process_level_big_maps(vec![diff(11, BigMapAction::UpdateKey)]).await.unwrap();

        assert_eq!(index.core.current_level().unwrap(), 11);
        assert_eq!(fixture.fired().len(), 1);
    }

    #[tokio::test]
    async fn equality_with_state_level_is_fatal() {
        let config = BigMapIndexConfig { name: "ledger".into(), first_level: 0, last_level: None, handlers: vec![] };
        let fixture = fixture_deps();
        fixture.state_store.seed(IndexState {
            name: "ledger".into(),
            kind: IndexKind::BigMap,
            config_hash: "x".into(),
            template: None,
            template_values: Default::default(),
            level: 10,
            status: IndexStatus::Realtime,
        });
        let index = BigMapIndex::new(config, fixture.deps());
        index.initialize_state().await.unwrap();

        let result = index.process_level_big_maps(vec![diff(10, BigMapAction::UpdateKey)]).await;
        assert!(matches!(result, Err(IndexerError::Runtime(_))));
    }

    #[tokio::test]
    async fn allocate_action_has_no_key_or_value() {
        let config = BigMapIndexConfig { name: "ledger".into(), first_level: 0, last_level: None, handlers: vec![handler()] };
        let fixture = fixture_deps();
        fixture.state_store.seed(IndexState {
            name: "ledger".into(),
            kind: IndexKind::BigMap,
            config_hash: "x".into(),
            template: None,
            template_values: Default::default(),
            level: 10,
            status: IndexStatus::Realtime,
        });
        let index = BigMapIndex::new(config, fixture.deps());
        index.initialize_state().await.unwrap();

        index.process_level_big_maps(vec![diff(11, BigMapAction::Allocate)]).await.unwrap();
        let fired = fixture.fired();
        let HandlerArg::BigMapDiff(d) = &fired[0].2[0] else { panic!("expected BigMapDiff arg") };
        assert!(d.key.is_none());
        assert!(d.value.is_none());
    }
}
