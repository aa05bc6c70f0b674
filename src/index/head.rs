//! `HeadIndex`: trivial pass-through per block head.
//! No historical fetch, no pattern matching — every queued head fires every
//! configured handler.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::config::HeadIndexConfig;
use crate::error::IndexerError;
use crate::index::{IndexCore, IndexDeps};
use crate::metrics;
use crate::types::{HandlerArg, HeadBlockData, IndexKind, IndexStatus, Level};

pub struct HeadIndex {
    core: IndexCore,
    config: HeadIndexConfig,
    queue: Mutex<VecDeque<HeadBlockData>>,
}

impl HeadIndex {
    pub fn new(config: HeadIndexConfig, deps: IndexDeps) -> Self {
        let config_hash = crate::config::IndexConfig::Head(config.clone()).fingerprint();
        let first_level = config.first_level;
        let name = config.name.clone();
        Self {
            core: IndexCore::new(name, IndexKind::Head, config_hash, first_level, deps),
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

    pub fn push_head(&self, head: HeadBlockData) {
        self.queue.lock().unwrap().push_back(head);
    }

    pub async fn process(&self) -> Result<(), IndexerError> {
        if let Some(last_level) = self.config.last_level {
            self.synchronize(last_level).await?;
            self.core.update_status(Some(IndexStatus::Oneshot), None).await?;
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

    /// `_synchronize`: trivial, no historical fetch.
    async fn synchronize(&self, last_level: Level) -> Result<(), IndexerError> {
        self.core.update_status(Some(IndexStatus::Realtime), Some(last_level)).await
    }

    /// `_process_queue`.
    async fn process_queue(&self) -> Result<(), IndexerError> {
        loop {
            let head = self.queue.lock().unwrap().pop_front();
            let Some(head) = head else { return Ok(()) };
            self.process_head(head).await?;
        }
    }

    async fn process_head(&self, head: HeadBlockData) -> Result<(), IndexerError> {
        let current_level = self.core.current_level()?;
        if head.level <= current_level {
            return Err(IndexerError::runtime(format!(
                "index `{}`: head level {} must exceed state.level {current_level}",
                self.core.name(),
                head.level
            )));
        }

        self.core.txn_scope().begin().await?;
        let outcome = self.fire_all(&head).await;
        match outcome {
            Ok(()) => {
                self.core.txn_scope().commit().await?;
                metrics::record_level_processed(self.core.name(), "head");
                Ok(())
            }
            Err(e) => {
                let _ = self.core.txn_scope().rollback().await;
                Err(e)
            }
        }
    }

    async fn fire_all(&self, head: &HeadBlockData) -> Result<(), IndexerError> {
        for handler in &self.config.handlers {
            let parent = handler.parent.as_deref().ok_or(IndexerError::ConfigInitialization)?;
            metrics::record_handler_fire(self.core.name(), &handler.callback);
            self.core
                .context()
                .fire_handler(
                    &handler.callback,
                    parent,
                    self.core.datasource().as_ref(),
                    &head.hash,
                    vec![HandlerArg::Head(head.clone())],
                )
                .await?;
        }
        self.core.update_status(None, Some(head.level)).await
    }
}
