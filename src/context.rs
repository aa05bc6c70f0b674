//! The handler registry.
//!
//! Resolves a named callback under a parent index and invokes user code with
//! the matched handler arguments. `reindex` is modeled here as returning an
//! `IndexerError::Reindex` rather than diverging: reindexing destroys state
//! and restarts the process, and the cleanest Rust shape for "never
//! returns, caller must unwind" in an async trait is a terminal `Err` the
//! caller propagates with `?`.

use async_trait::async_trait;

use crate::datasource::Datasource;
use crate::error::{IndexerError, ReindexReason};
use crate::types::HandlerArg;

/// Invokes user-defined handler callbacks and performs destructive reindex.
#[async_trait]
pub trait Context: Send + Sync {
    /// Resolve `callback_name` under `parent_name` and await it with the
    /// matched arguments. `log_prefix` carries a per-subgroup
    /// `"<subgroup.hash>: "` style prefix; callers pass it through so
    /// implementations can thread it into their own logging if they choose.
    async fn fire_handler(
        &self,
        callback_name: &str,
        parent_name: &str,
        datasource: &(dyn Datasource),
        log_prefix: &str,
        args: Vec<HandlerArg>,
    ) -> Result<(), IndexerError>;

    /// Destructive reset: wipe this index's persisted state and signal the
    /// dispatcher to restart it. Always returns `Err(IndexerError::Reindex)`;
    /// callers must propagate it with `?` rather than continue.
    async fn reindex(&self, reason: ReindexReason) -> Result<std::convert::Infallible, IndexerError> {
        Err(IndexerError::Reindex(reason))
    }
}
