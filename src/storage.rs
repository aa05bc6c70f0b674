//! The storage layer.
//!
//! An ORM-like repository exposing `Index` and `Head` records plus a
//! process-wide global-transaction scope. This crate only depends on the
//! trait contracts; the in-memory implementations below back this crate's
//! own tests. A real deployment substitutes a database-backed
//! implementation, which is out of scope here.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::IndexerError;
use crate::types::{HeadRecord, IndexKind, IndexState, IndexStatus, Level};

/// Repository trait for persisted per-index progress rows.
#[async_trait]
pub trait IndexStateStore: Send + Sync {
    /// Returns the existing row for `name`, or creates one with the given
    /// defaults. The bool indicates whether a new row was created.
    async fn get_or_create(
        &self,
        name: &str,
        kind: IndexKind,
        config_hash: &str,
        first_level: Level,
    ) -> Result<(IndexState, bool), IndexerError>;

    /// Transactional mutation of `status`/`level`. `None` leaves the field
    /// unchanged.
    async fn update_status(
        &self,
        name: &str,
        status: Option<IndexStatus>,
        level: Option<Level>,
    ) -> Result<(), IndexerError>;

    async fn get(&self, name: &str) -> Result<Option<IndexState>, IndexerError>;
}

/// Repository trait for per-datasource tip records.
#[async_trait]
pub trait HeadStore: Send + Sync {
    async fn latest(&self, datasource_name: &str) -> Result<Option<HeadRecord>, IndexerError>;

    async fn upsert(&self, head: HeadRecord) -> Result<(), IndexerError>;
}

/// Scoped acquisition of the single process-wide transaction; commit-or-
/// rollback is guaranteed on scope exit. Only one active entry per process
/// is allowed; implementations should reject (or, as here, panic on)
/// reentrant acquisition within the same task, since two indexes entering
/// concurrently would violate cooperative scheduling.
#[async_trait]
pub trait GlobalTransactionScope: Send + Sync {
    /// Acquire the scope. Panics on reentrant acquisition from the same task.
    async fn begin(&self) -> Result<(), IndexerError>;

    /// Commit and release the scope.
    async fn commit(&self) -> Result<(), IndexerError>;

    /// Roll back and release the scope.
    async fn rollback(&self) -> Result<(), IndexerError>;
}

// ============================================================================
// In-memory test doubles
// ============================================================================

/// In-memory [`IndexStateStore`] used by this crate's own tests.
#[derive(Default)]
pub struct InMemoryIndexStateStore {
    rows: Mutex<HashMap<String, IndexState>>,
}

impl InMemoryIndexStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, state: IndexState) {
        self.rows.lock().unwrap().insert(state.name.clone(), state);
    }
}

#[async_trait]
impl IndexStateStore for InMemoryIndexStateStore {
    async fn get_or_create(
        &self,
        name: &str,
        kind: IndexKind,
        config_hash: &str,
        first_level: Level,
    ) -> Result<(IndexState, bool), IndexerError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(existing) = rows.get(name) {
            return Ok((existing.clone(), false));
        }
        let row = IndexState::new(name, kind, config_hash, first_level);
        rows.insert(name.to_string(), row.clone());
        Ok((row, true))
    }

    async fn update_status(
        &self,
        name: &str,
        status: Option<IndexStatus>,
        level: Option<Level>,
    ) -> Result<(), IndexerError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(name)
            .ok_or_else(|| IndexerError::runtime(format!("update_status on unknown index `{name}`")))?;
        if let Some(s) = status {
            row.status = s;
        }
        if let Some(l) = level {
            row.level = l;
        }
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<IndexState>, IndexerError> {
        Ok(self.rows.lock().unwrap().get(name).cloned())
    }
}

/// In-memory [`HeadStore`].
#[derive(Default)]
pub struct InMemoryHeadStore {
    heads: Mutex<HashMap<String, HeadRecord>>,
}

impl InMemoryHeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, head: HeadRecord) {
        self.heads.lock().unwrap().insert(head.name.clone(), head);
    }
}

#[async_trait]
impl HeadStore for InMemoryHeadStore {
    async fn latest(&self, datasource_name: &str) -> Result<Option<HeadRecord>, IndexerError> {
        Ok(self.heads.lock().unwrap().get(datasource_name).cloned())
    }

    async fn upsert(&self, head: HeadRecord) -> Result<(), IndexerError> {
        self.heads.lock().unwrap().insert(head.name.clone(), head);
        Ok(())
    }
}

/// In-memory [`GlobalTransactionScope`] that panics on reentrant acquisition.
#[derive(Default)]
pub struct InMemoryTransactionScope {
    active: AtomicBool,
}

impl InMemoryTransactionScope {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GlobalTransactionScope for InMemoryTransactionScope {
    async fn begin(&self) -> Result<(), IndexerError> {
        if self.active.swap(true, Ordering::SeqCst) {
            panic!("reentrant global transaction scope acquisition");
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), IndexerError> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), IndexerError> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}
