//! Block cache: a level → header mapping used only to validate the
//! last-processed level on startup.
//!
//! The original keeps this as a module-level global with process lifetime;
//! an explicit owner passed into `initialize_state` is more testable, so
//! this crate models it as a plain struct an engine (or test) constructs
//! and shares.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{BlockHeader, Level};

/// Process-wide cache, written once per level, never invalidated during a
/// run.
#[derive(Default)]
pub struct BlockCache {
    headers: Mutex<HashMap<Level, BlockHeader>>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached header for `level`, if any.
    pub fn get(&self, level: Level) -> Option<BlockHeader> {
        self.headers.lock().unwrap().get(&level).cloned()
    }

    /// Records `header` for its level, overwriting nothing if already
    /// present (first writer wins, matching "written on first lookup").
    pub fn insert_if_absent(&self, header: BlockHeader) {
        self.headers.lock().unwrap().entry(header.level).or_insert(header);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn header(level: Level, hash: &str) -> BlockHeader {
        BlockHeader { level, hash: hash.to_string(), timestamp: Utc::now() }
    }

    #[test]
    fn first_writer_wins() {
        let cache = BlockCache::new();
        cache.insert_if_absent(header(10, "a"));
        cache.insert_if_absent(header(10, "b"));
        assert_eq!(cache.get(10).unwrap().hash, "a");
    }

    #[test]
    fn miss_returns_none() {
        let cache = BlockCache::new();
        assert!(cache.get(1).is_none());
    }
}
