//! Error kinds for the index engine.
//!
//! Config-initialization bugs, schema-validation failures, violated runtime
//! invariants, reindex control flow, and opaque handler failures each get a
//! distinct variant rather than one catch-all string, since the (external)
//! dispatcher branches on which kind it got.

use thiserror::Error;

/// Why a reindex was triggered. Carried by [`IndexerError::Reindex`] so the
/// dispatcher (which actually performs the destructive reset) knows why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReindexReason {
    /// The head hash recorded at startup no longer matches what the
    /// datasource reports for that level.
    BlockHashMismatch,
    /// A single-level rollback removed an operation we had already processed.
    Rollback,
}

impl std::fmt::Display for ReindexReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReindexReason::BlockHashMismatch => write!(f, "block_hash_mismatch"),
            ReindexReason::Rollback => write!(f, "rollback"),
        }
    }
}

/// The index engine's error type.
///
/// `InvalidData` and `Handler` carry enough context for a caller to log or
/// surface a diagnostic; `ConfigInitialization` and `Runtime` indicate a bug
/// upstream of this crate (unresolved config, violated invariant) and are
/// never expected to be handled, only logged and propagated.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// A handler config's `parent` link was never resolved before dispatch.
    #[error("config initialization error: handler config has no parent index")]
    ConfigInitialization,

    /// Schema validation failed while decoding a parameter, storage, key, or
    /// value payload.
    #[error("invalid data for schema `{schema}`: {context}")]
    InvalidData {
        schema: &'static str,
        raw: serde_json::Value,
        context: String,
    },

    /// A violated invariant: uninitialized state, out-of-order levels, a
    /// batch with mixed levels, double rollback arming, sync to a lower
    /// level than already processed. Always a programming error; never
    /// retried.
    #[error("runtime invariant violated: {0}")]
    Runtime(String),

    /// Not a failure: control flow signalling that the dispatcher must wipe
    /// this index's state and restart it. Modeled as an error variant since
    /// "never returns, caller must unwind" has no other clean shape in an
    /// async trait.
    #[error("reindex required: {0}")]
    Reindex(ReindexReason),

    /// A user-defined handler callback failed. The source error is opaque
    /// since handler bodies are outside this crate's control.
    #[error("handler `{callback}` failed: {source}")]
    Handler {
        callback: String,
        #[source]
        source: anyhow::Error,
    },
}

impl IndexerError {
    pub fn runtime(msg: impl Into<String>) -> Self {
        IndexerError::Runtime(msg.into())
    }

    pub fn invalid_data(schema: &'static str, raw: serde_json::Value, context: impl Into<String>) -> Self {
        IndexerError::InvalidData {
            schema,
            raw,
            context: context.into(),
        }
    }
}
