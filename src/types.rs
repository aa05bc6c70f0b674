//! Data model shared by every index variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type Level = i64;

/// The kind of index a config/state row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Operation,
    BigMap,
    Head,
}

/// Lifecycle status of an [`IndexState`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    New,
    Syncing,
    Realtime,
    Oneshot,
    RolledBack,
}

/// Persisted per-index progress record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexState {
    pub name: String,
    pub kind: IndexKind,
    pub config_hash: String,
    pub template: Option<String>,
    pub template_values: HashMap<String, String>,
    pub level: Level,
    pub status: IndexStatus,
}

impl IndexState {
    pub fn new(name: impl Into<String>, kind: IndexKind, config_hash: impl Into<String>, first_level: Level) -> Self {
        Self {
            name: name.into(),
            kind,
            config_hash: config_hash.into(),
            template: None,
            template_values: HashMap::new(),
            level: first_level,
            status: IndexStatus::New,
        }
    }
}

/// Persisted per-datasource tip record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadRecord {
    pub name: String,
    pub level: Level,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
}

/// A block header as reported by the datasource (`get_block`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    pub level: Level,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Transaction,
    Origination,
    Migration,
}

/// A single raw operation within a block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationData {
    pub level: Level,
    /// Operation-group hash. Together with `counter` identifies the subgroup.
    pub hash: String,
    /// Sender nonce; together with `hash` identifies the subgroup.
    pub counter: u64,
    #[serde(rename = "type")]
    pub kind: OperationType,
    pub sender_address: Option<String>,
    pub target_address: Option<String>,
    pub entrypoint: Option<String>,
    pub parameter_json: Option<serde_json::Value>,
    pub storage: Option<serde_json::Value>,
    pub originated_contract_address: Option<String>,
    pub originated_contract_code_hash: Option<i64>,
    pub originated_contract_type_hash: Option<i64>,
}

/// Identifies the ordered run of operations sharing `(hash, counter)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationSubgroup {
    pub hash: String,
    pub counter: u64,
}

impl OperationData {
    pub fn subgroup(&self) -> OperationSubgroup {
        OperationSubgroup {
            hash: self.hash.clone(),
            counter: self.counter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BigMapAction {
    Allocate,
    AddKey,
    UpdateKey,
    RemoveKey,
    Remove,
}

impl BigMapAction {
    /// Whether this action carries a key/value payload at all (`remove` and
    /// `allocate` have neither).
    pub fn has_key(&self) -> bool {
        matches!(self, BigMapAction::AddKey | BigMapAction::UpdateKey | BigMapAction::RemoveKey)
    }

    pub fn has_value(&self) -> bool {
        matches!(self, BigMapAction::AddKey | BigMapAction::UpdateKey)
    }
}

/// A single big-map storage diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigMapData {
    pub level: Level,
    pub operation_id: String,
    pub contract_address: String,
    pub path: String,
    pub action: BigMapAction,
    pub key: Option<serde_json::Value>,
    pub value: Option<serde_json::Value>,
}

/// A new block head event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadBlockData {
    pub level: Level,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub protocol: Option<String>,
}

/// Decoded transaction handler argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub data: OperationData,
    pub parameter: Option<serde_json::Value>,
    pub storage: Option<serde_json::Value>,
}

/// Decoded origination handler argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Origination {
    pub data: OperationData,
    pub storage: Option<serde_json::Value>,
}

/// Decoded big-map diff handler argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigMapDiff {
    pub data: BigMapData,
    pub action: BigMapAction,
    pub key: Option<serde_json::Value>,
    pub value: Option<serde_json::Value>,
}

/// One matched slot's argument: either a bound operation/diff, or a null
/// placeholder for an unmatched optional slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandlerArg {
    Transaction(Transaction),
    Origination(Origination),
    BigMapDiff(BigMapDiff),
    RawOperation(OperationData),
    Head(HeadBlockData),
    Null,
}

/// A queue item for [`crate::index::operation::OperationIndex`].
#[derive(Debug, Clone)]
pub enum OperationQueueItem {
    Batch(Vec<OperationData>),
    SingleLevelRollback(Level),
}

/// A queue item for [`crate::index::big_map::BigMapIndex`].
#[derive(Debug, Clone)]
pub struct BigMapBatch(pub Vec<BigMapData>);
