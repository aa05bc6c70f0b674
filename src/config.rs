//! Declarative handler-pattern configuration, plus the process-wide ambient
//! config singleton used for this crate's own tunables (log level/format,
//! metrics port, and similar). The index/handler configs below are the
//! "resolved config" objects the spec assumes have already been produced by
//! the (external) config loader before an index engine is constructed.

pub use config::Config;
pub use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::error::Error;

use crate::types::{IndexKind, Level};

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

/// Load and install the process-wide ambient config from `config.toml`.
/// Idempotent-once: a second call fails, matching the one-shot semantics of
/// the rest of this crate's initialization routines.
pub fn init_global_config() -> Result<(), Box<dyn Error>> {
    let config = Config::builder()
        .add_source(config::File::with_name("config.toml").required(false))
        .add_source(config::Environment::with_prefix("TZINDEX"))
        .build()?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| "Config already set")?;
    Ok(())
}

pub fn get_global_config() -> &'static Config {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: Config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

/// Load a standalone config, e.g. for use by tooling that isn't the main
/// indexer process and doesn't want to touch the global singleton.
pub fn load_config() -> Result<Config, Box<dyn Error>> {
    Config::builder()
        .add_source(config::File::with_name("config.toml").required(false))
        .add_source(config::Environment::with_prefix("TZINDEX"))
        .build()
        .map_err(|e| Box::new(e) as Box<dyn Error>)
}

// ============================================================================
// Handler pattern configuration 
// ============================================================================

/// A contract reference as it appears in handler config (address plus, for
/// BigMap handlers, the contract this handler is scoped to).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractConfig {
    pub address: String,
}

/// A single slot of an operation handler's pattern. 
/// distinguishes transaction and origination slots, each with its own set of
/// optional discriminators; `required` governs whether the matcher accepts a
/// skipped (null) binding for this slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pattern {
    Transaction {
        #[serde(default)]
        required: bool,
        /// `None` matches any entrypoint and yields the raw operation as the
        /// handler argument instead of a decoded `Transaction`.
        entrypoint: Option<String>,
        destination: Option<ContractConfig>,
        source: Option<ContractConfig>,
        parameter_schema: Option<&'static str>,
        storage_schema: Option<&'static str>,
    },
    Origination {
        #[serde(default)]
        required: bool,
        source: Option<ContractConfig>,
        originated_contract: Option<ContractConfig>,
        similar_to: Option<ContractConfig>,
        strict: bool,
        storage_schema: Option<&'static str>,
    },
}

impl Pattern {
    pub fn is_required(&self) -> bool {
        match self {
            Pattern::Transaction { required, .. } => *required,
            Pattern::Origination { required, .. } => *required,
        }
    }
}

/// One handler entry under an `OperationIndexConfig`: a pattern (ordered
/// slots) plus the callback to fire when the whole pattern completes a
/// match. `parent` is filled in by the (external) config resolver; a handler
/// config reaching the matcher with `parent=None` is a config-initialization
/// bug.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationHandlerConfig {
    pub callback: String,
    pub parent: Option<String>,
    pub pattern: Vec<Pattern>,
}

impl OperationHandlerConfig {
    pub fn required_slot_count(&self) -> usize {
        self.pattern.iter().filter(|p| p.is_required()).count()
    }
}

/// One handler entry under a `BigMapIndexConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigMapHandlerConfig {
    pub callback: String,
    pub parent: Option<String>,
    pub contract: ContractConfig,
    pub path: String,
    pub key_schema: Option<&'static str>,
    pub value_schema: Option<&'static str>,
}

/// One handler entry under a `HeadIndexConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadHandlerConfig {
    pub callback: String,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Transaction,
    Origination,
    Migration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationIndexConfig {
    pub name: String,
    pub first_level: Level,
    pub last_level: Option<Level>,
    pub types: Vec<OperationType>,
    pub contracts: Vec<ContractConfig>,
    pub handlers: Vec<OperationHandlerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigMapIndexConfig {
    pub name: String,
    pub first_level: Level,
    pub last_level: Option<Level>,
    pub handlers: Vec<BigMapHandlerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadIndexConfig {
    pub name: String,
    pub first_level: Level,
    pub last_level: Option<Level>,
    pub handlers: Vec<HeadHandlerConfig>,
}

/// Tagged union over the three concrete index config shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexConfig {
    Operation(OperationIndexConfig),
    BigMap(BigMapIndexConfig),
    Head(HeadIndexConfig),
}

impl IndexConfig {
    pub fn name(&self) -> &str {
        match self {
            IndexConfig::Operation(c) => &c.name,
            IndexConfig::BigMap(c) => &c.name,
            IndexConfig::Head(c) => &c.name,
        }
    }

    pub fn kind(&self) -> IndexKind {
        match self {
            IndexConfig::Operation(_) => IndexKind::Operation,
            IndexConfig::BigMap(_) => IndexKind::BigMap,
            IndexConfig::Head(_) => IndexKind::Head,
        }
    }

    pub fn first_level(&self) -> Level {
        match self {
            IndexConfig::Operation(c) => c.first_level,
            IndexConfig::BigMap(c) => c.first_level,
            IndexConfig::Head(c) => c.first_level,
        }
    }

    pub fn last_level(&self) -> Option<Level> {
        match self {
            IndexConfig::Operation(c) => c.last_level,
            IndexConfig::BigMap(c) => c.last_level,
            IndexConfig::Head(c) => c.last_level,
        }
    }

    /// Stable digest of the declarative config, stored as `IndexState.config_hash`.
    /// A real implementation would hash the fully-resolved config tree; this
    /// crate only needs it to be stable and cheap, so it serializes to JSON
    /// and hashes that.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        use std::hash::{Hash, Hasher};
        json.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

