//! Store abstraction for keelson's state management.
//!
//! A `Store` is the handle every subsystem function takes: where the database
//! lives, the engine configuration, and the injectable collaborators (clock,
//! payload codec, contradiction rules).

use crate::core::broker::DbBroker;
use crate::core::codec::{JsonCodec, PayloadCodec};
use crate::core::config::{self, EngineConfig};
use crate::core::db;
use crate::core::error::KeelsonError;
use crate::core::time::{Clock, SystemClock};
use crate::plugins::contradiction::RuleRegistry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Document kind discriminator. Ids are unique within a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    /// Operational identity of a human user
    User,
    /// Operational identity of an autonomous agent
    Agent,
}

impl DocumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::User => "user",
            DocumentKind::Agent => "agent",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = KeelsonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(DocumentKind::User),
            "agent" => Ok(DocumentKind::Agent),
            other => Err(KeelsonError::invalid(format!(
                "unknown document kind '{}'. Available: user, agent",
                other
            ))),
        }
    }
}

/// Lock and log key for one document.
pub fn subject_key(kind: DocumentKind, id: &str) -> String {
    format!("{}/{}", kind.as_str(), id)
}

/// Store handle representing a keelson state workspace.
#[derive(Clone)]
pub struct Store {
    /// Absolute path to the store root directory
    pub root: PathBuf,
    pub config: EngineConfig,
    broker: DbBroker,
    clock: Arc<dyn Clock>,
    codec: Arc<dyn PayloadCodec>,
    rules: Arc<RuleRegistry>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.root)
            .field("config", &self.config)
            .field("rules", &self.rules.rule_ids())
            .finish()
    }
}

impl Store {
    /// Open (and initialize if needed) a store, reading `keelson.toml` if present.
    pub fn open(root: &Path) -> Result<Self, KeelsonError> {
        let config = config::load_config(root)?;
        Self::open_with_config(root, config)
    }

    pub fn open_with_config(root: &Path, config: EngineConfig) -> Result<Self, KeelsonError> {
        config.validate()?;
        db::initialize_keelson_db(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
            broker: DbBroker::new(root),
            clock: Arc::new(SystemClock),
            codec: Arc::new(JsonCodec),
            rules: Arc::new(RuleRegistry::default()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_rules(mut self, rules: RuleRegistry) -> Self {
        self.rules = Arc::new(rules);
        self
    }

    pub fn broker(&self) -> &DbBroker {
        &self.broker
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn codec(&self) -> &dyn PayloadCodec {
        self.codec.as_ref()
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }
}
