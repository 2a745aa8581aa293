//! Engine configuration.
//!
//! Plain serde structs with defaults, loadable from JSON and overridable from
//! `RETE_*` environment variables.
//!
//! ```text
//! EngineConfig
//!   ├── validation   fail_fast, max_depth, max_expressions
//!   ├── xuples       default space name and policies
//!   ├── logging      level, format
//!   └── persistence  persist_memories
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ReteError, ReteResult};
use crate::xuples::{ConsumptionKind, RetentionKind, SelectionKind};

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "RETE_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Program validation
    pub validation: ValidationConfig,
    /// Defaults for implicitly created xuple-spaces
    pub xuples: XupleDefaults,
    /// Tracing subscriber
    pub logging: LoggingConfig,
    /// Node memory persistence
    pub persistence: PersistenceConfig,
}

/// Validation limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Stop at the first error instead of collecting all of them
    pub fail_fast: bool,
    /// Deepest allowed constraint tree
    pub max_depth: usize,
    /// Most expressions allowed in one program
    pub max_expressions: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            max_depth: 20,
            max_expressions: 1000,
        }
    }
}

/// Policies for spaces a rule targets without a declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XupleDefaults {
    /// Space used by rules that name none
    pub default_space: String,
    /// Selection policy
    pub selection: SelectionKind,
    /// Consumption policy
    pub consumption: ConsumptionKind,
    /// Retention policy
    pub retention: RetentionKind,
    /// Capacity, 0 for unbounded
    pub max_size: usize,
}

impl Default for XupleDefaults {
    fn default() -> Self {
        Self {
            default_space: "default".to_string(),
            selection: SelectionKind::Fifo,
            consumption: ConsumptionKind::Once,
            retention: RetentionKind::Unlimited,
            max_size: 0,
        }
    }
}

/// Output format of the fmt subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-field default layout
    #[default]
    Full,
    /// Single-line layout
    Compact,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `rete_xuples=debug`
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Full,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Save a node's memory after every mutation when a storage is attached
    pub persist_memories: bool,
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl EngineConfig {
    /// Parse a JSON document; missing sections take their defaults.
    pub fn from_json_str(json: &str) -> ReteResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> ReteResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            ReteError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&data)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> ReteResult<Self> {
        let mut config = Self::default();
        config.apply_overrides(std::env::vars())?;
        Ok(config)
    }

    /// Apply `RETE_*` overrides from a list of variables.
    ///
    /// Unrelated variables are ignored; a malformed value is a `Config` error.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> ReteResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();
            match name {
                "LOG_LEVEL" => self.logging.level = value.to_string(),
                "LOG_FORMAT" => {
                    self.logging.format = match value.to_ascii_lowercase().as_str() {
                        "full" => LogFormat::Full,
                        "compact" => LogFormat::Compact,
                        other => {
                            return Err(ReteError::Config(format!(
                                "{}LOG_FORMAT: unknown format '{}'",
                                ENV_PREFIX, other
                            )));
                        }
                    }
                }
                "FAIL_FAST" => self.validation.fail_fast = parse_bool(name, value)?,
                "MAX_DEPTH" => self.validation.max_depth = parse_usize(name, value)?,
                "MAX_EXPRESSIONS" => self.validation.max_expressions = parse_usize(name, value)?,
                "DEFAULT_SPACE" => self.xuples.default_space = value.to_string(),
                "PERSIST_MEMORIES" => {
                    self.persistence.persist_memories = parse_bool(name, value)?
                }
                _ => {}
            }
        }
        self.validate()
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> ReteResult<()> {
        if self.validation.max_depth == 0 {
            return Err(ReteError::Config("max_depth must be at least 1".into()));
        }
        if self.xuples.default_space.trim().is_empty() {
            return Err(ReteError::Config("default_space must not be empty".into()));
        }
        let level = self.logging.level.to_ascii_lowercase();
        // Bare levels are checked; directive lists are left to the filter parser.
        if !level.contains('=') && !level.contains(',') && !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ReteError::Config(format!(
                "unknown log level '{}'",
                self.logging.level
            )));
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> ReteResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ReteError::Config(format!(
            "{}{}: expected a boolean, got '{}'",
            ENV_PREFIX, name, value
        ))),
    }
}

fn parse_usize(name: &str, value: &str) -> ReteResult<usize> {
    value.parse().map_err(|_| {
        ReteError::Config(format!(
            "{}{}: expected a non-negative integer, got '{}'",
            ENV_PREFIX, name, value
        ))
    })
}
