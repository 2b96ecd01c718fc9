use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TRACELINK_DIR_NAME: &str = ".tracelink";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_SQLITE_FILE: &str = "graph.sqlite";
pub const DEFAULT_MAX_DEPTH: u32 = 15;
pub const DEFAULT_MAX_DEPTH_LIMIT: u32 = 64;
pub const DEFAULT_SERVICE_CONTEXT_EVENTS: u32 = 10;
pub const DEFAULT_SUMMARY_STEPS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceContextScope {
    /// Every event of the node's service across the whole snapshot.
    #[default]
    Batch,
    /// Evidence and the event window are both counted per trace.
    Trace,
}

impl ServiceContextScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Trace => "trace",
        }
    }
}

impl std::str::FromStr for ServiceContextScope {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "batch" => Ok(Self::Batch),
            "trace" => Ok(Self::Trace),
            other => Err(format!(
                "invalid service context scope '{other}', expected one of: batch, trace"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TracelinkConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub linker: LinkerConfig,
    #[serde(default)]
    pub traversal: TraversalConfig,
    #[serde(default)]
    pub workflows: WorkflowConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_sqlite_file")]
    pub sqlite_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_file: default_sqlite_file(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub pattern: String,
    pub function: String,
    #[serde(default)]
    pub regex: bool,
}

impl ErrorPattern {
    pub fn substring(pattern: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            function: function.into(),
            regex: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceContextConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub scope: ServiceContextScope,
    /// Zero means unlimited.
    #[serde(default = "default_service_context_events")]
    pub max_events_per_node: u32,
}

impl Default for ServiceContextConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scope: ServiceContextScope::Batch,
            max_events_per_node: DEFAULT_SERVICE_CONTEXT_EVENTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkerConfig {
    #[serde(default = "default_true")]
    pub name_matching: bool,
    #[serde(default = "default_true")]
    pub error_matching: bool,
    #[serde(default = "default_error_patterns")]
    pub error_patterns: Vec<ErrorPattern>,
    #[serde(default)]
    pub service_context: ServiceContextConfig,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            name_matching: true,
            error_matching: true,
            error_patterns: default_error_patterns(),
            service_context: ServiceContextConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalConfig {
    #[serde(default = "default_max_depth")]
    pub default_max_depth: u32,
    /// Hard bound applied to every request, including unbounded ones.
    #[serde(default = "default_max_depth_limit")]
    pub max_depth_limit: u32,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            default_max_depth: DEFAULT_MAX_DEPTH,
            max_depth_limit: DEFAULT_MAX_DEPTH_LIMIT,
        }
    }
}

impl TraversalConfig {
    pub fn effective_depth(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_max_depth)
            .min(self.max_depth_limit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_summary_steps")]
    pub summary_steps: u32,
    /// When non-empty, only roots owned by these services are materialized.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry_services: Vec<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            summary_steps: DEFAULT_SUMMARY_STEPS,
            entry_services: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub fn tracelink_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(TRACELINK_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    tracelink_dir(workspace_root).join(CONFIG_FILE_NAME)
}

pub fn load_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<TracelinkConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(TracelinkConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: TracelinkConfig = toml::from_str(&raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<TracelinkConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(tracelink_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = TracelinkConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

pub fn validate_config(config: &TracelinkConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    for (index, pattern) in config.linker.error_patterns.iter().enumerate() {
        if pattern.pattern.is_empty() || pattern.function.is_empty() {
            warnings.push(ConfigWarning {
                code: "empty_error_pattern",
                message: format!(
                    "linker.error_patterns[{index}] needs both pattern and function; it is ignored"
                ),
            });
            continue;
        }
        if pattern.regex
            && let Err(err) = Regex::new(&pattern.pattern)
        {
            warnings.push(ConfigWarning {
                code: "invalid_error_regex",
                message: format!(
                    "linker.error_patterns[{index}] '{}' is not a valid regex ({err}); it is ignored",
                    pattern.pattern
                ),
            });
        }
    }

    if config.traversal.default_max_depth == 0 {
        warnings.push(ConfigWarning {
            code: "zero_default_depth",
            message: "traversal.default_max_depth is 0; forward/backward only return the start node"
                .to_owned(),
        });
    }
    if config.traversal.default_max_depth > config.traversal.max_depth_limit {
        warnings.push(ConfigWarning {
            code: "depth_above_limit",
            message: format!(
                "traversal.default_max_depth {} exceeds max_depth_limit {}; the limit wins",
                config.traversal.default_max_depth, config.traversal.max_depth_limit
            ),
        });
    }
    if !config.linker.name_matching
        && !config.linker.error_matching
        && !config.linker.service_context.enabled
    {
        warnings.push(ConfigWarning {
            code: "linker_disabled",
            message: "all linker strategies are disabled; linking produces no edges".to_owned(),
        });
    }

    warnings
}

fn default_true() -> bool {
    true
}

fn default_sqlite_file() -> String {
    DEFAULT_SQLITE_FILE.to_owned()
}

fn default_max_depth() -> u32 {
    DEFAULT_MAX_DEPTH
}

fn default_max_depth_limit() -> u32 {
    DEFAULT_MAX_DEPTH_LIMIT
}

fn default_service_context_events() -> u32 {
    DEFAULT_SERVICE_CONTEXT_EVENTS
}

fn default_summary_steps() -> u32 {
    DEFAULT_SUMMARY_STEPS
}

fn default_error_patterns() -> Vec<ErrorPattern> {
    vec![
        ErrorPattern::substring("Unknown symbol", "get_market_price"),
        ErrorPattern::substring("Invalid quantity", "validate_quantity"),
        ErrorPattern::substring("Risk assessment failed", "assess_risk"),
        ErrorPattern::substring("PnL integrity check failed", "assess_risk"),
        ErrorPattern::substring("execution timed out", "assess_risk"),
    ]
}

fn normalize_config(mut config: TracelinkConfig) -> TracelinkConfig {
    let sqlite_file = config.storage.sqlite_file.trim();
    config.storage.sqlite_file = if sqlite_file.is_empty() {
        default_sqlite_file()
    } else {
        sqlite_file.to_owned()
    };

    for pattern in &mut config.linker.error_patterns {
        pattern.function = pattern.function.trim().to_owned();
    }

    config.workflows.entry_services = config
        .workflows
        .entry_services
        .iter()
        .map(|service| service.trim().to_owned())
        .filter(|service| !service.is_empty())
        .collect();

    if config.traversal.max_depth_limit == 0 {
        config.traversal.max_depth_limit = DEFAULT_MAX_DEPTH_LIMIT;
    }

    config
}
