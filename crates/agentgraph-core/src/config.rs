use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AgentGraphError, Result};

/// Top-level agentgraph configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    /// Model registry: `model_name` in graph nodes resolves against these keys.
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
}

/// How the scheduler dispatches runnable nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One node at a time, in definition order within a level.
    Sequential,
    /// Every runnable node of a level at once.
    #[default]
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Model calls per node before the node settles on its last answer.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Cap on concurrently running nodes within one level (unset = no cap).
    #[serde(default)]
    pub max_parallel_nodes: Option<usize>,
    /// Node executions allowed per turn before the run is failed.
    #[serde(default = "default_max_node_runs")]
    pub max_node_runs: usize,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Tool results longer than this are truncated before reaching the model.
    #[serde(default = "default_max_tool_output_chars")]
    pub max_tool_output_chars: usize,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Directory of `*.json` graph definitions usable as subgraphs.
    #[serde(default)]
    pub graphs_dir: Option<String>,
    /// Directory of prompt templates referenced as `{{@name}}`.
    #[serde(default)]
    pub prompts_dir: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_parallel_nodes: None,
            max_node_runs: default_max_node_runs(),
            mode: ExecutionMode::default(),
            max_tool_output_chars: default_max_tool_output_chars(),
            workspace: default_workspace(),
            graphs_dir: None,
            prompts_dir: None,
        }
    }
}

fn default_max_iterations() -> usize { 10 }
fn default_max_node_runs() -> usize { 256 }
fn default_max_tool_output_chars() -> usize { 16_000 }
fn default_workspace() -> String { "~/.agentgraph".to_string() }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database for sessions. Default: <workspace>/sessions.db
    #[serde(default)]
    pub database: Option<String>,
    /// Directory for node artifacts. Default: <workspace>/artifacts
    #[serde(default)]
    pub artifacts_dir: Option<String>,
}

/// JSONL run log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run lifecycle, 2 = + nodes and handoffs, 3 = + tools.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: None,
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            provider: default_provider(),
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            extra_headers: BTreeMap::new(),
        }
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| AgentGraphError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| AgentGraphError::Config(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| self.workspace_dir().join("sessions.db"))
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.storage
            .artifacts_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| self.workspace_dir().join("artifacts"))
    }

    pub fn graphs_dir(&self) -> PathBuf {
        self.engine
            .graphs_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| self.workspace_dir().join("graphs"))
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.engine
            .prompts_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| self.workspace_dir().join("prompts"))
    }

    /// Log directory, when run logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(
            log.log_dir
                .as_deref()
                .map(expand_home)
                .unwrap_or_else(|| self.workspace_dir().join("logs")),
        )
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
