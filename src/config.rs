//! Configuration for autopilot
//!
//! Configuration is stored in `.autopilot/config.toml` and controls the
//! agent command, orchestrator timing, retry thresholds, the sweeper and
//! logging. Every field has a default; a missing file yields defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

pub const CONFIG_FILE: &str = "config.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub sweeper: SweeperConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// How to launch the agent runtime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Executable to run
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments. Placeholders: {model}, {prompt}, {session_id},
    /// {project_id}, {workdir}
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Model used when the project doesn't set one
    #[serde(default = "default_model")]
    pub model: String,

    /// Working directory for the agent process
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Prompt for the initializer session. Placeholders: {project_id},
    /// {project_name}, {session_id}
    #[serde(default = "default_initializer_prompt")]
    pub initializer_prompt: String,

    /// Prompt for coding sessions, same placeholders
    #[serde(default = "default_coding_prompt")]
    pub coding_prompt: String,
}

fn default_command() -> String {
    "claude".to_string()
}

fn default_args() -> Vec<String> {
    [
        "--verbose",
        "--output-format",
        "stream-json",
        "--model",
        "{model}",
        "-p",
        "{prompt}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_model() -> String {
    "sonnet".to_string()
}

fn default_workdir() -> String {
    ".".to_string()
}

fn default_initializer_prompt() -> String {
    "You are initializing project {project_name} ({project_id}). Break the work into epics, \
     tasks and tests using `autopilot epic add`, `autopilot task add` and `autopilot test add`."
        .to_string()
}

fn default_coding_prompt() -> String {
    "You are working on project {project_name} ({project_id}). Run `autopilot next` to get \
     the next task, implement it, record results with `autopilot test result` and finish \
     with `autopilot task done`."
        .to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            model: default_model(),
            workdir: default_workdir(),
            initializer_prompt: default_initializer_prompt(),
            coding_prompt: default_coding_prompt(),
        }
    }
}

impl AgentConfig {
    /// Expand the argument template for one launch
    pub fn build_args(&self, model: &str, prompt: &str, session_id: &str, project_id: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{model}", model)
                    .replace("{prompt}", prompt)
                    .replace("{session_id}", session_id)
                    .replace("{project_id}", project_id)
                    .replace("{workdir}", &self.workdir)
            })
            .collect()
    }
}

/// Session sequencing and stop handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// Coding sessions per loop (0 = unlimited)
    #[serde(default)]
    pub max_iterations: u32,

    /// Hard timeout after an immediate stop before force-interrupting
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,

    /// Minimum spacing of persisted heartbeats
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// How often a running session re-reads the persisted stop flag
    #[serde(default = "default_stop_poll_secs")]
    pub stop_poll_secs: u64,
}

fn default_stop_grace_secs() -> u64 {
    30
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_stop_poll_secs() -> u64 {
    2
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            stop_grace_secs: default_stop_grace_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            stop_poll_secs: default_stop_poll_secs(),
        }
    }
}

impl OrchestratorConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_secs(self.stop_poll_secs.max(1))
    }
}

/// Retry/blocker thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Escalate once one failure signature is seen more than this often
    #[serde(default = "default_max_retries")]
    pub max_retries_per_signature: u32,

    /// Wall-clock budget per session (0 = none)
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,

    /// Regexes matched against raw error text; a match escalates at once
    #[serde(default = "default_critical_patterns")]
    pub critical_patterns: Vec<String>,

    /// Max length of a normalized error in a signature
    #[serde(default = "default_signature_max_len")]
    pub signature_max_len: usize,
}

fn default_max_retries() -> u32 {
    10
}

fn default_session_timeout_secs() -> u64 {
    3600
}

fn default_critical_patterns() -> Vec<String> {
    [
        r"(?i)invalid (x-)?api[ _-]?key",
        r"(?i)authentication[ _](failed|error)",
        r"(?i)unauthori[sz]ed",
        r"(?i)credit balance is too low",
        r"(?i)permission denied",
        r"(?i)operation not permitted",
        r"(?i)read-only file system",
        r"(?i)no space left on device",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_signature_max_len() -> usize {
    200
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries_per_signature: default_max_retries(),
            session_timeout_secs: default_session_timeout_secs(),
            critical_patterns: default_critical_patterns(),
            signature_max_len: default_signature_max_len(),
        }
    }
}

impl RetryConfig {
    pub fn session_timeout(&self) -> Option<Duration> {
        (self.session_timeout_secs > 0).then(|| Duration::from_secs(self.session_timeout_secs))
    }
}

/// Reconciliation sweeper
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweeperConfig {
    /// Liveness grace period: sessions silent for longer are candidates
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    /// Sweep before every initialize/run
    #[serde(default = "default_true")]
    pub sweep_on_startup: bool,
}

fn default_heartbeat_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            sweep_on_startup: true,
        }
    }
}

impl SweeperConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// Filter directive used when AUTOPILOT_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Load configuration from `<dir>/config.toml`.
    /// Returns default config if the file doesn't exist.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to `<dir>/config.toml`
    pub fn save(&self, dir: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(dir.join(CONFIG_FILE), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Write the default config file if it doesn't exist
    pub fn init(dir: &Path) -> Result<bool> {
        if dir.join(CONFIG_FILE).exists() {
            return Ok(false);
        }
        Self::default().save(dir)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.agent.command, "claude");
        assert_eq!(config.agent.model, "sonnet");
        assert_eq!(config.retry.max_retries_per_signature, 10);
        assert_eq!(config.orchestrator.max_iterations, 0);
        assert_eq!(config.sweeper.heartbeat_timeout_secs, 120);
        assert!(config.sweeper.sweep_on_startup);
        assert_eq!(config.log.format, LogFormat::Text);
    }

    #[test]
    fn test_load_missing_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();

        let mut config = Config::default();
        config.agent.model = "haiku".to_string();
        config.retry.max_retries_per_signature = 3;
        config.save(temp_dir.path()).unwrap();

        let loaded = Config::load(temp_dir.path()).unwrap();
        assert_eq!(loaded.agent.model, "haiku");
        assert_eq!(loaded.retry.max_retries_per_signature, 3);
    }

    #[test]
    fn test_init_config() {
        let temp_dir = TempDir::new().unwrap();

        let created = Config::init(temp_dir.path()).unwrap();
        assert!(created);

        // Second init should not overwrite
        let created = Config::init(temp_dir.path()).unwrap();
        assert!(!created);
    }

    #[test]
    fn test_build_args() {
        let config = Config::default();
        let args = config.agent.build_args("opus", "do something", "sess-1", "p1");
        assert!(args.contains(&"opus".to_string()));
        assert!(args.contains(&"do something".to_string()));
        assert!(!args.iter().any(|a| a.contains('{')));
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[agent]
command = "my-agent"
args = ["--session", "{session_id}"]

[retry]
session_timeout_secs = 0

[log]
format = "json"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.agent.command, "my-agent");
        assert_eq!(config.agent.model, "sonnet");
        assert_eq!(config.retry.session_timeout(), None);
        assert_eq!(config.retry.max_retries_per_signature, 10);
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_config_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(CONFIG_FILE), "[retry\nbroken").unwrap();
        let err = Config::load(temp_dir.path()).unwrap_err();
        assert_eq!(err.kind(), "Config");
    }
}
