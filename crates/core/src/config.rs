use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    #[serde(default = "default_reasoning_timeout_ms")]
    pub reasoning_timeout_ms: u64,
    #[serde(default = "default_invocation_timeout_ms")]
    pub invocation_timeout_ms: u64,
    #[serde(default = "default_invocation_retry_limit")]
    pub invocation_retry_limit: u32,
    #[serde(default = "default_reasoning_retry_limit")]
    pub reasoning_retry_limit: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Trailing log messages shown to the reasoner. 0 shows the whole log.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
}

fn default_max_cycles() -> u32 {
    20
}

fn default_reasoning_timeout_ms() -> u64 {
    60_000
}

fn default_invocation_timeout_ms() -> u64 {
    30_000
}

fn default_invocation_retry_limit() -> u32 {
    2
}

fn default_reasoning_retry_limit() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_context_window() -> usize {
    10
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_cycles: default_max_cycles(),
            reasoning_timeout_ms: default_reasoning_timeout_ms(),
            invocation_timeout_ms: default_invocation_timeout_ms(),
            invocation_retry_limit: default_invocation_retry_limit(),
            reasoning_retry_limit: default_reasoning_retry_limit(),
            retry_delay_ms: default_retry_delay_ms(),
            context_window: default_context_window(),
        }
    }
}

impl RuntimeConfig {
    pub fn reasoning_timeout(&self) -> Duration {
        Duration::from_millis(self.reasoning_timeout_ms)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    /// Backoff before retry `attempt` (1-based): base delay doubled per attempt, capped at 16x.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(4);
        Duration::from_millis(self.retry_delay_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointConfig {
    /// Connection string of the networked store. Absent or empty selects the embedded store.
    #[serde(default)]
    pub backend_connection: Option<String>,
    #[serde(default)]
    pub embedded_path: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Checkpoints kept per thread; older ones are pruned on save. 0 keeps all.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
}

fn default_max_connections() -> u32 {
    20
}

fn default_history_limit() -> u32 {
    50
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend_connection: None,
            embedded_path: None,
            max_connections: default_max_connections(),
            history_limit: default_history_limit(),
        }
    }
}

/// Which checkpoint backend the process runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointBackend {
    Embedded(PathBuf),
    Networked(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasonerConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_api_base() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_model() -> String {
    "llama-3.1-8b-instant".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key: String::new(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// How to launch the isolated data-owning process.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DataServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_instructions() -> String {
    "You are a helpful assistant. Use the available capabilities when they help \
     answer the user, and reply concisely."
        .to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub reasoner: ReasonerConfig,
    #[serde(default = "default_instructions")]
    pub instructions: String,
    #[serde(default)]
    pub data_server: Option<DataServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            checkpoint: CheckpointConfig::default(),
            reasoner: ReasonerConfig::default(),
            instructions: default_instructions(),
            data_server: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config file if present, then apply environment overrides.
    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        let mut config = if config_path.exists() {
            Self::load(&config_path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.runtime.max_cycles == 0 {
            return Err(Error::Config("runtime.maxCycles must be at least 1".to_string()));
        }
        if self.runtime.reasoning_timeout_ms == 0 || self.runtime.invocation_timeout_ms == 0 {
            return Err(Error::Config("runtime timeouts must be non-zero".to_string()));
        }
        if let Some(server) = &self.data_server {
            if server.command.trim().is_empty() {
                return Err(Error::Config("dataServer.command must not be empty".to_string()));
            }
        }
        Ok(())
    }

    /// `STRAND_DATABASE_URL` wins over a postgres `DATABASE_URL`; `STRAND_API_KEY` sets the reasoner key.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_url = lookup("STRAND_DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .or_else(|| lookup("DATABASE_URL").filter(|v| v.contains("postgres")));
        if let Some(url) = db_url {
            self.checkpoint.backend_connection = Some(url);
        }
        if let Some(key) = lookup("STRAND_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.reasoner.api_key = key;
        }
    }

    pub fn checkpoint_backend(&self, paths: &Paths) -> CheckpointBackend {
        match self.checkpoint.backend_connection.as_deref().map(str::trim) {
            Some(conn) if !conn.is_empty() => CheckpointBackend::Networked(conn.to_string()),
            _ => {
                let path = self
                    .checkpoint
                    .embedded_path
                    .as_deref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| paths.checkpoint_db());
                CheckpointBackend::Embedded(path)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.runtime.max_cycles, 20);
        assert_eq!(config.runtime.context_window, 10);
        assert!(config.checkpoint.backend_connection.is_none());
        assert_eq!(config.checkpoint.history_limit, 50);
        assert!(config.data_server.is_none());
    }

    #[test]
    fn test_camel_case_fields() {
        let config: Config = serde_json::from_str(
            r#"{"runtime": {"maxCycles": 3, "invocationRetryLimit": 0},
                "checkpoint": {"backendConnection": "postgres://db/strand"}}"#,
        )
        .unwrap();
        assert_eq!(config.runtime.max_cycles, 3);
        assert_eq!(config.runtime.invocation_retry_limit, 0);
        let paths = Paths::with_base(PathBuf::from("/tmp/strand"));
        assert_eq!(
            config.checkpoint_backend(&paths),
            CheckpointBackend::Networked("postgres://db/strand".to_string())
        );
    }

    #[test]
    fn test_embedded_when_connection_blank() {
        let mut config = Config::default();
        config.checkpoint.backend_connection = Some("  ".to_string());
        let paths = Paths::with_base(PathBuf::from("/tmp/strand"));
        assert_eq!(
            config.checkpoint_backend(&paths),
            CheckpointBackend::Embedded(PathBuf::from("/tmp/strand/checkpoints.db"))
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env_overrides(|key| match key {
            "DATABASE_URL" => Some("sqlite://local.db".to_string()),
            _ => None,
        });
        assert!(config.checkpoint.backend_connection.is_none());

        config.apply_env_overrides(|key| match key {
            "DATABASE_URL" => Some("postgres://u@h/db".to_string()),
            "STRAND_API_KEY" => Some("sk-test".to_string()),
            _ => None,
        });
        assert_eq!(config.checkpoint.backend_connection.as_deref(), Some("postgres://u@h/db"));
        assert_eq!(config.reasoner.api_key, "sk-test");
    }

    #[test]
    fn test_retry_delay_backoff() {
        let rt = RuntimeConfig {
            retry_delay_ms: 100,
            ..Default::default()
        };
        assert_eq!(rt.retry_delay(1), Duration::from_millis(100));
        assert_eq!(rt.retry_delay(3), Duration::from_millis(400));
        assert_eq!(rt.retry_delay(10), Duration::from_millis(1600));
    }

    #[test]
    fn test_zero_cycles_rejected() {
        let mut config = Config::default();
        config.runtime.max_cycles = 0;
        assert!(config.validate().is_err());
    }
}
