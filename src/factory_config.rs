//! Engine configuration read from `.factory/factory.toml`.
//!
//! Layered as file → environment. Every section and field is optional.
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! worker_pool_size = 4
//! capability_timeout_secs = 600
//! required_roles = ["PM", "SA", "PG", "QA"]
//! run_lease_secs = 30
//!
//! [retry]
//! max_retries = 3
//! backoff_factor = 2.0
//! initial_delay_seconds = 5
//! # delay_override_ms = 100
//!
//! [llm]
//! command = "claude"
//! args = ["--print", "--output-format", "text", "-p"]
//!
//! [plugins]
//! "builtin.roles" = "PM,SA"
//! docs_api_key = "..."
//! ```
//!
//! | Variable                 | Overrides                 |
//! |--------------------------|---------------------------|
//! | `FACTORY_RETRY_DELAY_MS` | `retry.delay_override_ms` |
//! | `FACTORY_LLM_CMD`        | `llm.command`             |

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::factory::models::{AgentRole, RetrySettings};
use crate::factory::retry::RetryPolicy;
use crate::factory::runner::EngineOptions;

pub const CONFIG_FILE: &str = "factory.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of walks and retry continuations running at once
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Per-capability time limit; 0 disables it
    #[serde(default = "default_capability_timeout_secs")]
    pub capability_timeout_secs: u64,
    /// Roles every workflow graph must contain
    #[serde(default = "default_required_roles")]
    pub required_roles: Vec<String>,
    /// Seconds a RUNNING run may go without a heartbeat before another
    /// process treats it as interrupted
    #[serde(default = "default_run_lease_secs")]
    pub run_lease_secs: u64,
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_capability_timeout_secs() -> u64 {
    600
}

fn default_run_lease_secs() -> u64 {
    30
}

fn default_required_roles() -> Vec<String> {
    AgentRole::required()
        .iter()
        .map(|role| role.to_string())
        .collect()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            capability_timeout_secs: default_capability_timeout_secs(),
            required_roles: default_required_roles(),
            run_lease_secs: default_run_lease_secs(),
        }
    }
}

/// Defaults stamped onto new tasks; graph nodes may override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_initial_delay_seconds")]
    pub initial_delay_seconds: u32,
    /// Replace every computed backoff with this delay (dev/test mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_override_ms: Option<u64>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_initial_delay_seconds() -> u32 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_factor: default_backoff_factor(),
            initial_delay_seconds: default_initial_delay_seconds(),
            delay_override_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Executable invoked for the built-in roles
    #[serde(default = "default_llm_command")]
    pub command: String,
    /// Arguments placed before the prompt
    #[serde(default = "default_llm_args")]
    pub args: Vec<String>,
}

fn default_llm_command() -> String {
    "claude".to_string()
}

fn default_llm_args() -> Vec<String> {
    ["--print", "--output-format", "text", "-p"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            command: default_llm_command(),
            args: default_llm_args(),
        }
    }
}

/// Root of `factory.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactoryToml {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    /// Free-form settings handed to every plugin's `initialize`
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub plugins: HashMap<String, String>,
}

impl FactoryToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse factory.toml")
    }

    /// Load `<factory_dir>/factory.toml`, or defaults when it does not exist.
    pub fn load_or_default(factory_dir: &Path) -> Result<Self> {
        let config_path = factory_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize factory.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// LLM command, with `FACTORY_LLM_CMD` taking precedence over the file.
    pub fn llm_command(&self) -> String {
        std::env::var("FACTORY_LLM_CMD")
            .ok()
            .filter(|cmd| !cmd.trim().is_empty())
            .unwrap_or_else(|| self.llm.command.clone())
    }

    /// Retry delay override, with `FACTORY_RETRY_DELAY_MS` taking precedence
    /// over the file.
    pub fn retry_delay_override(&self) -> Result<Option<Duration>> {
        let ms = match std::env::var("FACTORY_RETRY_DELAY_MS") {
            Ok(raw) => Some(
                raw.trim()
                    .parse::<u64>()
                    .with_context(|| format!("Invalid FACTORY_RETRY_DELAY_MS '{}'", raw))?,
            ),
            Err(_) => self.retry.delay_override_ms,
        };
        Ok(ms.map(Duration::from_millis))
    }

    pub fn required_roles(&self) -> Result<Vec<AgentRole>> {
        self.engine
            .required_roles
            .iter()
            .map(|raw| raw.parse::<AgentRole>().map_err(anyhow::Error::msg))
            .collect::<Result<Vec<_>>>()
            .context("Invalid engine.required_roles")
    }

    pub fn retry_defaults(&self) -> RetrySettings {
        RetrySettings {
            max_retries: self.retry.max_retries,
            backoff_factor: self.retry.backoff_factor,
            initial_delay_seconds: self.retry.initial_delay_seconds,
            retryable: true,
        }
    }

    /// Effective engine options after environment overrides.
    pub fn engine_options(&self) -> Result<EngineOptions> {
        let capability_timeout = match self.engine.capability_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Ok(EngineOptions {
            worker_pool_size: self.engine.worker_pool_size,
            capability_timeout,
            required_roles: self.required_roles()?,
            retry_defaults: self.retry_defaults(),
            retry_policy: RetryPolicy {
                delay_override: self.retry_delay_override()?,
            },
            run_lease: Duration::from_secs(self.engine.run_lease_secs),
        })
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.engine.worker_pool_size == 0 {
            warnings.push("engine.worker_pool_size is 0; one worker will be used".to_string());
        }
        if self.engine.run_lease_secs == 0 {
            warnings.push(
                "engine.run_lease_secs is 0; runs of other processes will be failed as interrupted"
                    .to_string(),
            );
        }
        for raw in &self.engine.required_roles {
            if let Err(e) = raw.parse::<AgentRole>() {
                warnings.push(format!("engine.required_roles: {}", e));
            }
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            warnings.push(format!(
                "retry.backoff_factor {} should be a finite number >= 1.0",
                self.retry.backoff_factor
            ));
        }
        if self.retry.max_retries > 10 {
            warnings.push(format!(
                "retry.max_retries {} is unusually high",
                self.retry.max_retries
            ));
        }
        if self.llm.command.trim().is_empty() {
            warnings.push("llm.command is empty".to_string());
        }

        warnings
    }
}
