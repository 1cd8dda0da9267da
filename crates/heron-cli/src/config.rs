//! Configuration file management for heron.
//!
//! Provides a TOML-based config file at `~/.config/heron/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use heron_core::agent::{AgentProfile, AgentRegistry};
use heron_core::backend::{Engine, RetryPolicy};
use heron_core::dispatch::DispatcherConfig;
use heron_core::merge::MergeConfig;
use heron_core::plan::ValidationPolicy;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub dispatch: DispatchSection,
    pub validation: ValidationSection,
    pub agents: Vec<AgentSection>,
    pub backends: Vec<BackendSection>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_agent: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSection {
    /// Engines plans may name. Empty means every known engine.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_engines: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subtasks: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    pub key: String,
    pub system_prompt: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSection {
    pub name: String,
    /// Engine this backend serves. Backends without one form the default pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ConfigFile {
    /// What `heron init` writes.
    pub fn starter() -> Self {
        Self {
            dispatch: DispatchSection {
                retry_attempts: Some(2),
                retry_delay_ms: Some(1000),
                call_timeout_secs: Some(120),
                max_tokens: Some(4096),
                context_limit: Some(5),
                // Unset: every member of a group runs at once.
                max_parallel: None,
                default_agent: Some("coder".to_string()),
            },
            validation: ValidationSection {
                allowed_engines: Engine::ALL.iter().map(|e| e.to_string()).collect(),
                max_subtasks: Some(32),
            },
            agents: default_agents(),
            backends: vec![BackendSection {
                name: "echo".to_string(),
                engine: None,
                command: "cat".to_string(),
                args: Vec::new(),
            }],
        }
    }
}

fn default_agents() -> Vec<AgentSection> {
    vec![
        AgentSection {
            key: "coder".to_string(),
            system_prompt: "You are a careful software engineer. Complete the subtask and \
                            reply with code and a short explanation."
                .to_string(),
            description: "Writes and fixes code".to_string(),
        },
        AgentSection {
            key: "researcher".to_string(),
            system_prompt: "You investigate questions and report findings with sources."
                .to_string(),
            description: "Gathers and summarizes information".to_string(),
        },
        AgentSection {
            key: "writer".to_string(),
            system_prompt: "You write clear, concise prose for the stated audience.".to_string(),
            description: "Drafts documentation and reports".to_string(),
        },
    ]
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the heron config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/heron` or `~/.config/heron`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("heron");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("heron")
}

/// Return the path to the heron config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file at `path`.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line. `None` defers to the rest of the chain.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub retry_attempts: Option<u32>,
    pub max_parallel: Option<usize>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct HeronConfig {
    pub dispatch: DispatcherConfig,
    pub merge: MergeConfig,
    pub policy: ValidationPolicy,
    pub agents: Vec<AgentSection>,
    pub backends: Vec<BackendSection>,
}

impl HeronConfig {
    /// Resolve using the process environment and the config file at `path`.
    ///
    /// A missing file is not an error: built-in defaults apply. A file that
    /// exists but cannot be parsed is.
    pub fn resolve(path: &Path, cli: &CliOverrides) -> Result<Self> {
        let file = if path.exists() {
            Some(load_config(path)?)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            None
        };
        Self::resolve_with(file, cli, |key| std::env::var(key).ok())
    }

    /// Resolve the chain CLI flag > `HERON_*` env var > config file > default.
    ///
    /// - retry attempts: `--retry-attempts` > `HERON_RETRY_ATTEMPTS` > `dispatch.retry_attempts` > 2
    /// - max parallel: `--max-parallel` > `HERON_MAX_PARALLEL` > `dispatch.max_parallel` > group size
    /// - call timeout: `HERON_CALL_TIMEOUT_SECS` > `dispatch.call_timeout_secs` > 120
    /// - default agent: `HERON_DEFAULT_AGENT` > `dispatch.default_agent` > none
    pub fn resolve_with<F>(file: Option<ConfigFile>, cli: &CliOverrides, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = file.unwrap_or_default();
        let defaults = DispatcherConfig::default();

        let retry_attempts = match cli.retry_attempts {
            Some(n) => n,
            None => match parse_env::<u32>(&env, "HERON_RETRY_ATTEMPTS")? {
                Some(n) => n,
                None => file
                    .dispatch
                    .retry_attempts
                    .unwrap_or(defaults.retry.retry_attempts),
            },
        };
        let max_parallel = match cli.max_parallel {
            Some(n) => Some(n),
            None => parse_env::<usize>(&env, "HERON_MAX_PARALLEL")?.or(file.dispatch.max_parallel),
        };
        if max_parallel == Some(0) {
            bail!("max_parallel must be at least 1");
        }
        let call_timeout = match parse_env::<u64>(&env, "HERON_CALL_TIMEOUT_SECS")? {
            Some(secs) => Duration::from_secs(secs),
            None => file
                .dispatch
                .call_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.call_timeout),
        };
        let default_agent = env("HERON_DEFAULT_AGENT").or(file.dispatch.default_agent);

        let retry = RetryPolicy::new(
            retry_attempts,
            file.dispatch
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.retry_delay),
        );
        let max_tokens = file.dispatch.max_tokens.unwrap_or(defaults.max_tokens);

        let agents = if file.agents.is_empty() {
            default_agents()
        } else {
            file.agents
        };

        let engines: Vec<String> = if file.validation.allowed_engines.is_empty() {
            Engine::ALL.iter().map(|e| e.to_string()).collect()
        } else {
            file.validation.allowed_engines
        };
        let mut policy = ValidationPolicy::new(agents.iter().map(|a| a.key.clone()), engines);
        if let Some(max) = file.validation.max_subtasks {
            policy = policy.with_max_subtasks(max);
        }

        let dispatch = DispatcherConfig {
            retry,
            call_timeout,
            max_tokens,
            context_limit: file
                .dispatch
                .context_limit
                .unwrap_or(defaults.context_limit),
            max_parallel,
            default_agent,
            prefer_streaming: defaults.prefer_streaming,
        };
        let merge = MergeConfig {
            retry,
            call_timeout,
            max_tokens,
            ..MergeConfig::default()
        };

        Ok(Self {
            dispatch,
            merge,
            policy,
            agents,
            backends: file.backends,
        })
    }

    pub fn registry(&self) -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        for agent in &self.agents {
            registry.register(
                AgentProfile::new(agent.key.clone(), agent.system_prompt.clone())
                    .with_description(agent.description.clone()),
            );
        }
        registry
    }
}

fn parse_env<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{key} is not valid: {raw:?}")),
        None => Ok(None),
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
