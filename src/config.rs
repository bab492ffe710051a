//! Configuration loading and runtime paths.
//!
//! Loads `~/.warden/config.toml` (or `$WARDEN_CONFIG_PATH`). Precedence:
//! env vars > config file > defaults. A missing file yields defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::session::Workspace;
use crate::trust::TrustMode;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Container sandbox settings.
    pub sandbox: SandboxSettings,
    /// Agent process settings.
    pub agent: AgentSettings,
    /// Filesystem locations.
    pub paths: PathsConfig,
    /// Operator-declared workspaces, keyed by slug.
    pub workspaces: BTreeMap<String, WorkspaceConfig>,
}

/// Which container runtime backend to drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeBackend {
    /// Docker Engine API over the local socket.
    #[default]
    Docker,
    /// A docker-compatible CLI binary (`docker`, `podman`).
    Cli,
}

/// Container sandbox settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Image reference for sandbox containers.
    pub image: String,
    /// Memory limit in megabytes.
    pub memory_mb: u32,
    /// CPU core limit.
    pub cpu_cores: f64,
    /// Maximum process count inside a container.
    pub pids_limit: u32,
    /// Runtime backend.
    pub runtime: RuntimeBackend,
    /// CLI binary used by the `cli` backend.
    pub cli_binary: String,
    /// Shared bridge network joined by network-enabled containers.
    pub network_name: String,
    /// Whether the shared default container gets bridge networking.
    pub default_network_enabled: bool,
    /// Path at which the vault root is mounted inside containers.
    pub vault_mount: String,
    /// Upper bound for a single runtime call, in seconds.
    pub runtime_timeout_secs: u64,
    /// Upper bound for one execution, in seconds.
    pub execution_timeout_secs: u64,
    /// Interval between background reconciliation passes, in seconds.
    pub reconcile_interval_secs: u64,
    /// Exit status the runtime reports for out-of-memory kills.
    pub oom_exit_code: i32,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: "warden-sandbox:latest".to_owned(),
            memory_mb: 2048,
            cpu_cores: 2.0,
            pids_limit: 256,
            runtime: RuntimeBackend::Docker,
            cli_binary: "docker".to_owned(),
            network_name: "warden-net".to_owned(),
            default_network_enabled: false,
            vault_mount: "/vault".to_owned(),
            runtime_timeout_secs: 60,
            execution_timeout_secs: 1800,
            reconcile_interval_secs: 300,
            oom_exit_code: 137,
        }
    }
}

/// Agent process settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Host command (argv) for direct executions.
    pub command: Vec<String>,
    /// Command (argv) run inside sandbox containers.
    pub container_command: Vec<String>,
    /// Default system prompt.
    pub system_prompt: String,
    /// Model identifier passed to the agent.
    pub model: String,
    /// Tool-server descriptors advertised to the agent.
    pub tool_servers: Vec<String>,
    /// Trust designation for sessions with none, before workspace defaults.
    pub default_trust: TrustMode,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: vec!["warden-agent".to_owned()],
            container_command: vec!["warden-agent".to_owned()],
            system_prompt: "You are a helpful personal assistant.".to_owned(),
            model: "claude-sonnet-4-5".to_owned(),
            tool_servers: Vec::new(),
            default_trust: TrustMode::Sandboxed,
        }
    }
}

/// Filesystem locations. Empty values resolve under `~/.warden/`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Vault root for workspace-less sessions.
    pub default_vault: Option<PathBuf>,
    /// SQLite session-record database.
    pub session_db: Option<PathBuf>,
    /// Log directory.
    pub logs_dir: Option<PathBuf>,
}

/// One operator-declared workspace.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceConfig {
    /// Host directory holding the workspace vault.
    pub vault_root: PathBuf,
    /// Trust mode when a session carries none.
    #[serde(default = "default_workspace_trust")]
    pub default_trust: TrustMode,
    /// Whether sandboxed containers get bridge networking.
    #[serde(default)]
    pub network_enabled: bool,
}

fn default_workspace_trust() -> TrustMode {
    TrustMode::Sandboxed
}

impl Config {
    /// Load configuration with precedence env > file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> anyhow::Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let path = config_path_with(env)?;
        let mut config = load_config(&path)?;
        config.apply_overrides(env);
        Ok(config)
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver so tests need not mutate the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("WARDEN_SANDBOX_IMAGE") {
            self.sandbox.image = v;
        }
        if let Some(v) = env("WARDEN_MEMORY_MB") {
            match v.parse() {
                Ok(n) => self.sandbox.memory_mb = n,
                Err(_) => {
                    tracing::warn!(var = "WARDEN_MEMORY_MB", value = %v, "ignoring invalid env override");
                }
            }
        }
        if let Some(v) = env("WARDEN_CPU_CORES") {
            match v.parse() {
                Ok(n) => self.sandbox.cpu_cores = n,
                Err(_) => {
                    tracing::warn!(var = "WARDEN_CPU_CORES", value = %v, "ignoring invalid env override");
                }
            }
        }
        if let Some(v) = env("WARDEN_RUNTIME") {
            match v.as_str() {
                "docker" => self.sandbox.runtime = RuntimeBackend::Docker,
                "cli" => self.sandbox.runtime = RuntimeBackend::Cli,
                _ => {
                    tracing::warn!(var = "WARDEN_RUNTIME", value = %v, "ignoring invalid env override");
                }
            }
        }
        if let Some(v) = env("WARDEN_MODEL") {
            self.agent.model = v;
        }
        if let Some(v) = env("WARDEN_DEFAULT_VAULT") {
            self.paths.default_vault = Some(PathBuf::from(v));
        }
    }

    /// Look up an operator-declared workspace.
    pub fn workspace(&self, slug: &str) -> Option<Workspace> {
        self.workspaces.get(slug).map(|ws| Workspace {
            slug: slug.to_owned(),
            default_trust: ws.default_trust,
            network_enabled: ws.network_enabled,
            vault_root: ws.vault_root.clone(),
        })
    }
}

/// Load config from a TOML file; a missing file yields defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            tracing::debug!(path = %path.display(), "loading config from file");
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse config at {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            Err(anyhow::anyhow!("failed to read config at {}: {e}", path.display()))
        }
    }
}

/// Resolve the config file path: `$WARDEN_CONFIG_PATH` or `~/.warden/config.toml`.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<PathBuf> {
    if let Some(p) = env("WARDEN_CONFIG_PATH") {
        return Ok(PathBuf::from(p));
    }
    Ok(config_dir()?.join("config.toml"))
}

/// Resolve the default config directory (`~/.warden/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".warden"))
}

/// Resolved filesystem locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Root directory (`~/.warden/`).
    pub root: PathBuf,
    /// Vault for workspace-less sessions.
    pub default_vault: PathBuf,
    /// Session-record database.
    pub session_db: PathBuf,
    /// Log directory.
    pub logs_dir: PathBuf,
}

/// Resolve runtime paths, applying config overrides.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_paths(config: &PathsConfig) -> anyhow::Result<RuntimePaths> {
    let root = config_dir()?;
    Ok(RuntimePaths {
        default_vault: config
            .default_vault
            .clone()
            .unwrap_or_else(|| root.join("vault")),
        session_db: config
            .session_db
            .clone()
            .unwrap_or_else(|| root.join("sessions.db")),
        logs_dir: config
            .logs_dir
            .clone()
            .unwrap_or_else(|| root.join("logs")),
        root,
    })
}
