//! Container runtime abstraction.
//!
//! The lifecycle manager describes a container once as a [`ContainerSpec`];
//! each backend renders that spec into its own invocation. Two backends ship:
//! [`docker::DockerRuntime`] (Docker Engine API) and [`cli::CliRuntime`]
//! (a docker-compatible binary such as `podman`).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::process::AgentProcess;
use crate::config::{RuntimeBackend, SandboxSettings};

pub mod cli;
pub mod docker;

/// Result of an idempotent provisioning call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The object was created by this call.
    Created,
    /// The object already existed.
    AlreadyExists,
}

/// Container runtime failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime daemon cannot be reached or refused access.
    #[error("container runtime unreachable: {0}")]
    Unavailable(String),
    /// The named object does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// The runtime rejected the operation.
    #[error("{operation} failed{}: {diagnostic}", exit_code.map(|c| format!(" (exit {c})")).unwrap_or_default())]
    Failed {
        /// Operation name.
        operation: String,
        /// Runtime diagnostic text.
        diagnostic: String,
        /// CLI exit code or HTTP status, when known.
        exit_code: Option<i32>,
    },
    /// The call exceeded its time budget.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// Operation name.
        operation: String,
        /// Budget in seconds.
        seconds: u64,
    },
}

impl RuntimeError {
    /// Runtime diagnostic text carried by the error.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Failed { diagnostic, .. } => diagnostic.clone(),
            other => other.to_string(),
        }
    }
}

/// Whether runtime diagnostic text reports a pre-existing object.
pub fn is_already_exists(diagnostic: &str) -> bool {
    diagnostic.to_ascii_lowercase().contains("already exists")
}

/// Whether runtime diagnostic text reports an unreachable or forbidden daemon.
pub fn is_daemon_unreachable(diagnostic: &str) -> bool {
    let lower = diagnostic.to_ascii_lowercase();
    [
        "cannot connect to the docker daemon",
        "is the docker daemon running",
        "permission denied",
        "connection refused",
        "unable to connect to podman",
    ]
    .iter()
    .any(|marker| lower.contains(marker))
}

/// Whether runtime diagnostic text reports a missing object.
pub fn is_not_found(diagnostic: &str) -> bool {
    let lower = diagnostic.to_ascii_lowercase();
    lower.contains("no such container")
        || lower.contains("no such object")
        || lower.contains("no such image")
        || lower.contains("not found")
}

/// A host path bound into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Host path.
    pub source: PathBuf,
    /// Container path.
    pub target: String,
    /// Mount read-only.
    pub read_only: bool,
}

impl BindMount {
    /// Render as a `source:target[:ro]` bind string.
    pub fn to_bind_string(&self) -> String {
        let mode = if self.read_only { ":ro" } else { "" };
        format!("{}:{}{mode}", self.source.display(), self.target)
    }
}

/// Full description of a managed container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Identity labels.
    pub labels: BTreeMap<String, String>,
    /// Memory limit in bytes.
    pub memory_bytes: i64,
    /// CPU limit in billionths of a core.
    pub nano_cpus: i64,
    /// Maximum process count.
    pub pids_limit: i64,
    /// Network to join; `None` disables networking.
    pub network: Option<String>,
    /// Bind mounts in order.
    pub binds: Vec<BindMount>,
    /// Named volumes as (volume, container path).
    pub volumes: Vec<(String, String)>,
    /// tmpfs mounts as container path to options.
    pub tmpfs: BTreeMap<String, String>,
    /// Capabilities to drop.
    pub cap_drop: Vec<String>,
    /// Security options.
    pub security_opt: Vec<String>,
    /// Mount the root filesystem read-only.
    pub read_only_rootfs: bool,
    /// User to run as.
    pub user: String,
    /// Working directory.
    pub working_dir: String,
    /// Keep-alive command.
    pub command: Vec<String>,
}

/// Observed state of a managed container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Container name without a leading slash.
    pub name: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Whether the container is running.
    pub running: bool,
}

impl ContainerInfo {
    /// Value of a label, if set.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// A command run inside an existing container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory inside the container.
    pub working_dir: String,
}

/// Directory inside managed containers holding exec pid files.
pub const EXEC_PID_DIR: &str = "/tmp";

/// Records the shell pid in `$0`, then becomes the command.
const TRACK_SCRIPT: &str = r#"echo $$ > "$0" && exec "$@""#;

/// Signals the process group recorded in `$0`, falling back to the pid.
const KILL_SCRIPT: &str = r#"pid=$(cat "$0" 2>/dev/null) || exit 0
rm -f "$0"
[ -n "$pid" ] || exit 0
kill -TERM -"$pid" 2>/dev/null || kill -TERM "$pid" 2>/dev/null
exit 0"#;

/// Reaches a process started by `exec` from a second `exec`.
///
/// Closing an attached exec does not signal the process inside the
/// container. The wrapped command writes its pid to a file under
/// [`EXEC_PID_DIR`]; [`ExecHandle::kill_argv`] reads it back and sends
/// `SIGTERM` to the process group. The agent command is started through
/// `timeout`, which leads its own group, so the agent's children go too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecHandle {
    pid_file: String,
}

impl Default for ExecHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecHandle {
    /// Handle with a fresh pid file name.
    pub fn new() -> Self {
        Self::at(format!(
            "{EXEC_PID_DIR}/warden-exec-{}.pid",
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// Handle over an explicit pid file path.
    pub fn at(pid_file: impl Into<String>) -> Self {
        Self {
            pid_file: pid_file.into(),
        }
    }

    /// Pid file path.
    pub fn pid_file(&self) -> &str {
        &self.pid_file
    }

    /// `argv` wrapped to record its pid before running.
    pub fn wrap(&self, argv: &[String]) -> Vec<String> {
        let mut wrapped = vec![
            "sh".to_owned(),
            "-c".to_owned(),
            TRACK_SCRIPT.to_owned(),
            self.pid_file.clone(),
        ];
        wrapped.extend(argv.iter().cloned());
        wrapped
    }

    /// Command that terminates the wrapped process and removes the pid file.
    pub fn kill_argv(&self) -> Vec<String> {
        vec![
            "sh".to_owned(),
            "-c".to_owned(),
            KILL_SCRIPT.to_owned(),
            self.pid_file.clone(),
        ]
    }

    /// `spec` with its argv wrapped.
    pub fn wrap_spec(&self, spec: &ExecSpec) -> ExecSpec {
        ExecSpec {
            argv: self.wrap(&spec.argv),
            ..spec.clone()
        }
    }
}

/// Operations the execution engine needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Backend name, for logs.
    fn backend(&self) -> &'static str;
    /// Check the daemon is reachable.
    async fn ping(&self) -> Result<(), RuntimeError>;
    /// Whether an image is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;
    /// Create a bridge network.
    async fn create_network(&self, name: &str) -> Result<ProvisionOutcome, RuntimeError>;
    /// Create a named volume.
    async fn create_volume(&self, name: &str) -> Result<ProvisionOutcome, RuntimeError>;
    /// Inspect a container; `None` when it does not exist.
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError>;
    /// List containers (running or not) carrying `label` (`key=value`).
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>, RuntimeError>;
    /// Create a container from a spec.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError>;
    /// Start a created or stopped container.
    async fn start_container(&self, name: &str) -> Result<(), RuntimeError>;
    /// Force-remove a container.
    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError>;
    /// Start a process inside a running container with attached stdio.
    ///
    /// Terminating the returned process signals the command inside the
    /// container, not only the attached connection.
    async fn exec(
        &self,
        container: &str,
        spec: &ExecSpec,
    ) -> Result<Box<dyn AgentProcess>, RuntimeError>;
}

/// Build the runtime backend selected in `[sandbox]`.
///
/// # Errors
///
/// Returns an error if the Docker client cannot be configured.
pub fn from_settings(settings: &SandboxSettings) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
    let timeout = std::time::Duration::from_secs(settings.runtime_timeout_secs.max(1));
    match settings.runtime {
        RuntimeBackend::Docker => Ok(Arc::new(docker::DockerRuntime::connect(timeout)?)),
        RuntimeBackend::Cli => Ok(Arc::new(cli::CliRuntime::new(
            settings.cli_binary.clone(),
            timeout,
        ))),
    }
}
