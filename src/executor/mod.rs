//! Sandboxed execution engine.
//!
//! [`router::ExecutionRouter`] is the entry point: it resolves the trust mode
//! for a session, materialises the execution environment (host process or
//! managed container), applies the credential gate, and turns the agent's
//! output into a terminated [`events::ExecutionStream`].

use std::path::PathBuf;

use serde::Serialize;

use crate::config::SandboxSettings;
use crate::credentials::{CredentialError, CredentialSet};
use crate::session::Workspace;
use crate::trust::{TrustError, TrustMode};

pub mod events;
pub mod lifecycle;
pub mod mounts;
pub mod network;
pub mod process;
pub mod redactor;
pub mod router;
pub mod runtime;
pub mod volumes;

/// Value of the `app` label on every managed container.
pub const APP_LABEL_VALUE: &str = "warden";

/// Per-container resource limits.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// Memory limit in megabytes.
    pub memory_mb: u32,
    /// CPU core limit.
    pub cpu_cores: f64,
    /// Maximum process count.
    pub pids_limit: u32,
}

impl ResourceLimits {
    /// Limits configured in `[sandbox]`.
    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self {
            memory_mb: settings.memory_mb,
            cpu_cores: settings.cpu_cores,
            pids_limit: settings.pids_limit,
        }
    }

    /// Memory limit in bytes.
    pub fn memory_bytes(&self) -> i64 {
        i64::from(self.memory_mb)
            .saturating_mul(1024)
            .saturating_mul(1024)
    }

    /// CPU limit in billionths of a core.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::InvalidRequest`] for a non-positive or
    /// non-finite core count.
    pub fn nano_cpus(&self) -> Result<i64, SandboxError> {
        let cores = self.cpu_cores;
        if !cores.is_finite() || cores <= 0.0 {
            return Err(SandboxError::InvalidRequest(
                "cpu_cores must be a positive finite number".to_owned(),
            ));
        }

        let rendered = format!("{cores:.9}");
        let (whole_raw, fraction_raw) = rendered.split_once('.').unwrap_or((&rendered, "0"));
        let whole = whole_raw
            .parse::<i64>()
            .map_err(|e| SandboxError::InvalidRequest(format!("cpu_cores: {e}")))?;
        let mut fraction = fraction_raw.to_owned();
        fraction.truncate(9);
        while fraction.len() < 9 {
            fraction.push('0');
        }
        let fraction = fraction
            .parse::<i64>()
            .map_err(|e| SandboxError::InvalidRequest(format!("cpu_cores: {e}")))?;

        whole
            .checked_mul(1_000_000_000)
            .and_then(|value| value.checked_add(fraction))
            .filter(|nanos| *nanos > 0)
            .ok_or_else(|| SandboxError::InvalidRequest("cpu_cores out of range".to_owned()))
    }
}

/// Resolved parameters for one execution. Built fresh per execution.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    /// Workspace scope; `None` selects the shared default container.
    pub workspace: Option<Workspace>,
    /// Resolved trust mode.
    pub trust: TrustMode,
    /// Whether the container joins the bridge network.
    pub network_enabled: bool,
    /// Resource limits.
    pub limits: ResourceLimits,
    /// Image reference.
    pub image: String,
}

impl SandboxConfig {
    /// Resolve execution parameters from settings and the session's scope.
    pub fn resolve(
        settings: &SandboxSettings,
        workspace: Option<&Workspace>,
        trust: TrustMode,
    ) -> Self {
        Self {
            workspace: workspace.cloned(),
            trust,
            network_enabled: workspace.map_or(settings.default_network_enabled, |ws| {
                ws.network_enabled
            }),
            limits: ResourceLimits::from_settings(settings),
            image: settings.image.clone(),
        }
    }

    /// Workspace slug, if scoped to a workspace.
    pub fn slug(&self) -> Option<&str> {
        self.workspace.as_ref().map(|ws| ws.slug.as_str())
    }
}

/// Capability descriptors as seen from inside the execution environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Tool-server configuration file.
    pub mcp_config: PathBuf,
    /// Skill definitions directory.
    pub skills_dir: PathBuf,
    /// Agent definitions directory.
    pub agents_dir: PathBuf,
    /// Instruction file.
    pub instructions_file: PathBuf,
}

/// Payload written once to the agent's input channel.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPayload {
    /// User message.
    pub message: String,
    /// System prompt.
    pub system_prompt: String,
    /// Prior execution to continue.
    pub resume_session_id: Option<String>,
    /// Capability locations.
    pub capabilities: Capabilities,
    /// Secrets the gate permitted; may be empty.
    pub credentials: CredentialSet,
}

/// Errors produced by the execution engine.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The trust designation is not recognised.
    #[error(transparent)]
    InvalidTrustValue(#[from] TrustError),
    /// The request failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The container runtime cannot be reached.
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    /// The sandbox image is not present locally.
    #[error(
        "sandbox image '{image}' is not available; pull or build it (e.g. `docker pull {image}`) or point [sandbox].image at an existing image"
    )]
    ImageMissing {
        /// Image reference.
        image: String,
    },
    /// The execution was killed for exceeding its memory limit.
    #[error("container '{container}' ran out of memory; it has been discarded and the next request gets a fresh one")]
    ResourceExhausted {
        /// Container that hit the limit.
        container: String,
    },
    /// The bridge network could not be provisioned.
    #[error("failed to provision network '{network}': {diagnostic}")]
    NetworkProvisionFailed {
        /// Network name.
        network: String,
        /// Runtime diagnostic text.
        diagnostic: String,
    },
    /// One or more cache volumes could not be provisioned.
    #[error("failed to provision cache volumes: {}", failures.join("; "))]
    VolumeProvisionFailed {
        /// One entry per failed volume.
        failures: Vec<String>,
    },
    /// Container creation or start failed.
    #[error("failed to create container '{name}': {diagnostic}")]
    ContainerCreateFailed {
        /// Container name.
        name: String,
        /// Runtime diagnostic text.
        diagnostic: String,
    },
    /// Container removal failed.
    #[error("failed to remove container '{name}': {diagnostic}")]
    ContainerRemoveFailed {
        /// Container name.
        name: String,
        /// Runtime diagnostic text.
        diagnostic: String,
    },
    /// Removal refused because sessions still reference the container.
    #[error("container '{name}' still has {active} active session(s)")]
    ContainerBusy {
        /// Container name.
        name: String,
        /// Active session count.
        active: u64,
    },
    /// The agent's channel closed before it reported an exit.
    #[error("execution transport closed: {0}")]
    TransportClosed(String),
    /// An operation exceeded its time budget.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// What timed out.
        operation: String,
        /// Budget in seconds.
        seconds: u64,
    },
    /// The agent process could not be started.
    #[error("failed to start agent process: {0}")]
    Spawn(String),
    /// Loading credentials for a trusted session failed.
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    /// The session store could not be read or written.
    #[error("session store error: {0}")]
    SessionStore(String),
    /// A vault-side capability directory could not be prepared.
    #[error("vault path '{}' is not usable: {diagnostic}", path.display())]
    VaultUnavailable {
        /// Host path.
        path: PathBuf,
        /// Underlying error text.
        diagnostic: String,
    },
}

impl SandboxError {
    /// Stable machine-readable code used in `typed_error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTrustValue(_) => "invalid_trust_value",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RuntimeUnavailable(_) => "runtime_unavailable",
            Self::ImageMissing { .. } => "image_missing",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::NetworkProvisionFailed { .. } => "network_provision_failed",
            Self::VolumeProvisionFailed { .. } => "volume_provision_failed",
            Self::ContainerCreateFailed { .. } => "container_create_failed",
            Self::ContainerRemoveFailed { .. } => "container_remove_failed",
            Self::ContainerBusy { .. } => "container_busy",
            Self::TransportClosed(_) => "transport_closed",
            Self::Timeout { .. } => "timeout",
            Self::Spawn(_) => "spawn_failed",
            Self::Credentials(_) => "credentials_unavailable",
            Self::SessionStore(_) => "session_store",
            Self::VaultUnavailable { .. } => "vault_unavailable",
        }
    }

    /// Short human-readable title used in `typed_error` events.
    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidTrustValue(_) => "Invalid trust value",
            Self::InvalidRequest(_) => "Invalid request",
            Self::RuntimeUnavailable(_) => "Container runtime unavailable",
            Self::ImageMissing { .. } => "Sandbox image missing",
            Self::ResourceExhausted { .. } => "Out of memory",
            Self::NetworkProvisionFailed { .. } => "Network setup failed",
            Self::VolumeProvisionFailed { .. } => "Cache volume setup failed",
            Self::ContainerCreateFailed { .. } => "Container creation failed",
            Self::ContainerRemoveFailed { .. } => "Container removal failed",
            Self::ContainerBusy { .. } => "Container busy",
            Self::TransportClosed(_) => "Agent stopped unexpectedly",
            Self::Timeout { .. } => "Timed out",
            Self::Spawn(_) => "Agent failed to start",
            Self::Credentials(_) => "Credentials unavailable",
            Self::SessionStore(_) => "Session store error",
            Self::VaultUnavailable { .. } => "Vault unavailable",
        }
    }

    /// Whether the error was raised by input validation.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidTrustValue(_) | Self::InvalidRequest(_))
    }
}
