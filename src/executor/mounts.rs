//! Capability mounts: tool-server config, skills, agent definitions, and the
//! instruction file, exposed read-only to the execution environment.
//!
//! Capability paths always sit under the vault root as the execution
//! environment sees it. On the host that is the vault directory itself; in a
//! container it is `[sandbox].vault_mount`.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::runtime::BindMount;
use super::{Capabilities, SandboxError};
use crate::credentials::SECRETS_DIR;
use crate::session::Workspace;
use crate::trust::TrustMode;

/// Vault-relative directory holding capability definitions.
pub const CAPABILITY_DIR: &str = ".warden";
/// Tool-server configuration file, relative to [`CAPABILITY_DIR`].
pub const MCP_CONFIG_FILE: &str = "mcp.json";
/// Skill definitions directory, relative to [`CAPABILITY_DIR`].
pub const SKILLS_DIR: &str = "skills";
/// Agent definitions directory, relative to [`CAPABILITY_DIR`].
pub const AGENTS_DIR: &str = "agents";
/// Instruction file, relative to [`CAPABILITY_DIR`].
pub const INSTRUCTIONS_FILE: &str = "INSTRUCTIONS.md";

/// Mounts and descriptors computed for one execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityMountSet {
    /// Read-only mounts. Empty for direct executions.
    pub mounts: Vec<BindMount>,
    /// Capability locations as seen by the agent.
    pub capabilities: Capabilities,
    /// Vault root as seen by the agent; also its working directory.
    pub vault_path: PathBuf,
}

/// Computes capability mounts for a workspace or the default vault.
#[derive(Debug, Clone)]
pub struct CapabilityMountBuilder {
    vault_mount: String,
    default_vault: PathBuf,
}

impl CapabilityMountBuilder {
    /// `vault_mount` is the in-container vault path; `default_vault` backs
    /// workspace-less sessions.
    pub fn new(vault_mount: impl Into<String>, default_vault: impl Into<PathBuf>) -> Self {
        Self {
            vault_mount: vault_mount.into(),
            default_vault: default_vault.into(),
        }
    }

    /// In-container vault path.
    pub fn vault_mount(&self) -> &str {
        &self.vault_mount
    }

    /// Host vault root for a workspace, or the default vault.
    pub fn vault_root<'a>(&'a self, workspace: Option<&'a Workspace>) -> &'a Path {
        workspace.map_or(self.default_vault.as_path(), |ws| ws.vault_root.as_path())
    }

    /// Container path masking the secrets directory of the mounted vault.
    pub fn secrets_mask_target(&self) -> String {
        join_container(&self.vault_mount, SECRETS_DIR)
    }

    /// Compute the capability mount set.
    ///
    /// Creates the capability, skills, agents and secrets directories on the
    /// host if missing. A sandboxed set mounts the whole capability directory
    /// read-only, so files that do not exist yet cannot be created from inside
    /// the container either.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::VaultUnavailable`] when a capability directory
    /// cannot be created.
    pub fn build(
        &self,
        workspace: Option<&Workspace>,
        trust: TrustMode,
    ) -> Result<CapabilityMountSet, SandboxError> {
        let vault_root = self.vault_root(workspace);
        let host_root = vault_root.join(CAPABILITY_DIR);
        let required = [
            host_root.join(SKILLS_DIR),
            host_root.join(AGENTS_DIR),
            vault_root.join(SECRETS_DIR),
        ];
        for path in required {
            std::fs::create_dir_all(&path).map_err(|e| SandboxError::VaultUnavailable {
                path: path.clone(),
                diagnostic: e.to_string(),
            })?;
        }

        let (vault_path, mounts) = match trust {
            TrustMode::Direct => (vault_root.to_path_buf(), Vec::new()),
            TrustMode::Sandboxed => {
                // The secrets mask is a tmpfs on top of this bind.
                let mounts = vec![BindMount {
                    source: host_root,
                    target: join_container(&self.vault_mount, CAPABILITY_DIR),
                    read_only: true,
                }];
                (PathBuf::from(&self.vault_mount), mounts)
            }
        };

        let seen_root = vault_path.join(CAPABILITY_DIR);
        let capabilities = Capabilities {
            mcp_config: seen_root.join(MCP_CONFIG_FILE),
            skills_dir: seen_root.join(SKILLS_DIR),
            agents_dir: seen_root.join(AGENTS_DIR),
            instructions_file: seen_root.join(INSTRUCTIONS_FILE),
        };

        debug!(
            trust = %trust,
            vault = %vault_path.display(),
            mounts = mounts.len(),
            "capability mounts computed"
        );
        Ok(CapabilityMountSet {
            mounts,
            capabilities,
            vault_path,
        })
    }
}

fn join_container(root: &str, relative: &str) -> String {
    format!("{}/{relative}", root.trim_end_matches('/'))
}
