//! Named package-cache volumes shared by sandboxed containers.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::runtime::{ContainerRuntime, RuntimeError};
use super::SandboxError;

/// Cache volumes as (volume name, container path).
pub const CACHE_VOLUMES: &[(&str, &str)] = &[
    ("warden-npm-cache", "/home/agent/.npm"),
    ("warden-pip-cache", "/home/agent/.cache/pip"),
    ("warden-uv-cache", "/home/agent/.cache/uv"),
];

/// Creates the fixed set of cache volumes.
pub struct CacheVolumeManager {
    runtime: Arc<dyn ContainerRuntime>,
    timeout: Duration,
}

impl std::fmt::Debug for CacheVolumeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheVolumeManager")
            .field("backend", &self.runtime.backend())
            .finish()
    }
}

impl CacheVolumeManager {
    /// Manage cache volumes on `runtime`.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, timeout: Duration) -> Self {
        Self { runtime, timeout }
    }

    /// Volume mounts for a container spec.
    pub fn mounts() -> Vec<(String, String)> {
        CACHE_VOLUMES
            .iter()
            .map(|(name, target)| ((*name).to_owned(), (*target).to_owned()))
            .collect()
    }

    /// Create every cache volume that does not exist yet.
    ///
    /// Each volume is attempted even after an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::RuntimeUnavailable`] when the daemon is
    /// unreachable, otherwise [`SandboxError::VolumeProvisionFailed`] listing
    /// every volume that failed.
    pub async fn ensure_volumes(&self) -> Result<(), SandboxError> {
        let mut failures = Vec::new();
        for (name, _) in CACHE_VOLUMES {
            let result = tokio::time::timeout(self.timeout, self.runtime.create_volume(name)).await;
            match result {
                Ok(Ok(outcome)) => debug!(volume = name, ?outcome, "cache volume ready"),
                Ok(Err(RuntimeError::Unavailable(diagnostic))) => {
                    warn!(volume = name, %diagnostic, "runtime unavailable for volume create");
                    return Err(SandboxError::RuntimeUnavailable(diagnostic));
                }
                Ok(Err(e)) => {
                    warn!(volume = name, error = %e, "cache volume provisioning failed");
                    failures.push(format!("{name}: {}", e.diagnostic()));
                }
                Err(_) => {
                    warn!(volume = name, timeout_secs = self.timeout.as_secs(), "cache volume create timed out");
                    failures.push(format!("{name}: timed out after {}s", self.timeout.as_secs()));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::VolumeProvisionFailed { failures })
        }
    }
}
