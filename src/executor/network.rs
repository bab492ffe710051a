//! Shared bridge network for sandboxed containers that have networking on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use super::runtime::{ContainerRuntime, ProvisionOutcome, RuntimeError};
use super::SandboxError;

/// Idempotently provisions the bridge network.
///
/// After the first success, further calls return from process-local state
/// without touching the runtime. Concurrent first calls are serialized so the
/// runtime sees one create.
pub struct NetworkIsolationManager {
    runtime: Arc<dyn ContainerRuntime>,
    name: String,
    timeout: Duration,
    ready: AtomicBool,
    provisioning: Mutex<()>,
}

impl std::fmt::Debug for NetworkIsolationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkIsolationManager")
            .field("name", &self.name)
            .field("ready", &self.ready.load(Ordering::Acquire))
            .finish()
    }
}

impl NetworkIsolationManager {
    /// Manage the network `name` on `runtime`.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runtime,
            name: name.into(),
            timeout,
            ready: AtomicBool::new(false),
            provisioning: Mutex::new(()),
        }
    }

    /// Network name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the network is known to exist.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Make sure the network exists.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::RuntimeUnavailable`] when the daemon cannot be
    /// reached, [`SandboxError::Timeout`] when the call exceeds its budget, and
    /// [`SandboxError::NetworkProvisionFailed`] for any other failure.
    pub async fn ensure_network(&self) -> Result<(), SandboxError> {
        if self.is_ready() {
            return Ok(());
        }
        let _guard = self.provisioning.lock().await;
        if self.is_ready() {
            return Ok(());
        }

        let outcome = tokio::time::timeout(self.timeout, self.runtime.create_network(&self.name))
            .await
            .map_err(|_| SandboxError::Timeout {
                operation: format!("network create {}", self.name),
                seconds: self.timeout.as_secs(),
            })?;

        match outcome {
            Ok(ProvisionOutcome::Created) => {
                info!(network = %self.name, "bridge network created");
            }
            Ok(ProvisionOutcome::AlreadyExists) => {
                info!(network = %self.name, "bridge network already present");
            }
            Err(RuntimeError::Unavailable(diagnostic)) => {
                warn!(network = %self.name, %diagnostic, "runtime unavailable for network create");
                return Err(SandboxError::RuntimeUnavailable(diagnostic));
            }
            Err(RuntimeError::Timeout { operation, seconds }) => {
                return Err(SandboxError::Timeout { operation, seconds });
            }
            Err(e) => {
                warn!(network = %self.name, error = %e, "network provisioning failed");
                return Err(SandboxError::NetworkProvisionFailed {
                    network: self.name.clone(),
                    diagnostic: e.diagnostic(),
                });
            }
        }

        self.ready.store(true, Ordering::Release);
        Ok(())
    }
}
