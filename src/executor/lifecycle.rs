//! Managed container lifecycle: lazy creation, reuse, drift detection,
//! reconciliation, and teardown.
//!
//! A container's `config_hash` label is the only record of the configuration
//! it was created with. Nothing destructive happens to a container while the
//! session store reports an active session on it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sha2::{Digest, Sha256};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::mounts::CapabilityMountBuilder;
use super::network::NetworkIsolationManager;
use super::runtime::{BindMount, ContainerInfo, ContainerRuntime, ContainerSpec, RuntimeError};
use super::volumes::CacheVolumeManager;
use super::{ResourceLimits, SandboxConfig, SandboxError, APP_LABEL_VALUE};
use crate::config::SandboxSettings;
use crate::session::{SessionStore, Workspace};
use crate::trust::TrustMode;

/// Label naming the owning application.
pub const APP_LABEL: &str = "app";
/// Label carrying the workspace slug of a workspace container.
pub const WORKSPACE_LABEL: &str = "workspace";
/// Label marking the shared default container.
pub const TYPE_LABEL: &str = "type";
/// Value of [`TYPE_LABEL`] on the shared default container.
pub const DEFAULT_TYPE: &str = "default";
/// Label carrying the configuration fingerprint.
pub const HASH_LABEL: &str = "config_hash";
/// Label recording whether the container joined the bridge network.
pub const NETWORK_LABEL: &str = "network";
/// Name of the shared default container.
pub const DEFAULT_CONTAINER_NAME: &str = "warden-default";
/// Length of the hex fingerprint.
pub const CONFIG_HASH_LEN: usize = 12;

/// In-container user the agent runs as.
const SANDBOX_USER: &str = "agent";

/// Deterministic container name for a workspace, or the default container.
pub fn container_name(slug: Option<&str>) -> String {
    match slug {
        Some(slug) => format!("warden-ws-{slug}"),
        None => DEFAULT_CONTAINER_NAME.to_owned(),
    }
}

/// Fingerprint of the inputs that define container identity.
pub fn config_hash(image: &str, limits: &ResourceLimits) -> String {
    let canonical = format!(
        "image={image}\nmemory_mb={}\ncpu_cores={}\npids_limit={}",
        limits.memory_mb, limits.cpu_cores, limits.pids_limit
    );
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest).chars().take(CONFIG_HASH_LEN).collect()
}

fn network_label(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

/// Lifecycle state of a managed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// No container exists.
    Absent,
    /// Being created.
    Creating,
    /// Running and matching current configuration.
    Running,
    /// Running but no longer matching current configuration.
    Stale,
    /// Removed by teardown or reconciliation.
    Removed,
}

/// A container owned by the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    /// Container name.
    pub name: String,
    /// Identity labels.
    pub labels: BTreeMap<String, String>,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Whether this call created the container.
    pub created: bool,
}

impl ManagedContainer {
    /// The container's `config_hash` label.
    pub fn config_hash(&self) -> Option<&str> {
        self.labels.get(HASH_LABEL).map(String::as_str)
    }
}

/// A ready container plus the slug lock it was ensured under.
///
/// Hold it until the session has been registered, so reconciliation cannot
/// remove the container in between.
#[derive(Debug)]
pub struct ContainerLease {
    /// The ready container.
    pub container: ManagedContainer,
    _slug: SlugGuard,
}

/// Exclusive hold on one key of a [`SlugLocks`] table.
///
/// Dropping it unlocks the key and removes the entry unless another task
/// holds or waits on it.
#[derive(Debug)]
pub struct SlugGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<SlugLocks>,
}

impl Drop for SlugGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(&self.key);
    }
}

/// Per-container-name async locks.
///
/// Entries are created on first use and dropped once nobody holds or waits
/// on them, so the table tracks live work rather than every slug ever seen.
#[derive(Debug, Default)]
pub struct SlugLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SlugLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.map().entry(key.to_owned()).or_default());
        lock.lock_owned().await
    }

    /// Wait for exclusive access to `key`; the entry is released on drop.
    pub async fn lock(self: &Arc<Self>, key: &str) -> SlugGuard {
        let guard = self.acquire(key).await;
        SlugGuard {
            key: key.to_owned(),
            guard: Some(guard),
            locks: Arc::clone(self),
        }
    }

    /// Drop the entry for `key` if nobody holds or waits on it.
    pub fn release(&self, key: &str) {
        let mut map = self.map();
        if map.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(key);
        }
    }

    /// Drop every idle entry. Returns the number removed.
    pub fn prune(&self) -> usize {
        let mut map = self.map();
        let before = map.len();
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(map.len())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Containers matching current configuration.
    pub kept: Vec<String>,
    /// Stale containers removed.
    pub removed: Vec<String>,
    /// Stale containers left in place because sessions are active.
    pub skipped: Vec<String>,
    /// Removals that failed, with the runtime diagnostic.
    pub failed: Vec<(String, String)>,
}

/// Status line for one managed container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    /// Container name.
    pub name: String,
    /// Workspace slug or `default`.
    pub scope: String,
    /// Whether it is running.
    pub running: bool,
    /// Current or stale with respect to configuration.
    pub state: ContainerState,
}

/// Creates, reuses, reconciles, and removes managed containers.
pub struct ContainerLifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    sessions: Arc<dyn SessionStore>,
    network: Arc<NetworkIsolationManager>,
    volumes: Arc<CacheVolumeManager>,
    mounts: CapabilityMountBuilder,
    settings: SandboxSettings,
    locks: Arc<SlugLocks>,
    condemned: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for ContainerLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerLifecycleManager")
            .field("backend", &self.runtime.backend())
            .field("image", &self.settings.image)
            .field("locks", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl ContainerLifecycleManager {
    /// Build a manager over its collaborators.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        sessions: Arc<dyn SessionStore>,
        network: Arc<NetworkIsolationManager>,
        volumes: Arc<CacheVolumeManager>,
        mounts: CapabilityMountBuilder,
        settings: SandboxSettings,
        locks: Arc<SlugLocks>,
    ) -> Self {
        Self {
            runtime,
            sessions,
            network,
            volumes,
            mounts,
            settings,
            locks,
            condemned: Mutex::new(HashSet::new()),
        }
    }

    /// Runtime backend in use.
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Capability mount builder.
    pub fn mounts(&self) -> &CapabilityMountBuilder {
        &self.mounts
    }

    /// Lock table shared with callers.
    pub fn locks(&self) -> &Arc<SlugLocks> {
        &self.locks
    }

    /// Fingerprint of the current sandbox configuration.
    pub fn current_hash(&self) -> String {
        config_hash(
            &self.settings.image,
            &ResourceLimits::from_settings(&self.settings),
        )
    }

    fn condemned(&self) -> MutexGuard<'_, HashSet<String>> {
        self.condemned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_condemned(&self, name: &str) -> bool {
        self.condemned().contains(name)
    }

    /// Container for a workspace, reused when current and recreated when stale.
    ///
    /// # Errors
    ///
    /// Returns a named failure when the runtime is unreachable, the image is
    /// missing, or provisioning, creation, or removal fails.
    pub async fn ensure_workspace_container(
        &self,
        workspace: &Workspace,
        config: &SandboxConfig,
    ) -> Result<ManagedContainer, SandboxError> {
        let lease = self.lease(Some(workspace), config).await?;
        Ok(lease.container)
    }

    /// The shared default container, same contract as workspace containers.
    ///
    /// # Errors
    ///
    /// See [`Self::ensure_workspace_container`].
    pub async fn ensure_default_container(
        &self,
        config: &SandboxConfig,
    ) -> Result<ManagedContainer, SandboxError> {
        let lease = self.lease(None, config).await?;
        Ok(lease.container)
    }

    /// Ensure the container for a scope and keep its slug lock.
    ///
    /// # Errors
    ///
    /// See [`Self::ensure_workspace_container`].
    pub async fn lease(
        &self,
        workspace: Option<&Workspace>,
        config: &SandboxConfig,
    ) -> Result<ContainerLease, SandboxError> {
        let name = container_name(workspace.map(|ws| ws.slug.as_str()));
        let slug = self.locks.lock(&name).await;
        let container = self.ensure_locked(&name, workspace, config).await?;
        Ok(ContainerLease {
            container,
            _slug: slug,
        })
    }

    async fn ensure_locked(
        &self,
        name: &str,
        workspace: Option<&Workspace>,
        config: &SandboxConfig,
    ) -> Result<ManagedContainer, SandboxError> {
        let desired_hash = config_hash(&config.image, &config.limits);
        let desired_network = network_label(config.network_enabled);

        let existing = self
            .runtime
            .inspect_container(name)
            .await
            .map_err(|e| create_failure(name, e))?;

        if let Some(info) = existing {
            let current = info.label(HASH_LABEL) == Some(desired_hash.as_str())
                && info.label(NETWORK_LABEL) == Some(desired_network)
                && !self.is_condemned(name);
            if current {
                return self.reuse(info, ContainerState::Running).await;
            }

            let active = self.active_sessions(name).await?;
            if active > 0 {
                warn!(
                    container = %name,
                    active,
                    "container is stale but has active sessions; reusing until they finish"
                );
                return self.reuse(info, ContainerState::Stale).await;
            }

            info!(
                container = %name,
                found_hash = info.label(HASH_LABEL).unwrap_or("none"),
                desired_hash = %desired_hash,
                "replacing stale container"
            );
            self.runtime
                .remove_container(name)
                .await
                .map_err(|e| remove_failure(name, e))?;
            self.condemned().remove(name);
        }

        self.create(name, workspace, config, desired_hash).await
    }

    async fn reuse(
        &self,
        info: ContainerInfo,
        state: ContainerState,
    ) -> Result<ManagedContainer, SandboxError> {
        if !info.running {
            debug!(container = %info.name, "starting stopped container");
            self.runtime
                .start_container(&info.name)
                .await
                .map_err(|e| create_failure(&info.name, e))?;
        }
        Ok(ManagedContainer {
            name: info.name,
            labels: info.labels,
            state,
            created: false,
        })
    }

    async fn create(
        &self,
        name: &str,
        workspace: Option<&Workspace>,
        config: &SandboxConfig,
        hash: String,
    ) -> Result<ManagedContainer, SandboxError> {
        debug!(container = %name, state = ?ContainerState::Creating, "creating container");
        let image_present = self
            .runtime
            .image_exists(&config.image)
            .await
            .map_err(|e| create_failure(name, e))?;
        if !image_present {
            return Err(SandboxError::ImageMissing {
                image: config.image.clone(),
            });
        }

        if config.network_enabled {
            self.network.ensure_network().await?;
        }
        self.volumes.ensure_volumes().await?;

        let spec = self.container_spec(name, workspace, config, hash)?;
        self.runtime
            .create_container(&spec)
            .await
            .map_err(|e| create_failure(name, e))?;

        if let Err(e) = self.runtime.start_container(name).await {
            if let Err(cleanup) = self.runtime.remove_container(name).await {
                warn!(container = %name, error = %cleanup, "failed to clean up unstarted container");
            }
            return Err(create_failure(name, e));
        }

        self.condemned().remove(name);
        info!(
            container = %name,
            workspace = workspace.map(|ws| ws.slug.as_str()),
            network = config.network_enabled,
            config_hash = %spec.labels.get(HASH_LABEL).map_or("", String::as_str),
            "container created"
        );
        Ok(ManagedContainer {
            name: name.to_owned(),
            labels: spec.labels,
            state: ContainerState::Running,
            created: true,
        })
    }

    /// The single description of a managed container used by every path.
    ///
    /// # Errors
    ///
    /// Returns an error when capability directories cannot be prepared or the
    /// CPU limit is invalid.
    pub fn container_spec(
        &self,
        name: &str,
        workspace: Option<&Workspace>,
        config: &SandboxConfig,
        hash: String,
    ) -> Result<ContainerSpec, SandboxError> {
        let capability_set = self.mounts.build(workspace, TrustMode::Sandboxed)?;

        let mut labels = BTreeMap::new();
        labels.insert(APP_LABEL.to_owned(), APP_LABEL_VALUE.to_owned());
        match workspace {
            Some(ws) => labels.insert(WORKSPACE_LABEL.to_owned(), ws.slug.clone()),
            None => labels.insert(TYPE_LABEL.to_owned(), DEFAULT_TYPE.to_owned()),
        };
        labels.insert(HASH_LABEL.to_owned(), hash);
        labels.insert(
            NETWORK_LABEL.to_owned(),
            network_label(config.network_enabled).to_owned(),
        );

        let mut binds = vec![BindMount {
            source: self.mounts.vault_root(workspace).to_path_buf(),
            target: self.mounts.vault_mount().to_owned(),
            read_only: false,
        }];
        binds.extend(capability_set.mounts);

        let mut tmpfs = BTreeMap::new();
        tmpfs.insert("/tmp".to_owned(), "rw,size=512m".to_owned());
        tmpfs.insert(self.mounts.secrets_mask_target(), "ro,size=64k".to_owned());

        Ok(ContainerSpec {
            name: name.to_owned(),
            image: config.image.clone(),
            labels,
            memory_bytes: config.limits.memory_bytes(),
            nano_cpus: config.limits.nano_cpus()?,
            pids_limit: i64::from(config.limits.pids_limit),
            network: config
                .network_enabled
                .then(|| self.network.name().to_owned()),
            binds,
            volumes: CacheVolumeManager::mounts(),
            tmpfs,
            cap_drop: vec!["ALL".to_owned()],
            security_opt: vec!["no-new-privileges:true".to_owned()],
            read_only_rootfs: true,
            user: SANDBOX_USER.to_owned(),
            working_dir: self.mounts.vault_mount().to_owned(),
            command: vec!["sleep".to_owned(), "infinity".to_owned()],
        })
    }

    async fn active_sessions(&self, name: &str) -> Result<u64, SandboxError> {
        self.sessions
            .active_count(name)
            .await
            .map_err(|e| SandboxError::SessionStore(format!("{e:#}")))
    }

    async fn managed(&self) -> Result<Vec<ContainerInfo>, SandboxError> {
        self.runtime
            .list_containers(&format!("{APP_LABEL}={APP_LABEL_VALUE}"))
            .await
            .map_err(|e| match e {
                RuntimeError::Unavailable(diagnostic) => SandboxError::RuntimeUnavailable(diagnostic),
                RuntimeError::Timeout { operation, seconds } => {
                    SandboxError::Timeout { operation, seconds }
                }
                other => SandboxError::RuntimeUnavailable(other.diagnostic()),
            })
    }

    /// Remove stale managed containers that no session is using.
    ///
    /// Stale containers with active sessions are skipped and retried on the
    /// next pass. A failed removal is reported and does not stop the pass.
    ///
    /// # Errors
    ///
    /// Returns an error when containers cannot be listed or the session store
    /// cannot be read.
    pub async fn reconcile(&self) -> Result<ReconcileReport, SandboxError> {
        let desired = self.current_hash();
        let mut report = ReconcileReport::default();

        for info in self.managed().await? {
            let name = info.name.clone();
            let stale = info.label(HASH_LABEL) != Some(desired.as_str()) || self.is_condemned(&name);
            if !stale {
                report.kept.push(name);
                continue;
            }

            let _slug = self.locks.lock(&name).await;
            let active = self.active_sessions(&name).await?;
            if active > 0 {
                info!(container = %name, active, "stale container has active sessions; retrying next pass");
                report.skipped.push(name);
                continue;
            }

            match self.runtime.remove_container(&name).await {
                Ok(()) => {
                    info!(
                        container = %name,
                        found_hash = info.label(HASH_LABEL).unwrap_or("none"),
                        desired_hash = %desired,
                        "removed stale container"
                    );
                    self.condemned().remove(&name);
                    report.removed.push(name.clone());
                }
                Err(e) => {
                    warn!(container = %name, error = %e, "failed to remove stale container");
                    report.failed.push((name.clone(), e.diagnostic()));
                }
            }
        }

        let pruned = self.locks.prune();
        info!(
            kept = report.kept.len(),
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            pruned_locks = pruned,
            "reconciliation pass complete"
        );
        Ok(report)
    }

    /// Explicitly remove a workspace container, or the default container.
    ///
    /// Returns [`ContainerState::Absent`] when there was nothing to remove.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::ContainerBusy`] while sessions are active, or a
    /// named failure when removal fails.
    pub async fn teardown(&self, slug: Option<&str>) -> Result<ContainerState, SandboxError> {
        let name = container_name(slug);
        let _slug = self.locks.lock(&name).await;

        let active = self.active_sessions(&name).await?;
        if active > 0 {
            return Err(SandboxError::ContainerBusy { name, active });
        }

        let existing = self
            .runtime
            .inspect_container(&name)
            .await
            .map_err(|e| remove_failure(&name, e))?;
        let state = if existing.is_some() {
            self.runtime
                .remove_container(&name)
                .await
                .map_err(|e| remove_failure(&name, e))?;
            info!(container = %name, "container torn down");
            ContainerState::Removed
        } else {
            ContainerState::Absent
        };
        self.condemned().remove(&name);

        Ok(state)
    }

    /// Throw away a container after a failed execution (e.g. out of memory).
    ///
    /// Removed immediately when idle; otherwise marked so the next ensure or
    /// reconciliation pass replaces it once its sessions end.
    ///
    /// # Errors
    ///
    /// Returns an error when the removal itself fails.
    pub async fn discard(&self, name: &str) -> Result<(), SandboxError> {
        let _slug = self.locks.lock(name).await;
        let active = self.active_sessions(name).await?;
        if active > 0 {
            warn!(container = %name, active, "container condemned; removal deferred until sessions end");
            self.condemned().insert(name.to_owned());
            return Ok(());
        }

        let result = match self.runtime.remove_container(name).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(remove_failure(name, e)),
        };
        match &result {
            Ok(()) => {
                info!(container = %name, "container discarded");
                self.condemned().remove(name);
            }
            Err(e) => {
                warn!(container = %name, error = %e, "discard failed; container condemned");
                self.condemned().insert(name.to_owned());
            }
        }
        result
    }

    /// Managed containers and whether each matches current configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when containers cannot be listed.
    pub async fn status(&self) -> Result<Vec<ContainerStatus>, SandboxError> {
        let desired = self.current_hash();
        Ok(self
            .managed()
            .await?
            .into_iter()
            .map(|info| {
                let state = if info.label(HASH_LABEL) == Some(desired.as_str())
                    && !self.is_condemned(&info.name)
                {
                    ContainerState::Running
                } else {
                    ContainerState::Stale
                };
                let scope = info
                    .label(WORKSPACE_LABEL)
                    .unwrap_or(DEFAULT_TYPE)
                    .to_owned();
                ContainerStatus {
                    name: info.name,
                    scope,
                    running: info.running,
                    state,
                }
            })
            .collect())
    }
}

fn create_failure(name: &str, err: RuntimeError) -> SandboxError {
    match err {
        RuntimeError::Unavailable(diagnostic) => SandboxError::RuntimeUnavailable(diagnostic),
        RuntimeError::Timeout { operation, seconds } => SandboxError::Timeout { operation, seconds },
        other => SandboxError::ContainerCreateFailed {
            name: name.to_owned(),
            diagnostic: other.diagnostic(),
        },
    }
}

fn remove_failure(name: &str, err: RuntimeError) -> SandboxError {
    match err {
        RuntimeError::Unavailable(diagnostic) => SandboxError::RuntimeUnavailable(diagnostic),
        RuntimeError::Timeout { operation, seconds } => SandboxError::Timeout { operation, seconds },
        other => SandboxError::ContainerRemoveFailed {
            name: name.to_owned(),
            diagnostic: other.diagnostic(),
        },
    }
}
