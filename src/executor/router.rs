//! Execution routing: trust resolution, environment selection, credential
//! gating, and the agent output pump.
//!
//! Validation failures are returned from [`ExecutionRouter::run`] before
//! anything is touched. Every later failure is delivered in-stream as a
//! `typed_error` followed by an `exit`, so a stream handed to a caller always
//! terminates.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::events::{parse_line, ExecutionEvent, ExecutionStream};
use super::lifecycle::{ContainerLifecycleManager, SlugLocks};
use super::mounts::CapabilityMountBuilder;
use super::network::NetworkIsolationManager;
use super::process::{AgentProcess, HostProcess, ProcessSpec};
use super::redactor::Redactor;
use super::runtime::{ContainerRuntime, ExecSpec, RuntimeError};
use super::volumes::CacheVolumeManager;
use super::{ExecutionPayload, SandboxConfig, SandboxError};
use crate::config::{AgentSettings, Config, SandboxSettings};
use crate::credentials::{CredentialDecision, CredentialGate};
use crate::session::{validate_slug, Session, SessionRecord, SessionStore, Workspace};
use crate::trust::{self, TrustMode};

/// Event channel depth between the pump and the consumer.
const EVENT_BUFFER: usize = 64;

/// Grace period for the agent to exit after its output closes.
const EXIT_GRACE: Duration = Duration::from_secs(10);

/// Grace period passed to the in-container `timeout --kill-after`.
const KILL_AFTER_SECS: u64 = 5;

/// Session identifier variable.
pub const ENV_SESSION_ID: &str = "WARDEN_SESSION_ID";
/// Session type variable (`app`, `telegram`, ...).
pub const ENV_SESSION_TYPE: &str = "WARDEN_SESSION_TYPE";
/// Working directory variable, as seen by the agent.
pub const ENV_WORKDIR: &str = "WARDEN_WORKDIR";
/// Model identifier variable.
pub const ENV_MODEL: &str = "WARDEN_MODEL";
/// Tool-server descriptor list variable (JSON array).
pub const ENV_TOOL_SERVERS: &str = "WARDEN_TOOL_SERVERS";

/// Per-execution state the cleanup path needs.
struct RunState {
    container: Option<String>,
    redactor: Redactor,
}

/// Top-level decision point for running a session's request.
#[derive(Clone)]
pub struct ExecutionRouter {
    lifecycle: Arc<ContainerLifecycleManager>,
    credentials: Arc<CredentialGate>,
    sessions: Arc<dyn SessionStore>,
    sandbox: SandboxSettings,
    agent: AgentSettings,
}

impl std::fmt::Debug for ExecutionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRouter")
            .field("lifecycle", &self.lifecycle)
            .field("image", &self.sandbox.image)
            .finish_non_exhaustive()
    }
}

impl ExecutionRouter {
    /// Build a router over an assembled lifecycle manager.
    pub fn new(
        lifecycle: Arc<ContainerLifecycleManager>,
        credentials: Arc<CredentialGate>,
        sessions: Arc<dyn SessionStore>,
        sandbox: SandboxSettings,
        agent: AgentSettings,
    ) -> Self {
        Self {
            lifecycle,
            credentials,
            sessions,
            sandbox,
            agent,
        }
    }

    /// Assemble the full engine on a runtime backend.
    pub fn build(
        runtime: Arc<dyn ContainerRuntime>,
        sessions: Arc<dyn SessionStore>,
        config: &Config,
        default_vault: PathBuf,
    ) -> Self {
        let timeout = Duration::from_secs(config.sandbox.runtime_timeout_secs.max(1));
        let network = Arc::new(NetworkIsolationManager::new(
            Arc::clone(&runtime),
            config.sandbox.network_name.clone(),
            timeout,
        ));
        let volumes = Arc::new(CacheVolumeManager::new(Arc::clone(&runtime), timeout));
        let mounts = CapabilityMountBuilder::new(config.sandbox.vault_mount.clone(), default_vault);
        let lifecycle = Arc::new(ContainerLifecycleManager::new(
            runtime,
            Arc::clone(&sessions),
            network,
            volumes,
            mounts,
            config.sandbox.clone(),
            Arc::new(SlugLocks::new()),
        ));
        Self::new(
            lifecycle,
            Arc::new(CredentialGate::new()),
            sessions,
            config.sandbox.clone(),
            config.agent.clone(),
        )
    }

    /// Lifecycle manager, for reconciliation and teardown.
    pub fn lifecycle(&self) -> &Arc<ContainerLifecycleManager> {
        &self.lifecycle
    }

    /// Trust mode for a session: its own designation, else the workspace
    /// default, else the configured default.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::InvalidTrustValue`] for an unrecognised value.
    pub fn resolve_trust(&self, session: &Session) -> Result<TrustMode, SandboxError> {
        match session.trust.as_deref() {
            Some(raw) => Ok(trust::resolve(raw)?),
            None => Ok(session
                .workspace
                .as_ref()
                .map_or(self.agent.default_trust, |ws| ws.default_trust)),
        }
    }

    /// Run `message` for `session` and stream the agent's events.
    ///
    /// The stream ends with exactly one `exit` event. Dropping it terminates
    /// the agent.
    ///
    /// # Errors
    ///
    /// Returns a validation error (invalid trust value, empty message, invalid
    /// workspace slug) before any process or container is touched.
    pub fn run(&self, session: &Session, message: &str) -> Result<ExecutionStream, SandboxError> {
        if message.trim().is_empty() {
            return Err(SandboxError::InvalidRequest("message is empty".to_owned()));
        }
        if let Some(ws) = &session.workspace {
            validate_slug(&ws.slug).map_err(SandboxError::InvalidRequest)?;
        }
        let trust = self.resolve_trust(session)?;

        info!(
            session_id = %session.id,
            source = session.session_type(),
            workspace = session.workspace.as_ref().map(|ws| ws.slug.as_str()),
            trust = %trust,
            "execution requested"
        );

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let router = self.clone();
        let owned_session = session.clone();
        let owned_message = message.to_owned();
        tokio::spawn(async move {
            router.drive(owned_session, owned_message, trust, tx).await;
        });
        Ok(ExecutionStream::new(session.id.clone(), rx))
    }

    async fn drive(
        self,
        session: Session,
        message: String,
        trust: TrustMode,
        tx: mpsc::Sender<ExecutionEvent>,
    ) {
        let mut state = RunState {
            container: None,
            redactor: Redactor::default(),
        };
        let result = self
            .execute(&session, message, trust, &tx, &mut state)
            .await;

        if state.container.is_some() {
            if let Err(e) = self.sessions.complete(&session.id).await {
                warn!(session_id = %session.id, error = %e, "failed to complete session record");
            }
        }

        let tail = match result {
            Ok(tail) => tail,
            Err(err) => {
                if let SandboxError::ResourceExhausted { container } = &err {
                    if let Err(e) = self.lifecycle.discard(container).await {
                        warn!(container = %container, error = %e, "failed to discard container after out-of-memory");
                    }
                }
                let message = state.redactor.redact(&err.to_string());
                warn!(session_id = %session.id, code = err.code(), error = %message, "execution failed");
                vec![
                    ExecutionEvent::typed_error(&err, message.clone()),
                    ExecutionEvent::exit_error(message),
                ]
            }
        };

        for event in tail {
            if tx.send(event).await.is_err() {
                debug!(session_id = %session.id, "consumer gone before terminal events");
                break;
            }
        }
        info!(session_id = %session.id, "execution finished");
    }

    /// Run one execution. Returns the terminal events still to send, which
    /// is empty when the consumer has gone away.
    async fn execute(
        &self,
        session: &Session,
        message: String,
        trust: TrustMode,
        tx: &mpsc::Sender<ExecutionEvent>,
        state: &mut RunState,
    ) -> Result<Vec<ExecutionEvent>, SandboxError> {
        let workspace = session.workspace.as_ref();
        let mounts = self.lifecycle.mounts();
        let vault_root = mounts.vault_root(workspace).to_path_buf();

        let decision = self
            .credentials
            .decide_blocking(session.source, vault_root)
            .await?;
        if let CredentialDecision::Denied { reason } = &decision {
            debug!(session_id = %session.id, %reason, "credential gate closed");
        }
        let credentials = decision.into_set();
        state.redactor = Redactor::for_credentials(&credentials);

        let capability_set = mounts.build(workspace, trust)?;
        let env = self.execution_env(session, &capability_set.vault_path);
        let payload = ExecutionPayload {
            message,
            system_prompt: session
                .system_prompt
                .clone()
                .unwrap_or_else(|| self.agent.system_prompt.clone()),
            resume_session_id: session.resume_session_id.clone(),
            capabilities: capability_set.capabilities,
            credentials,
        };
        let payload = serde_json::to_vec(&payload)
            .map_err(|e| SandboxError::InvalidRequest(format!("payload serialization: {e}")))?;

        if tx.is_closed() {
            return Ok(Vec::new());
        }

        let mut process: Box<dyn AgentProcess> = match trust {
            TrustMode::Direct => self.spawn_direct(env, &capability_set.vault_path)?,
            TrustMode::Sandboxed => self.spawn_sandboxed(session, workspace, env, state).await?,
        };

        self.pump(process.as_mut(), &payload, tx, state).await
    }

    fn execution_env(&self, session: &Session, workdir: &Path) -> Vec<(String, String)> {
        let tool_servers =
            serde_json::to_string(&self.agent.tool_servers).unwrap_or_else(|_| "[]".to_owned());
        vec![
            (ENV_SESSION_ID.to_owned(), session.id.clone()),
            (ENV_SESSION_TYPE.to_owned(), session.session_type().to_owned()),
            (ENV_WORKDIR.to_owned(), workdir.display().to_string()),
            (ENV_MODEL.to_owned(), self.agent.model.clone()),
            (ENV_TOOL_SERVERS.to_owned(), tool_servers),
        ]
    }

    fn spawn_direct(
        &self,
        env: Vec<(String, String)>,
        workdir: &Path,
    ) -> Result<Box<dyn AgentProcess>, SandboxError> {
        let spec = ProcessSpec {
            argv: self.agent.command.clone(),
            env,
            working_dir: Some(workdir.to_path_buf()),
        };
        let process = HostProcess::spawn(&spec).map_err(|e| SandboxError::Spawn(e.to_string()))?;
        debug!(pid = process.id(), "direct agent started");
        Ok(Box::new(process))
    }

    async fn spawn_sandboxed(
        &self,
        session: &Session,
        workspace: Option<&Workspace>,
        env: Vec<(String, String)>,
        state: &mut RunState,
    ) -> Result<Box<dyn AgentProcess>, SandboxError> {
        let config = SandboxConfig::resolve(&self.sandbox, workspace, TrustMode::Sandboxed);
        let lease = self.lifecycle.lease(workspace, &config).await?;
        let container = lease.container.name.clone();

        // Registered under the slug lock so reconciliation sees it.
        self.sessions
            .register(&SessionRecord::new(
                session.id.clone(),
                container.clone(),
                workspace.map(|ws| ws.slug.clone()),
            ))
            .await
            .map_err(|e| SandboxError::SessionStore(format!("{e:#}")))?;
        state.container = Some(container.clone());
        drop(lease);

        let spec = ExecSpec {
            argv: self.container_argv(),
            env,
            working_dir: self.sandbox.vault_mount.clone(),
        };
        self.lifecycle
            .runtime()
            .exec(&container, &spec)
            .await
            .map_err(|e| match e {
                RuntimeError::Unavailable(diagnostic) => SandboxError::RuntimeUnavailable(diagnostic),
                RuntimeError::Timeout { operation, seconds } => {
                    SandboxError::Timeout { operation, seconds }
                }
                other => SandboxError::Spawn(other.to_string()),
            })
    }

    /// Agent argv inside the container, bounded by the execution budget.
    pub fn container_argv(&self) -> Vec<String> {
        let mut argv = vec![
            "timeout".to_owned(),
            "--signal=TERM".to_owned(),
            format!("--kill-after={KILL_AFTER_SECS}"),
            self.sandbox.execution_timeout_secs.max(1).to_string(),
        ];
        argv.extend(self.agent.container_command.iter().cloned());
        argv
    }

    async fn pump(
        &self,
        process: &mut dyn AgentProcess,
        payload: &[u8],
        tx: &mpsc::Sender<ExecutionEvent>,
        state: &RunState,
    ) -> Result<Vec<ExecutionEvent>, SandboxError> {
        if let Err(e) = process.send_input(payload).await {
            process.terminate().await;
            let diagnostics = state.redactor.redact(&process.diagnostics());
            return Err(SandboxError::TransportClosed(join_diagnostic(
                &format!("failed to write payload: {e}"),
                &diagnostics,
            )));
        }

        let budget = self.sandbox.execution_timeout_secs.max(1);
        let deadline = tokio::time::sleep(Duration::from_secs(budget));
        tokio::pin!(deadline);

        let mut agent_exit = None;
        let mut read_error = None;
        loop {
            tokio::select! {
                biased;
                () = tx.closed() => {
                    info!("consumer disconnected; terminating agent");
                    process.terminate().await;
                    return Ok(Vec::new());
                }
                () = &mut deadline => {
                    warn!(budget_secs = budget, "execution exceeded its budget; terminating agent");
                    process.terminate().await;
                    return Err(SandboxError::Timeout {
                        operation: "execution".to_owned(),
                        seconds: budget,
                    });
                }
                line = process.next_line() => match line {
                    Ok(Some(line)) => {
                        let Some(event) = parse_line(&line) else { continue };
                        if event.is_exit() {
                            agent_exit = Some(event);
                            break;
                        }
                        if tx.send(event).await.is_err() {
                            process.terminate().await;
                            return Ok(Vec::new());
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        read_error = Some(e.to_string());
                        break;
                    }
                },
            }
        }

        let exit_code = match tokio::time::timeout(EXIT_GRACE, process.wait()).await {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                debug!(error = %e, "failed to collect agent exit status");
                None
            }
            Err(_) => {
                warn!("agent did not exit after closing its output; terminating");
                process.terminate().await;
                None
            }
        };

        if let Some(exit) = agent_exit {
            return Ok(vec![exit]);
        }

        if let Some(container) = &state.container {
            if exit_code == Some(self.sandbox.oom_exit_code) {
                return Err(SandboxError::ResourceExhausted {
                    container: container.clone(),
                });
            }
        }

        let cause = match (read_error, exit_code) {
            (Some(e), _) => format!("reading agent output failed: {e}"),
            (None, Some(code)) => format!("agent exited with code {code} before reporting completion"),
            (None, None) => "agent output closed before reporting completion".to_owned(),
        };
        let diagnostics = state.redactor.redact(&process.diagnostics());
        Err(SandboxError::TransportClosed(join_diagnostic(&cause, &diagnostics)))
    }
}

fn join_diagnostic(cause: &str, diagnostics: &str) -> String {
    if diagnostics.is_empty() {
        cause.to_owned()
    } else {
        format!("{cause}; stderr: {diagnostics}")
    }
}
