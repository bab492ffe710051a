//! Docker Engine API backend.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::network::CreateNetworkOptions;
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use super::{
    is_already_exists, ContainerInfo, ContainerRuntime, ContainerSpec, ExecHandle, ExecSpec,
    ProvisionOutcome, RuntimeError,
};
use crate::executor::process::{push_bounded, AgentProcess, STDERR_TAIL_LIMIT};
use crate::executor::APP_LABEL_VALUE;

/// How often `wait` polls a finished exec for its exit code.
const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Docker Engine API runtime.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
    timeout: Duration,
}

impl DockerRuntime {
    /// Connect to the local daemon using the default socket or `DOCKER_HOST`.
    ///
    /// Connecting does not contact the daemon; use [`ContainerRuntime::ping`].
    ///
    /// # Errors
    ///
    /// Returns an error when the client cannot be configured.
    pub fn connect(timeout: Duration) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self { docker, timeout })
    }

    async fn call<T, F>(&self, operation: &str, fut: F) -> Result<T, RuntimeError>
    where
        F: Future<Output = Result<T, BollardError>> + Send,
    {
        debug!(operation, "docker api call");
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| map_error(operation, e)),
            Err(_) => Err(RuntimeError::Timeout {
                operation: operation.to_owned(),
                seconds: self.timeout.as_secs(),
            }),
        }
    }
}

/// Map a bollard error to a runtime error.
fn map_error(operation: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Failed {
            operation: operation.to_owned(),
            diagnostic: message,
            exit_code: i32::try_from(status_code).ok(),
        },
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

fn provision_outcome(result: Result<(), RuntimeError>) -> Result<ProvisionOutcome, RuntimeError> {
    match result {
        Ok(()) => Ok(ProvisionOutcome::Created),
        Err(RuntimeError::Failed { diagnostic, .. }) if is_already_exists(&diagnostic) => {
            Ok(ProvisionOutcome::AlreadyExists)
        }
        Err(other) => Err(other),
    }
}

/// Render a container spec as a Docker create request.
pub fn build_container_config(spec: &ContainerSpec) -> ContainerConfig<String> {
    let mut binds: Vec<String> = spec.binds.iter().map(|b| b.to_bind_string()).collect();
    binds.extend(
        spec.volumes
            .iter()
            .map(|(volume, target)| format!("{volume}:{target}")),
    );

    let tmpfs: HashMap<String, String> = spec
        .tmpfs
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let host_config = HostConfig {
        network_mode: Some(spec.network.clone().unwrap_or_else(|| "none".to_owned())),
        readonly_rootfs: Some(spec.read_only_rootfs),
        cap_drop: Some(spec.cap_drop.clone()),
        security_opt: Some(spec.security_opt.clone()),
        pids_limit: Some(spec.pids_limit),
        memory: Some(spec.memory_bytes),
        nano_cpus: Some(spec.nano_cpus),
        binds: Some(binds),
        tmpfs: Some(tmpfs),
        ..Default::default()
    };

    ContainerConfig {
        image: Some(spec.image.clone()),
        cmd: Some(spec.command.clone()),
        user: Some(spec.user.clone()),
        working_dir: Some(spec.working_dir.clone()),
        labels: Some(
            spec.labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        env: Some(Vec::new()),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn backend(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.call("ping", self.docker.ping())
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.diagnostic()))
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.call("image inspect", self.docker.inspect_image(image)).await {
            Ok(_) => Ok(true),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(other) => Err(other),
        }
    }

    async fn create_network(&self, name: &str) -> Result<ProvisionOutcome, RuntimeError> {
        let options = CreateNetworkOptions {
            name: name.to_owned(),
            driver: "bridge".to_owned(),
            labels: HashMap::from([("app".to_owned(), APP_LABEL_VALUE.to_owned())]),
            ..Default::default()
        };
        let result = self
            .call("network create", self.docker.create_network(options))
            .await
            .map(|_| ());
        provision_outcome(result)
    }

    async fn create_volume(&self, name: &str) -> Result<ProvisionOutcome, RuntimeError> {
        let options = CreateVolumeOptions {
            name: name.to_owned(),
            driver: "local".to_owned(),
            labels: HashMap::from([("app".to_owned(), APP_LABEL_VALUE.to_owned())]),
            ..Default::default()
        };
        let result = self
            .call("volume create", self.docker.create_volume(options))
            .await
            .map(|_| ());
        provision_outcome(result)
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        let inspected = self
            .call(
                "container inspect",
                self.docker
                    .inspect_container(name, None::<InspectContainerOptions>),
            )
            .await;
        match inspected {
            Ok(response) => Ok(Some(ContainerInfo {
                name: response
                    .name
                    .as_deref()
                    .unwrap_or(name)
                    .trim_start_matches('/')
                    .to_owned(),
                labels: response
                    .config
                    .and_then(|config| config.labels)
                    .unwrap_or_default()
                    .into_iter()
                    .collect(),
                running: response
                    .state
                    .and_then(|state| state.running)
                    .unwrap_or(false),
            })),
            Err(RuntimeError::NotFound(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let options = Some(ListContainersOptions {
            all: true,
            filters: HashMap::from([("label".to_owned(), vec![label.to_owned()])]),
            ..Default::default()
        });
        let containers = self
            .call("list containers", self.docker.list_containers(options))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                let name = summary
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_owned())?;
                Some(ContainerInfo {
                    name,
                    labels: summary.labels.unwrap_or_default().into_iter().collect(),
                    running: summary.state.as_deref() == Some("running"),
                })
            })
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        });
        self.call(
            "container create",
            self.docker
                .create_container(options, build_container_config(spec)),
        )
        .await
        .map(|_| ())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.call(
            "container start",
            self.docker
                .start_container(name, None::<StartContainerOptions<String>>),
        )
        .await
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        self.call(
            "container remove",
            self.docker.remove_container(name, options),
        )
        .await
    }

    async fn exec(
        &self,
        container: &str,
        spec: &ExecSpec,
    ) -> Result<Box<dyn AgentProcess>, RuntimeError> {
        let handle = ExecHandle::new();
        let create_exec = CreateExecOptions {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(handle.wrap(&spec.argv)),
            env: Some(
                spec.env
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect(),
            ),
            working_dir: Some(spec.working_dir.clone()),
            ..Default::default()
        };
        let created = self
            .call("exec create", self.docker.create_exec(container, create_exec))
            .await?;

        let started = self
            .call(
                "exec start",
                self.docker.start_exec(
                    &created.id,
                    Some(StartExecOptions {
                        detach: false,
                        tty: false,
                        output_capacity: None,
                    }),
                ),
            )
            .await?;

        match started {
            StartExecResults::Attached { output, input } => Ok(Box::new(DockerExecProcess {
                docker: self.docker.clone(),
                timeout: self.timeout,
                container: container.to_owned(),
                handle,
                exec_id: created.id,
                output: Some(output),
                input: Some(input),
                buffer: Vec::new(),
                stderr_tail: String::new(),
            })),
            StartExecResults::Detached => Err(RuntimeError::Failed {
                operation: "exec start".to_owned(),
                diagnostic: "exec started detached".to_owned(),
                exit_code: None,
            }),
        }
    }
}

/// Run `kill_argv` in a detached second exec.
async fn signal_exec(
    docker: &Docker,
    container: &str,
    kill_argv: Vec<String>,
) -> Result<(), BollardError> {
    let kill = CreateExecOptions {
        cmd: Some(kill_argv),
        attach_stdout: Some(false),
        attach_stderr: Some(false),
        ..Default::default()
    };
    let created = docker.create_exec(container, kill).await?;
    docker
        .start_exec(
            &created.id,
            Some(StartExecOptions {
                detach: true,
                tty: false,
                output_capacity: None,
            }),
        )
        .await?;
    Ok(())
}

type ExecOutput = Pin<Box<dyn Stream<Item = Result<LogOutput, BollardError>> + Send>>;
type ExecInput = Pin<Box<dyn AsyncWrite + Send>>;

/// Process started with `docker exec`, attached over the API.
pub struct DockerExecProcess {
    docker: Docker,
    timeout: Duration,
    container: String,
    handle: ExecHandle,
    exec_id: String,
    output: Option<ExecOutput>,
    input: Option<ExecInput>,
    buffer: Vec<u8>,
    stderr_tail: String,
}

impl std::fmt::Debug for DockerExecProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerExecProcess")
            .field("container", &self.container)
            .field("exec_id", &self.exec_id)
            .finish()
    }
}

impl DockerExecProcess {
    fn take_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&raw);
        Some(text.trim_end_matches(['\n', '\r']).to_owned())
    }

    fn take_remainder(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&raw).trim_end_matches('\r').to_owned())
    }
}

#[async_trait]
impl AgentProcess for DockerExecProcess {
    async fn send_input(&mut self, payload: &[u8]) -> io::Result<()> {
        let mut input = self
            .input
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin already closed"))?;
        input.write_all(payload).await?;
        input.write_all(b"\n").await?;
        input.flush().await?;
        input.shutdown().await?;
        Ok(())
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            let Some(output) = self.output.as_mut() else {
                return Ok(self.take_remainder());
            };
            match output.next().await {
                Some(Ok(LogOutput::StdOut { message } | LogOutput::Console { message })) => {
                    self.buffer.extend_from_slice(&message);
                }
                Some(Ok(LogOutput::StdErr { message })) => {
                    push_bounded(
                        &mut self.stderr_tail,
                        &String::from_utf8_lossy(&message),
                        STDERR_TAIL_LIMIT,
                    );
                }
                Some(Ok(LogOutput::StdIn { .. })) => {}
                Some(Err(e)) => {
                    self.output = None;
                    return Err(io::Error::other(e.to_string()));
                }
                None => self.output = None,
            }
        }
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        // Drain what is left so the exec is not held open by backpressure.
        while self.next_line().await?.is_some() {}

        loop {
            let inspect = self
                .docker
                .inspect_exec(&self.exec_id)
                .await
                .map_err(|e| io::Error::other(e.to_string()))?;
            if inspect.running != Some(true) {
                return Ok(inspect.exit_code.and_then(|code| i32::try_from(code).ok()));
            }
            tokio::time::sleep(EXEC_POLL_INTERVAL).await;
        }
    }

    async fn terminate(&mut self) {
        self.input = None;
        let signalled = signal_exec(&self.docker, &self.container, self.handle.kill_argv());
        match tokio::time::timeout(self.timeout, signalled).await {
            Ok(Ok(())) => debug!(
                container = %self.container,
                exec_id = %self.exec_id,
                "terminate signal sent to exec"
            ),
            Ok(Err(e)) => warn!(
                container = %self.container,
                exec_id = %self.exec_id,
                error = %e,
                "failed to signal exec"
            ),
            Err(_) => warn!(
                container = %self.container,
                exec_id = %self.exec_id,
                timeout_secs = self.timeout.as_secs(),
                "signalling exec timed out"
            ),
        }
        self.output = None;
        self.buffer.clear();
    }

    fn diagnostics(&self) -> String {
        self.stderr_tail.trim().to_owned()
    }
}
