//! Runtime backend that drives a docker-compatible CLI (`docker`, `podman`).
//!
//! Every invocation goes through [`run_with_timeout`], and every exit code is
//! checked. The CLI uses one exit code for "already exists" and for genuine
//! failures, so outcomes are classified from stderr.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{
    is_already_exists, is_daemon_unreachable, is_not_found, ContainerInfo, ContainerRuntime,
    ContainerSpec, ExecHandle, ExecSpec, ProvisionOutcome, RuntimeError,
};
use crate::executor::process::{run_with_timeout, AgentProcess, CommandOutput, HostProcess, ProcessError};

/// CLI-backed container runtime.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    binary: String,
    timeout: Duration,
}

impl CliRuntime {
    /// Drive `binary` with a per-call timeout.
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, operation: &str, args: &[String]) -> Result<CommandOutput, RuntimeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        debug!(binary = %self.binary, operation, "invoking container cli");
        run_with_timeout(cmd, self.timeout)
            .await
            .map_err(|e| match e {
                ProcessError::Spawn { program, source } => {
                    RuntimeError::Unavailable(format!("cannot run {program}: {source}"))
                }
                ProcessError::TimedOut { seconds, .. } => RuntimeError::Timeout {
                    operation: operation.to_owned(),
                    seconds,
                },
                other => RuntimeError::Failed {
                    operation: operation.to_owned(),
                    diagnostic: other.to_string(),
                    exit_code: None,
                },
            })
    }

    async fn inspect_many(&self, names: &[String]) -> Result<Vec<ContainerInfo>, RuntimeError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["container".to_owned(), "inspect".to_owned()];
        args.extend(names.iter().cloned());
        let output = self.run("container inspect", &args).await?;
        if !output.success() {
            return Err(classify_failure("container inspect", &output));
        }
        parse_inspect_output(&output.stdout)
    }
}

/// Map a failed CLI invocation to a runtime error.
pub fn classify_failure(operation: &str, output: &CommandOutput) -> RuntimeError {
    let diagnostic = output.diagnostic();
    if is_daemon_unreachable(&diagnostic) {
        RuntimeError::Unavailable(diagnostic)
    } else if is_not_found(&diagnostic) {
        RuntimeError::NotFound(diagnostic)
    } else {
        RuntimeError::Failed {
            operation: operation.to_owned(),
            diagnostic,
            exit_code: output.exit_code,
        }
    }
}

/// Classify a provisioning call (network or volume create).
///
/// # Errors
///
/// Returns the classified failure unless stderr reports "already exists".
pub fn classify_provision(
    operation: &str,
    output: &CommandOutput,
) -> Result<ProvisionOutcome, RuntimeError> {
    if output.success() {
        return Ok(ProvisionOutcome::Created);
    }
    if is_already_exists(&output.diagnostic()) {
        return Ok(ProvisionOutcome::AlreadyExists);
    }
    Err(classify_failure(operation, output))
}

/// Render a container spec as `create` arguments.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "create".to_owned(),
        "--pull".to_owned(),
        "never".to_owned(),
        "--name".to_owned(),
        spec.name.clone(),
    ];
    for (key, value) in &spec.labels {
        args.push("--label".to_owned());
        args.push(format!("{key}={value}"));
    }
    args.push("--memory".to_owned());
    args.push(format!("{}b", spec.memory_bytes));
    args.push("--cpus".to_owned());
    args.push(render_cpus(spec.nano_cpus));
    args.push("--pids-limit".to_owned());
    args.push(spec.pids_limit.to_string());
    args.push("--network".to_owned());
    args.push(spec.network.clone().unwrap_or_else(|| "none".to_owned()));
    for cap in &spec.cap_drop {
        args.push("--cap-drop".to_owned());
        args.push(cap.clone());
    }
    for opt in &spec.security_opt {
        args.push("--security-opt".to_owned());
        args.push(opt.clone());
    }
    if spec.read_only_rootfs {
        args.push("--read-only".to_owned());
    }
    for (path, options) in &spec.tmpfs {
        args.push("--tmpfs".to_owned());
        args.push(format!("{path}:{options}"));
    }
    for bind in &spec.binds {
        args.push("--volume".to_owned());
        args.push(bind.to_bind_string());
    }
    for (volume, target) in &spec.volumes {
        args.push("--volume".to_owned());
        args.push(format!("{volume}:{target}"));
    }
    args.push("--user".to_owned());
    args.push(spec.user.clone());
    args.push("--workdir".to_owned());
    args.push(spec.working_dir.clone());
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

fn render_cpus(nano_cpus: i64) -> String {
    let whole = nano_cpus.checked_div(1_000_000_000).unwrap_or(0);
    let fraction = nano_cpus.checked_rem(1_000_000_000).unwrap_or(0);
    format!("{whole}.{fraction:09}")
}

/// Render an exec spec as `exec` arguments.
pub fn exec_args(container: &str, spec: &ExecSpec) -> Vec<String> {
    let mut args = vec!["exec".to_owned(), "--interactive".to_owned()];
    for (key, value) in &spec.env {
        args.push("--env".to_owned());
        args.push(format!("{key}={value}"));
    }
    args.push("--workdir".to_owned());
    args.push(spec.working_dir.clone());
    args.push(container.to_owned());
    args.extend(spec.argv.iter().cloned());
    args
}

/// Parse `container inspect` JSON output.
///
/// # Errors
///
/// Returns an error when the output is not a JSON array.
pub fn parse_inspect_output(stdout: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
    let parsed: Vec<Value> = serde_json::from_str(stdout.trim()).map_err(|e| RuntimeError::Failed {
        operation: "container inspect".to_owned(),
        diagnostic: format!("unparseable inspect output: {e}"),
        exit_code: None,
    })?;

    Ok(parsed
        .iter()
        .map(|entry| {
            let name = entry
                .get("Name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_owned();
            let labels = entry
                .pointer("/Config/Labels")
                .and_then(Value::as_object)
                .map(|labels| {
                    labels
                        .iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_owned())))
                        .collect::<BTreeMap<_, _>>()
                })
                .unwrap_or_default();
            let running = entry
                .pointer("/State/Running")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            ContainerInfo {
                name,
                labels,
                running,
            }
        })
        .collect())
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    fn backend(&self) -> &'static str {
        "cli"
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        let args = vec![
            "version".to_owned(),
            "--format".to_owned(),
            "{{.Server.Version}}".to_owned(),
        ];
        let output = self.run("version", &args).await?;
        if output.success() {
            Ok(())
        } else {
            Err(RuntimeError::Unavailable(output.diagnostic()))
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        let args = vec!["image".to_owned(), "inspect".to_owned(), image.to_owned()];
        let output = self.run("image inspect", &args).await?;
        if output.success() {
            return Ok(true);
        }
        match classify_failure("image inspect", &output) {
            RuntimeError::NotFound(_) => Ok(false),
            other => Err(other),
        }
    }

    async fn create_network(&self, name: &str) -> Result<ProvisionOutcome, RuntimeError> {
        let args = vec![
            "network".to_owned(),
            "create".to_owned(),
            "--driver".to_owned(),
            "bridge".to_owned(),
            name.to_owned(),
        ];
        let output = self.run("network create", &args).await?;
        classify_provision("network create", &output)
    }

    async fn create_volume(&self, name: &str) -> Result<ProvisionOutcome, RuntimeError> {
        let args = vec!["volume".to_owned(), "create".to_owned(), name.to_owned()];
        let output = self.run("volume create", &args).await?;
        classify_provision("volume create", &output)
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        match self.inspect_many(&[name.to_owned()]).await {
            Ok(mut found) => Ok(found.pop()),
            Err(RuntimeError::NotFound(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let args = vec![
            "ps".to_owned(),
            "--all".to_owned(),
            "--quiet".to_owned(),
            "--filter".to_owned(),
            format!("label={label}"),
        ];
        let output = self.run("ps", &args).await?;
        if !output.success() {
            return Err(classify_failure("ps", &output));
        }
        let ids: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        self.inspect_many(&ids).await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        let output = self.run("create", &create_args(spec)).await?;
        if output.success() {
            Ok(())
        } else {
            Err(classify_failure("create", &output))
        }
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        let args = vec!["start".to_owned(), name.to_owned()];
        let output = self.run("start", &args).await?;
        if output.success() {
            Ok(())
        } else {
            Err(classify_failure("start", &output))
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        let args = vec!["rm".to_owned(), "--force".to_owned(), name.to_owned()];
        let output = self.run("rm", &args).await?;
        if output.success() {
            Ok(())
        } else {
            Err(classify_failure("rm", &output))
        }
    }

    async fn exec(
        &self,
        container: &str,
        spec: &ExecSpec,
    ) -> Result<Box<dyn AgentProcess>, RuntimeError> {
        let handle = ExecHandle::new();
        let mut cmd = Command::new(&self.binary);
        cmd.args(exec_args(container, &handle.wrap_spec(spec)));
        let client = HostProcess::spawn_command(cmd).map_err(|e| match e {
            ProcessError::Spawn { program, source } => {
                RuntimeError::Unavailable(format!("cannot run {program}: {source}"))
            }
            other => RuntimeError::Failed {
                operation: "exec".to_owned(),
                diagnostic: other.to_string(),
                exit_code: None,
            },
        })?;
        Ok(Box::new(CliExecProcess {
            client,
            runtime: self.clone(),
            container: container.to_owned(),
            handle,
        }))
    }
}

/// An `exec` client on the host and the command it started in the container.
///
/// Killing the client alone leaves the command running, so `terminate`
/// signals it through a second `exec` first.
#[derive(Debug)]
pub struct CliExecProcess {
    client: HostProcess,
    runtime: CliRuntime,
    container: String,
    handle: ExecHandle,
}

#[async_trait]
impl AgentProcess for CliExecProcess {
    async fn send_input(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.client.send_input(payload).await
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.client.next_line().await
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        self.client.wait().await
    }

    async fn terminate(&mut self) {
        let mut args = vec!["exec".to_owned(), self.container.clone()];
        args.extend(self.handle.kill_argv());
        match self.runtime.run("exec kill", &args).await {
            Ok(output) if output.success() => {
                debug!(container = %self.container, "terminate signal sent to exec");
            }
            Ok(output) => warn!(
                container = %self.container,
                exit_code = output.exit_code,
                diagnostic = %output.diagnostic(),
                "failed to signal exec"
            ),
            Err(e) => warn!(container = %self.container, error = %e, "failed to signal exec"),
        }
        self.client.terminate().await;
    }

    fn diagnostics(&self) -> String {
        self.client.diagnostics()
    }
}
