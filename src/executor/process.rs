//! Subprocess helpers shared by the CLI runtime and direct executions.
//!
//! Every child is spawned with `kill_on_drop(true)`. Timeouts never just
//! abandon the wait: the child is killed and reaped before the error is
//! returned.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Upper bound on retained stderr text per process.
pub const STDERR_TAIL_LIMIT: usize = 8192;

/// How long `terminate` waits for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on a `kill -0` liveness check.
const PID_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// A program invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub working_dir: Option<PathBuf>,
}

impl ProcessSpec {
    /// Build a `tokio` command for this spec.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::EmptyCommand`] when `argv` is empty.
    pub fn command(&self) -> Result<Command, ProcessError> {
        let (program, args) = self.argv.split_first().ok_or(ProcessError::EmptyCommand)?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }
}

/// Captured result of a completed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; signal deaths are reported as `128 + signal`.
    pub exit_code: Option<i32>,
    /// Captured stdout text.
    pub stdout: String,
    /// Captured stderr text.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// The runtime's diagnostic text: stderr, or stdout when stderr is empty.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_owned()
        } else {
            stderr.to_owned()
        }
    }
}

/// Subprocess failures.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// No program was given.
    #[error("empty command")]
    EmptyCommand,
    /// The program could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The command exceeded its timeout and was killed.
    #[error("{program} timed out after {seconds}s and was killed")]
    TimedOut {
        /// Program name.
        program: String,
        /// OS process id of the killed child.
        pid: Option<u32>,
        /// Timeout budget in seconds.
        seconds: u64,
    },
    /// Reading output or waiting on the child failed.
    #[error("i/o error talking to {program}: {source}")]
    Io {
        /// Program name.
        program: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Convert an exit status to a shell-style exit code.
pub fn exit_code_of(status: ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().and_then(|signal| signal.checked_add(128))
    }
    #[cfg(not(unix))]
    {
        None
    }
}

fn program_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}

/// Run a command to completion, capturing its output, within `timeout`.
///
/// On timeout the child is killed and waited on before
/// [`ProcessError::TimedOut`] is returned, so no orphan is left behind.
///
/// # Errors
///
/// Returns an error when the command cannot be spawned, its output cannot be
/// read, or it exceeds `timeout`.
pub async fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
) -> Result<CommandOutput, ProcessError> {
    let program = program_name(&cmd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pid = child.id();

    let outcome = tokio::time::timeout(timeout, collect_output(&mut child)).await;
    match outcome {
        Ok(Ok((status, stdout, stderr))) => Ok(CommandOutput {
            exit_code: exit_code_of(status),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }),
        Ok(Err(source)) => {
            reap(&mut child, &program).await;
            Err(ProcessError::Io { program, source })
        }
        Err(_) => {
            warn!(program = %program, pid, timeout_secs = timeout.as_secs(), "command timed out, killing");
            reap(&mut child, &program).await;
            Err(ProcessError::TimedOut {
                program,
                pid,
                seconds: timeout.as_secs(),
            })
        }
    }
}

async fn collect_output(child: &mut Child) -> io::Result<(ExitStatus, Vec<u8>, Vec<u8>)> {
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let read_stdout = async {
        match stdout_pipe.as_mut() {
            Some(pipe) => pipe.read_to_end(&mut stdout).await,
            None => Ok(0),
        }
    };
    let read_stderr = async {
        match stderr_pipe.as_mut() {
            Some(pipe) => pipe.read_to_end(&mut stderr).await,
            None => Ok(0),
        }
    };
    let (stdout_read, stderr_read) = tokio::join!(read_stdout, read_stderr);
    stdout_read?;
    stderr_read?;

    let status = child.wait().await?;
    Ok((status, stdout, stderr))
}

/// Kill a child and wait for it to exit.
async fn reap(child: &mut Child, program: &str) {
    if let Err(e) = child.start_kill() {
        // Already exited; fall through to reap it.
        debug!(program, error = %e, "kill signal not delivered");
    }
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => debug!(program, ?status, "child reaped"),
        Ok(Err(e)) => warn!(program, error = %e, "failed to reap child"),
        Err(_) => warn!(program, "child did not exit after kill"),
    }
}

/// Whether a process with `pid` exists, tested with `kill -0`.
///
/// A process owned by another user counts as alive. When `kill` itself
/// cannot run the answer is also `true`, so a live owner is never written off.
pub async fn pid_alive(pid: u32) -> bool {
    let mut cmd = Command::new("kill");
    cmd.args(["-0", &pid.to_string()]);
    match run_with_timeout(cmd, PID_CHECK_TIMEOUT).await {
        Ok(output) => {
            output.success() || output.stderr.to_ascii_lowercase().contains("not permitted")
        }
        Err(e) => {
            warn!(pid, error = %e, "cannot check process liveness; assuming alive");
            true
        }
    }
}

/// Append `chunk` to `buf`, keeping only the last `limit` bytes.
pub fn push_bounded(buf: &mut String, chunk: &str, limit: usize) {
    buf.push_str(chunk);
    if buf.len() > limit {
        let mut cut = buf.len().saturating_sub(limit);
        while !buf.is_char_boundary(cut) {
            cut = cut.saturating_add(1);
        }
        buf.drain(..cut);
    }
}

/// A running agent: one input write, then a stream of output lines.
#[async_trait]
pub trait AgentProcess: Send {
    /// Write the payload to the input channel and close it.
    async fn send_input(&mut self, payload: &[u8]) -> io::Result<()>;
    /// Next output line without its terminator; `None` once the channel closes.
    async fn next_line(&mut self) -> io::Result<Option<String>>;
    /// Wait for the process to finish and return its exit code.
    async fn wait(&mut self) -> io::Result<Option<i32>>;
    /// Stop the process and close its channels.
    async fn terminate(&mut self);
    /// Recent stderr output, for diagnostics.
    fn diagnostics(&self) -> String;
}

/// Host child process speaking the line protocol over stdio.
pub struct HostProcess {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    stderr_tail: Arc<Mutex<String>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for HostProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProcess")
            .field("program", &self.program)
            .field("pid", &self.child.id())
            .finish()
    }
}

impl HostProcess {
    /// Spawn a process with piped stdio.
    ///
    /// # Errors
    ///
    /// Returns an error when the command is empty or cannot be spawned.
    pub fn spawn(spec: &ProcessSpec) -> Result<Self, ProcessError> {
        let cmd = spec.command()?;
        Self::spawn_command(cmd)
    }

    /// Spawn a prepared command with piped stdio.
    ///
    /// # Errors
    ///
    /// Returns an error when the command cannot be spawned.
    pub fn spawn_command(mut cmd: Command) -> Result<Self, ProcessError> {
        let program = program_name(&cmd);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(|out| BufReader::new(out).lines());

        let stderr_tail = Arc::new(Mutex::new(String::new()));
        let stderr_task = child.stderr.take().map(|err| {
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut buf = tail
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    push_bounded(&mut buf, &line, STDERR_TAIL_LIMIT);
                    buf.push('\n');
                }
            })
        });

        debug!(program = %program, pid = child.id(), "agent process spawned");
        Ok(Self {
            program,
            child,
            stdin,
            stdout,
            stderr_tail,
            stderr_task,
        })
    }

    /// OS process id, while the child is running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

#[async_trait]
impl AgentProcess for HostProcess {
    async fn send_input(&mut self, payload: &[u8]) -> io::Result<()> {
        let mut stdin = self
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin already closed"))?;
        stdin.write_all(payload).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        stdin.shutdown().await?;
        Ok(())
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        match self.stdout.as_mut() {
            Some(lines) => {
                let line = lines.next_line().await?;
                if line.is_none() {
                    self.stdout = None;
                }
                Ok(line)
            }
            None => Ok(None),
        }
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        if let Some(task) = self.stderr_task.take() {
            // stderr closes with the process; bound the wait anyway.
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        Ok(exit_code_of(status))
    }

    async fn terminate(&mut self) {
        self.stdin = None;
        self.stdout = None;
        reap(&mut self.child, &self.program).await;
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }

    fn diagnostics(&self) -> String {
        self.stderr_tail
            .lock()
            .map(|buf| buf.trim().to_owned())
            .unwrap_or_default()
    }
}
