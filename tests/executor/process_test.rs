//! Subprocess timeout and agent process behaviour.

use std::time::{Duration, Instant};

use tokio::process::Command;
use warden::executor::process::{
    push_bounded, run_with_timeout, AgentProcess, HostProcess, ProcessError, ProcessSpec,
};

fn sh(script: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    cmd
}

#[tokio::test]
async fn captures_output_and_exit_code() {
    let output = run_with_timeout(sh("echo out; echo err >&2; exit 3"), Duration::from_secs(10))
        .await
        .expect("command should run");
    assert_eq!(output.exit_code, Some(3));
    assert!(!output.success());
    assert_eq!(output.stdout.trim(), "out");
    assert_eq!(output.diagnostic(), "err");
}

#[tokio::test]
async fn timed_out_command_is_killed_and_reaped() {
    let started = Instant::now();
    let result = run_with_timeout(sh("exec sleep 30"), Duration::from_millis(200)).await;
    assert!(started.elapsed() < Duration::from_secs(10));

    let pid = match result {
        Err(ProcessError::TimedOut { pid, seconds, .. }) => {
            assert_eq!(seconds, 0);
            pid.expect("spawned child should have a pid")
        }
        other => panic!("expected timeout, got {other:?}"),
    };

    #[cfg(target_os = "linux")]
    {
        // Reaped children disappear from /proc entirely; zombies would linger.
        let proc_path = format!("/proc/{pid}");
        assert!(
            !std::path::Path::new(&proc_path).exists(),
            "timed-out child {pid} still present"
        );
    }
    #[cfg(not(target_os = "linux"))]
    let _ = pid;
}

#[tokio::test]
async fn missing_program_is_a_spawn_error() {
    let result = run_with_timeout(
        Command::new("/nonexistent/warden-test-binary"),
        Duration::from_secs(1),
    )
    .await;
    assert!(matches!(result, Err(ProcessError::Spawn { .. })));
}

#[test]
fn empty_argv_is_rejected() {
    let spec = ProcessSpec::default();
    assert!(matches!(spec.command(), Err(ProcessError::EmptyCommand)));
}

#[test]
fn bounded_buffer_keeps_the_tail() {
    let mut buf = String::new();
    push_bounded(&mut buf, "abcdef", 4);
    assert_eq!(buf, "cdef");
    push_bounded(&mut buf, "gh", 4);
    assert_eq!(buf, "efgh");
}

#[tokio::test]
async fn host_process_round_trips_stdin_to_stdout() {
    let spec = ProcessSpec {
        argv: vec!["sh".to_owned(), "-c".to_owned(), "read line; echo \"got:$line\"; echo oops >&2".to_owned()],
        env: Vec::new(),
        working_dir: None,
    };
    let mut process = HostProcess::spawn(&spec).expect("sh should spawn");
    process.send_input(b"payload").await.expect("write payload");
    let line = process.next_line().await.expect("read line");
    assert_eq!(line.as_deref(), Some("got:payload"));
    assert_eq!(process.next_line().await.expect("read eof"), None);
    assert_eq!(process.wait().await.expect("wait"), Some(0));
    assert_eq!(process.diagnostics(), "oops");
}

#[tokio::test]
async fn terminate_kills_a_running_process() {
    let spec = ProcessSpec {
        argv: vec!["sleep".to_owned(), "30".to_owned()],
        env: Vec::new(),
        working_dir: None,
    };
    let mut process = HostProcess::spawn(&spec).expect("sleep should spawn");
    let pid = process.id().expect("running child has a pid");
    process.terminate().await;

    #[cfg(target_os = "linux")]
    assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    #[cfg(not(target_os = "linux"))]
    let _ = pid;
}
