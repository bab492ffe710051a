//! Container lifecycle: lazy creation, reuse, drift, reconciliation, teardown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use warden::config::Config;
use warden::executor::lifecycle::{
    config_hash, container_name, ContainerState, DEFAULT_CONTAINER_NAME, HASH_LABEL,
};
use warden::executor::{ResourceLimits, SandboxConfig, SandboxError};
use warden::session::{SessionRecord, SessionStore, Workspace};
use warden::trust::TrustMode;

use super::fake_runtime::{router_with, FakeRuntime};

fn workspace(dir: &tempfile::TempDir, slug: &str) -> Workspace {
    Workspace::new(slug, dir.path().join(slug))
}

fn sandbox_config(config: &Config, ws: Option<&Workspace>) -> SandboxConfig {
    SandboxConfig::resolve(&config.sandbox, ws, TrustMode::Sandboxed)
}

fn record(session_id: &str, container: &str) -> SessionRecord {
    SessionRecord::new(session_id, container, None)
}

#[test]
fn container_names_are_deterministic() {
    assert_eq!(container_name(Some("acme")), "warden-ws-acme");
    assert_eq!(container_name(None), DEFAULT_CONTAINER_NAME);
}

#[test]
fn config_hash_tracks_image_and_limits() {
    let limits = ResourceLimits {
        memory_mb: 2048,
        cpu_cores: 2.0,
        pids_limit: 256,
    };
    let base = config_hash("img:1", &limits);
    assert_eq!(base.len(), 12);
    assert_eq!(base, config_hash("img:1", &limits.clone()));
    assert_ne!(base, config_hash("img:2", &limits));
    assert_ne!(
        base,
        config_hash(
            "img:1",
            &ResourceLimits {
                memory_mb: 4096,
                ..limits.clone()
            }
        )
    );
    assert_ne!(
        base,
        config_hash(
            "img:1",
            &ResourceLimits {
                pids_limit: 128,
                ..limits
            }
        )
    );
}

#[tokio::test]
async fn ensure_is_lazy_and_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = FakeRuntime::new();
    let config = Config::default();
    let (router, _) = router_with(&runtime, &config, dir.path());
    let ws = workspace(&dir, "acme");
    let cfg = sandbox_config(&config, Some(&ws));

    assert!(runtime.state().created.is_empty());

    let first = router
        .lifecycle()
        .ensure_workspace_container(&ws, &cfg)
        .await
        .expect("first ensure");
    assert!(first.created);
    assert_eq!(first.name, "warden-ws-acme");
    assert_eq!(first.state, ContainerState::Running);

    let second = router
        .lifecycle()
        .ensure_workspace_container(&ws, &cfg)
        .await
        .expect("second ensure");
    assert!(!second.created);
    assert_eq!(second.config_hash(), first.config_hash());

    let state = runtime.state();
    assert_eq!(state.created.len(), 1);
    assert_eq!(state.started, vec!["warden-ws-acme".to_owned()]);
}

#[tokio::test]
async fn workspace_container_is_locked_down() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = FakeRuntime::new();
    let config = Config::default();
    let (router, _) = router_with(&runtime, &config, dir.path());
    let ws = workspace(&dir, "acme");

    router
        .lifecycle()
        .ensure_workspace_container(&ws, &sandbox_config(&config, Some(&ws)))
        .await
        .expect("ensure");

    let state = runtime.state();
    let spec = &state.created[0];
    assert_eq!(spec.labels.get("app").map(String::as_str), Some("warden"));
    assert_eq!(spec.labels.get("workspace").map(String::as_str), Some("acme"));
    assert_eq!(spec.labels.get("network").map(String::as_str), Some("off"));
    assert_eq!(spec.network, None);
    assert_eq!(spec.cap_drop, vec!["ALL".to_owned()]);
    assert_eq!(spec.security_opt, vec!["no-new-privileges:true".to_owned()]);
    assert!(spec.read_only_rootfs);
    assert_eq!(spec.user, "agent");
    assert_eq!(spec.memory_bytes, 2048 * 1024 * 1024);
    assert_eq!(spec.nano_cpus, 2_000_000_000);
    assert_eq!(spec.pids_limit, 256);

    let vault = &spec.binds[0];
    assert_eq!(vault.source, dir.path().join("acme"));
    assert_eq!(vault.target, "/vault");
    assert!(!vault.read_only);
    assert!(spec.binds[1..].iter().all(|b| b.read_only));
    assert_eq!(spec.binds[1].target, "/vault/.warden");
    assert_eq!(
        spec.tmpfs.get("/vault/.warden/secrets").map(String::as_str),
        Some("ro,size=64k")
    );
    assert!(spec.tmpfs.contains_key("/tmp"));

    assert_eq!(state.network_calls, 0, "network stays untouched when disabled");
    assert_eq!(state.volumes.len(), 3);
}

#[tokio::test]
async fn sandbox_cannot_write_capability_files_of_a_fresh_vault() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = FakeRuntime::new();
    let config = Config::default();
    let (router, _) = router_with(&runtime, &config, dir.path());
    let ws = workspace(&dir, "acme");

    router
        .lifecycle()
        .ensure_workspace_container(&ws, &sandbox_config(&config, Some(&ws)))
        .await
        .expect("ensure");

    let state = runtime.state();
    let spec = &state.created[0];
    for target in [
        "/vault/.warden/mcp.json",
        "/vault/.warden/INSTRUCTIONS.md",
        "/vault/.warden/skills/new-skill.md",
        "/vault/.warden/agents/new-agent.md",
    ] {
        let target = Path::new(target);
        let innermost = spec
            .binds
            .iter()
            .filter(|b| target.starts_with(&b.target))
            .max_by_key(|b| b.target.len())
            .expect("covered by some bind");
        assert!(
            innermost.read_only,
            "sandbox can write {} through {}",
            target.display(),
            innermost.target
        );
    }
}

#[tokio::test]
async fn network_enabled_workspace_joins_the_bridge() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = FakeRuntime::new();
    let config = Config::default();
    let (router, _) = router_with(&runtime, &config, dir.path());
    let mut ws = workspace(&dir, "acme");
    ws.network_enabled = true;

    router
        .lifecycle()
        .ensure_workspace_container(&ws, &sandbox_config(&config, Some(&ws)))
        .await
        .expect("ensure");

    let state = runtime.state();
    assert_eq!(state.created[0].network.as_deref(), Some("warden-net"));
    assert_eq!(state.created[0].labels.get("network").map(String::as_str), Some("on"));
    assert!(state.networks.contains("warden-net"));
}

#[tokio::test]
async fn default_container_is_labelled_by_type() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = FakeRuntime::new();
    let config = Config::default();
    let (router, _) = router_with(&runtime, &config, dir.path());

    let container = router
        .lifecycle()
        .ensure_default_container(&sandbox_config(&config, None))
        .await
        .expect("ensure");

    assert_eq!(container.name, "warden-default");
    assert_eq!(container.labels.get("type").map(String::as_str), Some("default"));
    assert!(!container.labels.contains_key("workspace"));
    assert_eq!(runtime.state().created[0].binds[0].source, dir.path());
}

#[tokio::test]
async fn concurrent_first_requests_create_one_container() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = Arc::new(FakeRuntime::with_delay(Some(Duration::from_millis(50))));
    let config = Config::default();
    let (router, _) = router_with(&runtime, &config, dir.path());
    let ws = workspace(&dir, "acme");

    let mut handles = Vec::new();
    for _ in 0..6 {
        let lifecycle = Arc::clone(router.lifecycle());
        let ws = ws.clone();
        let cfg = sandbox_config(&config, Some(&ws));
        handles.push(tokio::spawn(async move {
            lifecycle.ensure_workspace_container(&ws, &cfg).await
        }));
    }
    let mut created = 0;
    for handle in handles {
        let container = handle.await.expect("task").expect("ensure");
        if container.created {
            created += 1;
        }
    }

    assert_eq!(created, 1);
    assert_eq!(runtime.state().created.len(), 1);
}

#[tokio::test]
async fn missing_image_fails_with_a_named_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = FakeRuntime::new();
    runtime.state().images.clear();
    let config = Config::default();
    let (router, _) = router_with(&runtime, &config, dir.path());
    let ws = workspace(&dir, "acme");

    let err = router
        .lifecycle()
        .ensure_workspace_container(&ws, &sandbox_config(&config, Some(&ws)))
        .await
        .expect_err("should fail");

    assert!(matches!(&err, SandboxError::ImageMissing { image } if image == "warden-sandbox:latest"));
    assert!(err.to_string().contains("docker pull warden-sandbox:latest"));
    assert!(runtime.state().created.is_empty());
}

#[tokio::test]
async fn unreachable_runtime_is_reported_as_such() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = FakeRuntime::new();
    runtime.state().unavailable = true;
    let config = Config::default();
    let (router, _) = router_with(&runtime, &config, dir.path());

    let err = router
        .lifecycle()
        .ensure_default_container(&sandbox_config(&config, None))
        .await
        .expect_err("should fail");
    assert_eq!(err.code(), "runtime_unavailable");
}

#[tokio::test]
async fn changed_limits_replace_the_container_on_next_ensure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = FakeRuntime::new();
    let config = Config::default();
    let (router, _) = router_with(&runtime, &config, dir.path());
    let ws = workspace(&dir, "acme");
    let old = router
        .lifecycle()
        .ensure_workspace_container(&ws, &sandbox_config(&config, Some(&ws)))
        .await
        .expect("ensure");

    let mut bigger = Config::default();
    bigger.sandbox.memory_mb = 4096;
    let (router, _) = router_with(&runtime, &bigger, dir.path());
    let new = router
        .lifecycle()
        .ensure_workspace_container(&ws, &sandbox_config(&bigger, Some(&ws)))
        .await
        .expect("ensure");

    assert!(new.created);
    assert_ne!(new.config_hash(), old.config_hash());
    let state = runtime.state();
    assert_eq!(state.removed, vec!["warden-ws-acme".to_owned()]);
    assert_eq!(state.created.len(), 2);
}

#[tokio::test]
async fn stale_container_with_active_session_is_reused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = FakeRuntime::new();
    runtime.insert_container(
        "warden-ws-acme",
        &[("app", "warden"), ("workspace", "acme"), (HASH_LABEL, "000000000000"), ("network", "off")],
    );
    let config = Config::default();
    let (router, sessions) = router_with(&runtime, &config, dir.path());
    sessions
        .register(&record("s1", "warden-ws-acme"))
        .await
        .expect("register");
    let ws = workspace(&dir, "acme");

    let container = router
        .lifecycle()
        .ensure_workspace_container(&ws, &sandbox_config(&config, Some(&ws)))
        .await
        .expect("ensure");

    assert_eq!(container.state, ContainerState::Stale);
    assert!(!container.created);
    assert!(runtime.state().removed.is_empty());
}

#[tokio::test]
async fn reconcile_removes_drifted_containers_and_keeps_current_ones() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = FakeRuntime::new();
    let config = Config::default();
    let (router, _) = router_with(&runtime, &config, dir.path());
    router
        .lifecycle()
        .ensure_default_container(&sandbox_config(&config, None))
        .await
        .expect("ensure");
    runtime.insert_container(
        "warden-ws-old",
        &[("app", "warden"), ("workspace", "old"), (HASH_LABEL, "000000000000")],
    );
    runtime.insert_container("unrelated", &[("app", "other")]);

    let report = router.lifecycle().reconcile().await.expect("reconcile");

    assert_eq!(report.kept, vec!["warden-default".to_owned()]);
    assert_eq!(report.removed, vec!["warden-ws-old".to_owned()]);
    assert!(report.skipped.is_empty());
    assert!(runtime.state().containers.contains_key("unrelated"));
}

#[tokio::test]
async fn reconcile_skips_busy_containers_until_sessions_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = FakeRuntime::new();
    runtime.insert_container(
        "warden-ws-acme",
        &[("app", "warden"), ("workspace", "acme"), (HASH_LABEL, "000000000000")],
    );
    let config = Config::default();
    let (router, sessions) = router_with(&runtime, &config, dir.path());
    sessions
        .register(&record("s1", "warden-ws-acme"))
        .await
        .expect("register");

    let report = router.lifecycle().reconcile().await.expect("reconcile");
    assert_eq!(report.skipped, vec!["warden-ws-acme".to_owned()]);
    assert!(runtime.state().containers.contains_key("warden-ws-acme"));

    sessions.complete("s1").await.expect("complete");
    let report = router.lifecycle().reconcile().await.expect("reconcile");
    assert_eq!(report.removed, vec!["warden-ws-acme".to_owned()]);
    assert!(!runtime.state().containers.contains_key("warden-ws-acme"));
}

#[tokio::test]
async fn reconcile_reports_failed_removals_and_continues() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = FakeRuntime::new();
    runtime.insert_container(
        "warden-ws-a",
        &[("app", "warden"), (HASH_LABEL, "000000000000")],
    );
    runtime.insert_container(
        "warden-ws-b",
        &[("app", "warden"), (HASH_LABEL, "000000000000")],
    );
    runtime.state().remove_error = Some(warden::executor::runtime::RuntimeError::Failed {
        operation: "container rm".to_owned(),
        diagnostic: "device or resource busy".to_owned(),
        exit_code: Some(1),
    });
    let config = Config::default();
    let (router, _) = router_with(&runtime, &config, dir.path());

    let report = router.lifecycle().reconcile().await.expect("reconcile");
    assert_eq!(report.failed.len(), 2);
    assert!(report.failed[0].1.contains("resource busy"));
}

#[tokio::test]
async fn lock_entries_are_released_after_each_ensure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = FakeRuntime::new();
    let config = Config::default();
    let (router, _) = router_with(&runtime, &config, dir.path());
    for slug in ["a", "b", "c"] {
        let ws = workspace(&dir, slug);
        router
            .lifecycle()
            .ensure_workspace_container(&ws, &sandbox_config(&config, Some(&ws)))
            .await
            .expect("ensure");
    }
    assert!(router.lifecycle().locks().is_empty());

    let ws = workspace(&dir, "a");
    let lease = router
        .lifecycle()
        .lease(Some(&ws), &sandbox_config(&config, Some(&ws)))
        .await
        .expect("lease");
    assert_eq!(router.lifecycle().locks().len(), 1);
    drop(lease);
    assert!(router.lifecycle().locks().is_empty());

    runtime.state().unavailable = true;
    router
        .lifecycle()
        .ensure_workspace_container(&ws, &sandbox_config(&config, Some(&ws)))
        .await
        .expect_err("runtime down");
    assert!(router.lifecycle().locks().is_empty(), "failed ensure releases too");
}

#[tokio::test]
async fn reconcile_prunes_idle_locks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = FakeRuntime::new();
    let config = Config::default();
    let (router, _) = router_with(&runtime, &config, dir.path());
    let locks = router.lifecycle().locks();
    for key in ["a", "b"] {
        drop(locks.acquire(key).await);
    }
    assert_eq!(locks.len(), 2);

    router.lifecycle().reconcile().await.expect("reconcile");
    assert!(router.lifecycle().locks().is_empty());
}

#[tokio::test]
async fn teardown_refuses_while_sessions_are_active() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = FakeRuntime::new();
    let config = Config::default();
    let (router, sessions) = router_with(&runtime, &config, dir.path());
    let ws = workspace(&dir, "acme");
    router
        .lifecycle()
        .ensure_workspace_container(&ws, &sandbox_config(&config, Some(&ws)))
        .await
        .expect("ensure");
    sessions
        .register(&record("s1", "warden-ws-acme"))
        .await
        .expect("register");

    let err = router
        .lifecycle()
        .teardown(Some("acme"))
        .await
        .expect_err("busy");
    assert!(matches!(err, SandboxError::ContainerBusy { active: 1, .. }));

    sessions.complete("s1").await.expect("complete");
    let state = router.lifecycle().teardown(Some("acme")).await.expect("teardown");
    assert_eq!(state, ContainerState::Removed);
    let state = router.lifecycle().teardown(Some("acme")).await.expect("teardown");
    assert_eq!(state, ContainerState::Absent);
}

#[tokio::test]
async fn discard_defers_while_busy_then_replaces() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = FakeRuntime::new();
    let config = Config::default();
    let (router, sessions) = router_with(&runtime, &config, dir.path());
    let cfg = sandbox_config(&config, None);
    router
        .lifecycle()
        .ensure_default_container(&cfg)
        .await
        .expect("ensure");
    sessions
        .register(&record("s1", "warden-default"))
        .await
        .expect("register");

    router.lifecycle().discard("warden-default").await.expect("discard");
    assert!(runtime.state().removed.is_empty());

    let statuses = router.lifecycle().status().await.expect("status");
    assert_eq!(statuses[0].state, ContainerState::Stale);

    sessions.complete("s1").await.expect("complete");
    let replaced = router
        .lifecycle()
        .ensure_default_container(&cfg)
        .await
        .expect("ensure");
    assert!(replaced.created);
    assert_eq!(runtime.state().removed, vec!["warden-default".to_owned()]);

    let statuses = router.lifecycle().status().await.expect("status");
    assert_eq!(statuses[0].state, ContainerState::Running);
    assert_eq!(statuses[0].scope, "default");
}

#[tokio::test]
async fn discard_of_missing_container_is_ok() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = FakeRuntime::new();
    let config = Config::default();
    let (router, _) = router_with(&runtime, &config, dir.path());

    router.lifecycle().discard("warden-ws-gone").await.expect("discard");
    assert!(router.lifecycle().status().await.expect("status").is_empty());
}
