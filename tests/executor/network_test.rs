//! Bridge network provisioning.

use std::sync::Arc;
use std::time::Duration;

use warden::executor::network::NetworkIsolationManager;
use warden::executor::runtime::{ContainerRuntime, RuntimeError};
use warden::executor::SandboxError;

use super::fake_runtime::FakeRuntime;

fn manager(runtime: &Arc<FakeRuntime>) -> NetworkIsolationManager {
    let dyn_runtime: Arc<dyn ContainerRuntime> = Arc::clone(runtime) as Arc<dyn ContainerRuntime>;
    NetworkIsolationManager::new(dyn_runtime, "warden-net", Duration::from_secs(5))
}

#[tokio::test]
async fn concurrent_first_calls_create_once() {
    let runtime = FakeRuntime::new();
    let network = Arc::new(manager(&runtime));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let network = Arc::clone(&network);
        handles.push(tokio::spawn(async move { network.ensure_network().await }));
    }
    for handle in handles {
        handle.await.expect("task").expect("network ensured");
    }

    assert!(network.is_ready());
    assert_eq!(runtime.state().network_calls, 1);
    assert!(runtime.state().networks.contains("warden-net"));
}

#[tokio::test]
async fn later_calls_skip_the_runtime() {
    let runtime = FakeRuntime::new();
    let network = manager(&runtime);

    network.ensure_network().await.expect("first");
    network.ensure_network().await.expect("second");
    network.ensure_network().await.expect("third");

    assert_eq!(runtime.state().network_calls, 1);
}

#[tokio::test]
async fn existing_network_counts_as_success() {
    let runtime = FakeRuntime::new();
    runtime.state().networks.insert("warden-net".to_owned());
    let network = manager(&runtime);

    network.ensure_network().await.expect("already exists is fine");
    assert!(network.is_ready());
}

#[tokio::test]
async fn runtime_failure_is_named_and_retryable() {
    let runtime = FakeRuntime::new();
    runtime.state().network_error = Some(RuntimeError::Failed {
        operation: "network create".to_owned(),
        diagnostic: "pool overlaps with other one on this address space".to_owned(),
        exit_code: Some(1),
    });
    let network = manager(&runtime);

    let err = network.ensure_network().await.expect_err("should fail");
    match &err {
        SandboxError::NetworkProvisionFailed { network, diagnostic } => {
            assert_eq!(network, "warden-net");
            assert!(diagnostic.contains("pool overlaps"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!network.is_ready());

    runtime.state().network_error = None;
    network.ensure_network().await.expect("retry succeeds");
    assert_eq!(runtime.state().network_calls, 2);
}

#[tokio::test]
async fn unreachable_daemon_is_runtime_unavailable() {
    let runtime = FakeRuntime::new();
    runtime.state().unavailable = true;
    let network = manager(&runtime);

    let err = network.ensure_network().await.expect_err("should fail");
    assert_eq!(err.code(), "runtime_unavailable");
}
