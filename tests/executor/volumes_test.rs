//! Cache volume provisioning.

use std::sync::Arc;
use std::time::Duration;

use warden::executor::runtime::ContainerRuntime;
use warden::executor::volumes::{CacheVolumeManager, CACHE_VOLUMES};
use warden::executor::SandboxError;

use super::fake_runtime::FakeRuntime;

fn manager(runtime: &Arc<FakeRuntime>) -> CacheVolumeManager {
    let dyn_runtime: Arc<dyn ContainerRuntime> = Arc::clone(runtime) as Arc<dyn ContainerRuntime>;
    CacheVolumeManager::new(dyn_runtime, Duration::from_secs(5))
}

#[tokio::test]
async fn creates_every_cache_volume() {
    let runtime = FakeRuntime::new();
    manager(&runtime).ensure_volumes().await.expect("volumes");

    let state = runtime.state();
    for (name, _) in CACHE_VOLUMES {
        assert!(state.volumes.contains(*name), "missing {name}");
    }
}

#[tokio::test]
async fn existing_volumes_are_left_alone() {
    let runtime = FakeRuntime::new();
    let volumes = manager(&runtime);
    volumes.ensure_volumes().await.expect("first");
    volumes.ensure_volumes().await.expect("second");

    assert_eq!(runtime.state().volumes.len(), CACHE_VOLUMES.len());
}

#[tokio::test]
async fn every_failure_is_reported_after_attempting_all() {
    let runtime = FakeRuntime::new();
    {
        let mut state = runtime.state();
        state.volume_failures.insert("warden-npm-cache".to_owned());
        state.volume_failures.insert("warden-uv-cache".to_owned());
    }

    let err = manager(&runtime)
        .ensure_volumes()
        .await
        .expect_err("should fail");
    match err {
        SandboxError::VolumeProvisionFailed { failures } => {
            assert_eq!(failures.len(), 2);
            assert!(failures[0].starts_with("warden-npm-cache"));
            assert!(failures[1].starts_with("warden-uv-cache"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let state = runtime.state();
    assert_eq!(state.volume_calls, CACHE_VOLUMES.len());
    assert!(state.volumes.contains("warden-pip-cache"));
}

#[test]
fn mounts_cover_the_package_caches() {
    let mounts = CacheVolumeManager::mounts();
    let targets: Vec<&str> = mounts.iter().map(|(_, t)| t.as_str()).collect();
    assert_eq!(
        targets,
        vec!["/home/agent/.npm", "/home/agent/.cache/pip", "/home/agent/.cache/uv"]
    );
}
