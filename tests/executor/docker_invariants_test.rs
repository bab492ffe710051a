//! Docker backend isolation invariants.

use std::fs;
use std::path::PathBuf;

use warden::executor::runtime::docker::build_container_config;

use super::spec_fixture::sample_spec;

fn source(relative: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(relative);
    fs::read_to_string(&path).expect("source should load")
}

#[test]
fn create_request_is_locked_down() {
    let config = build_container_config(&sample_spec(None));
    let host = config.host_config.expect("host config set");

    assert_eq!(host.network_mode.as_deref(), Some("none"));
    assert_eq!(host.cap_drop, Some(vec!["ALL".to_owned()]));
    assert_eq!(host.security_opt, Some(vec!["no-new-privileges:true".to_owned()]));
    assert_eq!(host.readonly_rootfs, Some(true));
    assert_eq!(host.memory, Some(536_870_912));
    assert_eq!(host.nano_cpus, Some(1_500_000_000));
    assert_eq!(host.pids_limit, Some(128));

    let binds = host.binds.expect("binds set");
    assert!(binds.contains(&"/srv/acme/.warden/skills:/vault/.warden/skills:ro".to_owned()));
    assert!(binds.contains(&"warden-npm-cache:/home/agent/.npm".to_owned()));
    let tmpfs = host.tmpfs.expect("tmpfs set");
    assert_eq!(
        tmpfs.get("/vault/.warden/secrets").map(String::as_str),
        Some("ro,size=64k")
    );

    assert_eq!(config.env, Some(Vec::new()));
    assert_eq!(config.user.as_deref(), Some("agent"));
}

#[test]
fn create_request_joins_bridge_only_when_asked() {
    let config = build_container_config(&sample_spec(Some("warden-net")));
    let host = config.host_config.expect("host config set");
    assert_eq!(host.network_mode.as_deref(), Some("warden-net"));
}

#[test]
fn network_defaults_to_none_in_both_backends() {
    for file in ["src/executor/runtime/docker.rs", "src/executor/runtime/cli.rs"] {
        let source = source(file);
        assert!(
            source.contains(".unwrap_or_else(|| \"none\".to_owned())"),
            "{file} must default to no network"
        );
    }
}

#[test]
fn exec_attaches_stdio_over_the_api() {
    let source = source("src/executor/runtime/docker.rs");
    assert!(source.contains("attach_stdin: Some(true)"));
    assert!(source.contains("attach_stdout: Some(true)"));
    assert!(source.contains("attach_stderr: Some(true)"));
}

#[test]
fn every_container_goes_through_one_spec_builder() {
    let lifecycle = source("src/executor/lifecycle.rs");
    assert_eq!(lifecycle.matches("ContainerSpec {").count(), 1);
    assert!(lifecycle.contains("cap_drop: vec![\"ALL\".to_owned()]"));
    assert!(lifecycle.contains("read_only_rootfs: true"));
}

#[test]
fn cli_backend_never_pulls_images() {
    let source = source("src/executor/runtime/cli.rs");
    assert!(source.contains("\"--pull\".to_owned()"));
    assert!(source.contains("\"never\".to_owned()"));
}

#[test]
fn exec_is_tracked_and_terminate_signals_it() {
    let source = source("src/executor/runtime/docker.rs");
    assert!(source.contains("cmd: Some(handle.wrap(&spec.argv))"));
    assert!(source.contains("self.handle.kill_argv()"));
    assert!(source.contains("detach: true"));
}
