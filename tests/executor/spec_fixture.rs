//! Container spec fixture shared by backend rendering tests.

use std::collections::BTreeMap;
use std::path::PathBuf;

use warden::executor::runtime::{BindMount, ContainerSpec};

pub fn sample_spec(network: Option<&str>) -> ContainerSpec {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_owned(), "warden".to_owned());
    labels.insert("workspace".to_owned(), "acme".to_owned());
    let mut tmpfs = BTreeMap::new();
    tmpfs.insert("/tmp".to_owned(), "rw,size=512m".to_owned());
    tmpfs.insert("/vault/.warden/secrets".to_owned(), "ro,size=64k".to_owned());

    ContainerSpec {
        name: "warden-ws-acme".to_owned(),
        image: "warden-sandbox:latest".to_owned(),
        labels,
        memory_bytes: 536_870_912,
        nano_cpus: 1_500_000_000,
        pids_limit: 128,
        network: network.map(str::to_owned),
        binds: vec![
            BindMount {
                source: PathBuf::from("/srv/acme"),
                target: "/vault".to_owned(),
                read_only: false,
            },
            BindMount {
                source: PathBuf::from("/srv/acme/.warden/skills"),
                target: "/vault/.warden/skills".to_owned(),
                read_only: true,
            },
        ],
        volumes: vec![("warden-npm-cache".to_owned(), "/home/agent/.npm".to_owned())],
        tmpfs,
        cap_drop: vec!["ALL".to_owned()],
        security_opt: vec!["no-new-privileges:true".to_owned()],
        read_only_rootfs: true,
        user: "agent".to_owned(),
        working_dir: "/vault".to_owned(),
        command: vec!["sleep".to_owned(), "infinity".to_owned()],
    }
}
