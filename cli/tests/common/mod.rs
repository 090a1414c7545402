#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Result;
use assert_cmd::prelude::*;

/// Expands to a test running `launchpad` with the given arguments and
/// expecting it to fail with `$expected` somewhere on stderr.
#[macro_export]
macro_rules! test {
    ($name:ident: $($arg:literal)* ; should fail with $expected:literal) => {
        #[test]
        fn $name() -> anyhow::Result<()> {
            use assert_cmd::prelude::*;

            let dir = tempfile::tempdir()?;
            let cluster = $crate::common::write_cluster(dir.path())?;
            $crate::common::launchpad(dir.path())?
                .arg("--cluster-file")
                .arg(&cluster)
                .args(&[$($arg),*])
                .assert()
                .failure()
                .stderr(predicates::str::contains($expected));
            Ok(())
        }
    };
}

/// The binary with a clean environment, run from `dir`.
pub fn launchpad(dir: &Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin("launchpad")?;
    cmd.current_dir(dir)
        .env_remove("LAUNCHPAD_CLUSTER")
        .env_remove("LAUNCHPAD_PARALLEL")
        .env("AWS_DEFAULT_REGION", "eu-west-1")
        .env("LAUNCHPAD_KNOWN_HOSTS", dir.join("known_hosts"));
    Ok(cmd)
}

pub const CLUSTER: &str = r#"{
    "name": "staging",
    "defaults": {
        "image_id": "ami-2fc2e95b",
        "instance_type": "m1_small",
        "security_group": "default",
        "availability_zone": "eu_west_1a",
        "sudo_user": "ubuntu",
        "keys": ["admin.pub"]
    },
    "nodes": [
        { "name": "alpha", "ip": "46.51.1.1", "disks": [{ "device": "sdf", "volume": "vol-aaaa" }] },
        { "name": "beta", "ip": "46.51.1.2" }
    ]
}"#;

pub fn write_cluster(dir: &Path) -> Result<PathBuf> {
    write(dir, "cluster.json", CLUSTER)
}

pub fn write(dir: &Path, name: &str, content: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, content)?;
    Ok(path)
}
