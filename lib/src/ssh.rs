use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Who to log in as, where, and with which identity file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub user: String,
    pub host: String,
    pub identity: Option<PathBuf>,
}

impl Target {
    pub fn new(user: &str, host: &str) -> Self {
        Target {
            user: user.to_string(),
            host: host.to_string(),
            identity: None,
        }
    }

    pub fn root(host: &str) -> Self {
        Target::new("root", host)
    }

    pub fn with_identity(mut self, identity: &Path) -> Self {
        self.identity = Some(identity.to_path_buf());
        self
    }

    fn user_host(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[async_trait]
pub trait Remote: Send + Sync {
    /// Run `command` on the target, optionally feeding `stdin`. A non-zero
    /// exit status is an error.
    async fn run(&self, target: &Target, command: &str, stdin: Option<&str>) -> Result<()>;

    async fn copy(&self, target: &Target, local: &Path, remote_dir: &str) -> Result<()>;
}

#[async_trait]
pub trait HostKeyScanner: Send + Sync {
    /// Host key lines as `ssh-keyscan` prints them: `<host> <type> <key>`.
    async fn scan(&self, host: &str) -> Result<Vec<String>>;

    /// The numeric address `host` resolves to, when it differs from `host`.
    async fn alias(&self, host: &str) -> Option<String>;
}

/// Remote execution through the local `ssh` and `scp` binaries.
#[derive(Debug, Clone)]
pub struct OpenSsh {
    strict_host_key_checking: String,
    known_hosts: Option<PathBuf>,
}

impl Default for OpenSsh {
    fn default() -> Self {
        OpenSsh::new(true)
    }
}

impl OpenSsh {
    pub fn new(key_checking: bool) -> Self {
        let check = if key_checking { "yes" } else { "accept-new" };
        OpenSsh {
            strict_host_key_checking: check.to_string(),
            known_hosts: None,
        }
    }

    /// Verify host keys against `path` instead of the user's own file.
    pub fn with_known_hosts(mut self, path: &Path) -> Self {
        self.known_hosts = Some(path.to_path_buf());
        self
    }

    fn options(&self, target: &Target) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "NumberOfPasswordPrompts=0".into(),
            "-o".into(),
            "ServerAliveInterval=60".into(),
            "-o".into(),
            format!("StrictHostKeyChecking={}", self.strict_host_key_checking),
        ];

        if let Some(known_hosts) = &self.known_hosts {
            args.push("-o".into());
            args.push(format!("UserKnownHostsFile={}", known_hosts.display()));
        }

        if let Some(identity) = &target.identity {
            args.push("-i".into());
            args.push(identity.display().to_string());
        }
        args
    }
}

#[async_trait]
impl Remote for OpenSsh {
    async fn run(&self, target: &Target, command: &str, stdin: Option<&str>) -> Result<()> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.options(target))
            .arg(target.user_host())
            .arg(command);

        run_checked(cmd, &target.host, command, stdin).await
    }

    async fn copy(&self, target: &Target, local: &Path, remote_dir: &str) -> Result<()> {
        let mut cmd = Command::new("scp");
        cmd.args(self.options(target))
            .arg("-r")
            .arg(local)
            .arg(format!("{}:{}", target.user_host(), remote_dir));

        let description = format!("scp {} {}", local.display(), remote_dir);
        run_checked(cmd, &target.host, &description, None).await
    }
}

async fn run_checked(mut cmd: Command, host: &str, command: &str, stdin: Option<&str>) -> Result<()> {
    info!("run: {:?}", cmd);
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stderr(Stdio::piped());

    let failed = |details: String| Error::RemoteCommand {
        host: host.to_string(),
        command: command.to_string(),
        details,
    };

    let mut child = cmd.spawn().map_err(|e| failed(e.to_string()))?;

    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(data.as_bytes())
            .await
            .map_err(|e| failed(e.to_string()))?;
        pipe.write_all(b"\n")
            .await
            .map_err(|e| failed(e.to_string()))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| failed(e.to_string()))?;

    match output.status.code() {
        Some(0) => Ok(()),
        Some(_) => Err(failed(String::from_utf8_lossy(&output.stderr).trim().to_string())),
        None => Err(failed("interrupted".to_string())),
    }
}

/// Host key discovery through `ssh-keyscan`.
///
/// Keys come back ordered by `key_types`, most preferred first.
#[derive(Debug, Clone)]
pub struct KeyScan {
    key_types: Vec<String>,
}

impl Default for KeyScan {
    fn default() -> Self {
        KeyScan::new(&["ed25519", "rsa"])
    }
}

impl KeyScan {
    pub fn new(key_types: &[&str]) -> Self {
        KeyScan {
            key_types: key_types.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn preferred(&self, output: &str) -> Vec<String> {
        let mut keys: Vec<String> = output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(String::from)
            .collect();

        let rank = |line: &String| {
            let key_type = line.split_whitespace().nth(1).unwrap_or_default();
            self.key_types
                .iter()
                .position(|wanted| key_type.ends_with(wanted.as_str()))
                .unwrap_or(self.key_types.len())
        };
        keys.sort_by_key(rank);
        keys
    }
}

#[async_trait]
impl HostKeyScanner for KeyScan {
    async fn scan(&self, host: &str) -> Result<Vec<String>> {
        let mut cmd = Command::new("ssh-keyscan");
        cmd.arg("-t").arg(self.key_types.join(",")).arg(host);
        debug!("run: {:?}", cmd);

        let output = cmd.output().await.map_err(|e| Error::LocalCommand {
            command: format!("ssh-keyscan {}", host),
            details: e.to_string(),
        })?;

        let keys = self.preferred(&String::from_utf8_lossy(&output.stdout));

        if keys.is_empty() {
            return Err(Error::NoHostKey(host.to_string()));
        }
        Ok(keys)
    }

    async fn alias(&self, host: &str) -> Option<String> {
        let mut addrs = tokio::net::lookup_host((host, 22)).await.ok()?;
        let ip = addrs.next()?.ip().to_string();
        if ip == host {
            None
        } else {
            Some(ip)
        }
    }
}
