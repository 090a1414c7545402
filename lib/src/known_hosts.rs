use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use shellexpand::tilde;
use tokio::{fs, sync::Mutex};

use crate::error::{Error, Result};
use crate::ssh::HostKeyScanner;

/// Keeps the local known-hosts file in line with the addresses nodes
/// currently answer on.
///
/// Entries are only ever pruned by exact host match and appended, so
/// unrelated lines survive untouched. Updates through one instance are
/// serialized.
pub struct KnownHosts {
    path: PathBuf,
    scanner: Arc<dyn HostKeyScanner>,
    lock: Mutex<()>,
}

impl KnownHosts {
    pub fn new(path: &Path, scanner: Arc<dyn HostKeyScanner>) -> Self {
        KnownHosts {
            path: path.to_path_buf(),
            scanner,
            lock: Mutex::new(()),
        }
    }

    /// `~/.ssh/known_hosts`
    pub fn default_path() -> PathBuf {
        PathBuf::from(tilde("~/.ssh/known_hosts").to_string())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace whatever is recorded for `host` with its current key.
    pub async fn update_for(&self, host: &str) -> Result<()> {
        let alias = self.scanner.alias(host).await;
        let scanned = self.scanner.scan(host).await?;
        let entry = fresh_entry(host, alias.as_deref(), &scanned)
            .ok_or_else(|| Error::NoHostKey(host.to_string()))?;

        let _guard = self.lock.lock().await;

        let current = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut stale = vec![host];
        stale.extend(alias.as_deref());
        let updated = replace_entries(&current, &stale, &entry);

        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("launchpad");
        fs::write(&tmp, updated).await?;
        fs::rename(&tmp, &self.path).await?;

        info!("updated {} for {}", self.path.display(), host);
        Ok(())
    }
}

/// Whether the leading host field of a known-hosts line names `host`.
fn names_host(line: &str, host: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return false;
    }
    let mut fields = trimmed.split_whitespace();
    let hosts = match fields.next() {
        Some(marker) if marker.starts_with('@') => fields.next(),
        first => first,
    };
    hosts.map_or(false, |hosts| hosts.split(',').any(|h| h == host))
}

/// Build the single entry recorded for `host` from scanner output: the
/// first scanned key, with the alias folded into the host field.
fn fresh_entry(host: &str, alias: Option<&str>, scanned: &[String]) -> Option<String> {
    let line = scanned.iter().find(|line| !line.trim().is_empty())?;
    let mut fields = line.split_whitespace();
    fields.next()?;
    let key_type = fields.next()?;
    let key = fields.next()?;

    let hosts = match alias {
        Some(alias) => format!("{},{}", host, alias),
        None => host.to_string(),
    };
    Some(format!("{} {} {}", hosts, key_type, key))
}

fn replace_entries(current: &str, stale: &[&str], entry: &str) -> String {
    let mut out: String = current
        .lines()
        .filter(|line| !stale.iter().any(|host| names_host(line, host)))
        .map(|line| format!("{}\n", line))
        .collect();
    out.push_str(entry);
    out.push('\n');
    out
}
