use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::ssh::{Remote, Target};
use crate::types::Node;
use crate::check_command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
        }
    }
}

/// The configuration-management run that takes over once a node is up.
#[async_trait]
pub trait ConfigManager: Send + Sync {
    /// Checked once before any node is touched.
    async fn check_syntax(&self) -> Result<()>;

    async fn cook(&self, node: &Node, level: LogLevel) -> Result<()>;

    /// Reinstall the configuration-management tool itself.
    async fn update(&self, node: &Node) -> Result<()>;
}

/// chef-solo fed from a local directory of cookbooks.
///
/// The directory is expected to hold `solo.rb` and a `nodes/<name>.json`
/// run list per node.
pub struct ChefSolo {
    dir: PathBuf,
    remote: Arc<dyn Remote>,
}

const REMOTE_DIR: &str = "/var/chef";

impl ChefSolo {
    pub fn new(dir: &Path, remote: Arc<dyn Remote>) -> Self {
        ChefSolo {
            dir: dir.to_path_buf(),
            remote,
        }
    }

    fn target(node: &Node) -> Result<Target> {
        node.host_name
            .as_deref()
            .map(Target::root)
            .ok_or_else(|| Error::NoAddress(node.name.clone()))
    }
}

pub fn solo_command(node: &Node, level: LogLevel) -> String {
    format!(
        "chef-solo -c {0}/solo.rb -j {0}/nodes/{1}.json -l {2}",
        REMOTE_DIR, node.name, level
    )
}

#[async_trait]
impl ConfigManager for ChefSolo {
    async fn check_syntax(&self) -> Result<()> {
        let recipes = ruby_files(&self.dir)?;

        tokio::task::spawn_blocking(move || {
            for recipe in recipes {
                let mut cmd = Command::new("ruby");
                cmd.arg("-c").arg(&recipe);
                check_command(cmd)
                    .map_err(|_| Error::SyntaxError(recipe.display().to_string()))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::LocalCommand {
            command: "ruby -c".to_string(),
            details: e.to_string(),
        })?
    }

    async fn cook(&self, node: &Node, level: LogLevel) -> Result<()> {
        let target = ChefSolo::target(node)?;

        self.remote
            .run(&target, &format!("rm -rf {}", REMOTE_DIR), None)
            .await?;
        self.remote.copy(&target, &self.dir, REMOTE_DIR).await?;
        self.remote
            .run(&target, &solo_command(node, level), None)
            .await
    }

    async fn update(&self, node: &Node) -> Result<()> {
        let target = ChefSolo::target(node)?;
        // explicit PATH keeps ruby version managers out of the way
        self.remote
            .run(
                &target,
                "PATH=/usr/sbin:/usr/bin:/sbin:/bin gem install chef --no-ri --no-rdoc",
                None,
            )
            .await
    }
}

/// Every `.rb` file below `dir`. Symlinked directories are not followed.
fn ruby_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().map_or(false, |ext| ext == "rb") {
            debug!("found recipe {}", path.display());
            found.push(path.to_path_buf());
        }
    }
    Ok(found)
}
