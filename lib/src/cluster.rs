use std::error::Error as _;
use std::path::PathBuf;
use std::sync::Arc;

use colored::*;
use log::{error, info, warn};
use prettytable::{cell, row, Table};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::chef::{ConfigManager, LogLevel};
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::known_hosts::KnownHosts;
use crate::provision::{is_running, Provisioner};
use crate::types::{Cluster, KeyPair, Node, ProvisionState};

/// Pick the nodes named in a comma separated `filter`, in declaration order.
/// Without a filter every node is selected.
pub fn select_nodes(cluster: &Cluster, filter: Option<&str>) -> Result<Vec<Node>> {
    let wanted: Vec<&str> = match filter {
        Some(filter) => filter
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect(),
        None => return Ok(cluster.nodes.clone()),
    };

    let unknown: Vec<String> = wanted
        .iter()
        .filter(|name| !cluster.nodes.iter().any(|node| node.name == **name))
        .map(|name| name.to_string())
        .collect();
    if !unknown.is_empty() {
        return Err(Error::UnknownNodes(unknown));
    }

    Ok(cluster
        .nodes
        .iter()
        .filter(|node| wanted.contains(&node.name.as_str()))
        .cloned()
        .collect())
}

/// Banner printed before working on a node.
pub fn framed(message: &str) -> String {
    let border = "*".repeat(4 + message.len());
    format!("{}\n* {} *\n{}", border, message, border)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Provisioned { host_name: String },
    Configured,
    Refreshed { host_name: String },
    Updated,
    Skipped(String),
    Failed { state: ProvisionState, error: String },
}

impl Outcome {
    fn failed(state: ProvisionState, error: &Error) -> Self {
        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            message.push_str(&format!(": {}", cause));
            source = cause.source();
        }
        Outcome::Failed {
            state,
            error: message,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReport {
    pub name: String,
    pub outcome: Outcome,
}

/// Per-node results of one batch, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub action: String,
    pub nodes: Vec<NodeReport>,
}

impl BatchReport {
    fn new(action: &str) -> Self {
        BatchReport {
            action: action.to_string(),
            nodes: Vec::new(),
        }
    }

    fn push(&mut self, name: &str, outcome: Outcome) {
        if let Outcome::Failed { state, error } = &outcome {
            error!("{} failed at {}: {}", name, state, error);
        }
        self.nodes.push(NodeReport {
            name: name.to_string(),
            outcome,
        });
    }

    pub fn is_success(&self) -> bool {
        !self.nodes.iter().any(|node| node.outcome.is_failure())
    }

    pub fn failures(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|node| node.outcome.is_failure())
    }

    pub fn outcome_of(&self, name: &str) -> Option<&Outcome> {
        self.nodes
            .iter()
            .find(|node| node.name == name)
            .map(|node| &node.outcome)
    }

    pub fn table(&self) -> Table {
        let mut table = Table::new();
        table.add_row(row!["Node", self.action, "Detail"]);

        for node in &self.nodes {
            let (status, detail) = match &node.outcome {
                Outcome::Provisioned { host_name } => ("ok".green(), host_name.clone()),
                Outcome::Refreshed { host_name } => ("ok".green(), host_name.clone()),
                Outcome::Configured | Outcome::Updated => ("ok".green(), String::new()),
                Outcome::Skipped(reason) => ("skipped".yellow(), reason.clone()),
                Outcome::Failed { state, error } => {
                    ("failed".red(), format!("at {}: {}", state, error))
                }
            };
            table.add_row(row![node.name, status, detail]);
        }
        table
    }

    pub fn print(&self) {
        self.table().printstd();
    }
}

/// What a provisioning batch leaves behind: the report, and the nodes that
/// are up and ready to be configured, in declaration order.
#[derive(Debug)]
pub struct Provisioning {
    pub report: BatchReport,
    pub ready: Vec<Node>,
}

impl Default for Provisioning {
    fn default() -> Self {
        Provisioning {
            report: BatchReport::new("Provision"),
            ready: Vec::new(),
        }
    }
}

impl Provisioning {
    fn record(&mut self, node: Node, outcome: Outcome) {
        let ready = matches!(
            outcome,
            Outcome::Provisioned { .. } | Outcome::Skipped(_)
        );
        self.report.push(&node.name, outcome);
        if ready {
            self.ready.push(node);
        }
    }
}

enum Pending {
    Done(Node, Outcome),
    Running(String, JoinHandle<(Node, Outcome)>),
}

/// Applies batch actions to a selection of nodes. A failing node never
/// stops the others.
pub struct Coordinator {
    gateway: Arc<dyn Gateway>,
    known_hosts: Arc<KnownHosts>,
    provisioner: Provisioner,
    parallelism: usize,
    key_dir: PathBuf,
}

impl Coordinator {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        known_hosts: Arc<KnownHosts>,
        provisioner: Provisioner,
        parallelism: usize,
    ) -> Self {
        Coordinator {
            gateway,
            known_hosts,
            provisioner,
            parallelism: parallelism.max(1),
            key_dir: std::env::temp_dir(),
        }
    }

    pub fn with_key_dir(mut self, dir: PathBuf) -> Self {
        self.key_dir = dir;
        self
    }

    /// Launch every selected node that is not running yet.
    pub async fn run_provisioning(&self, nodes: Vec<Node>) -> Result<Provisioning> {
        let mut probed = Vec::with_capacity(nodes.len());
        for node in nodes {
            let running = is_running(self.gateway.as_ref(), &node).await;
            probed.push((node, running));
        }

        let mut run = Provisioning::default();
        if !probed.iter().any(|(_, running)| matches!(running, Ok(false))) {
            for (node, running) in probed {
                run.record(node, probe_outcome(running));
            }
            return Ok(run);
        }

        let key_pair = self.session_key_pair().await?;
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut pending: Vec<Pending> = Vec::new();

        for (node, running) in probed {
            if !matches!(running, Ok(false)) {
                let outcome = probe_outcome(running);
                pending.push(Pending::Done(node, outcome));
                continue;
            }

            let name = node.name.clone();
            let semaphore = Arc::clone(&semaphore);
            let provisioner = self.provisioner.clone();
            let key_pair = key_pair.clone();

            let handle = tokio::spawn(async move {
                let mut node = node;
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        let outcome = Outcome::Failed {
                            state: node.state,
                            error: e.to_string(),
                        };
                        return (node, outcome);
                    }
                };
                let outcome = match provisioner.provision(&mut node, &key_pair).await {
                    Ok(()) => Outcome::Provisioned {
                        host_name: node.host_name.clone().unwrap_or_default(),
                    },
                    Err(e) => Outcome::failed(node.state, &e),
                };
                (node, outcome)
            });
            pending.push(Pending::Running(name, handle));
        }

        for task in pending {
            match task {
                Pending::Done(node, outcome) => run.record(node, outcome),
                Pending::Running(name, handle) => match handle.await {
                    Ok((node, outcome)) => run.record(node, outcome),
                    Err(e) => run.report.push(
                        &name,
                        Outcome::Failed {
                            state: ProvisionState::Idle,
                            error: format!("provisioning task died: {}", e),
                        },
                    ),
                },
            }
        }

        self.discard_key_pair(&key_pair).await;
        Ok(run)
    }

    /// Run the configuration manager on every selected node, one after the
    /// other. A syntax error fails the whole batch before any node is touched.
    pub async fn run_configuration(
        &self,
        nodes: &[Node],
        chef: &dyn ConfigManager,
        level: LogLevel,
    ) -> Result<BatchReport> {
        chef.check_syntax().await?;

        let mut report = BatchReport::new("Configure");
        for node in nodes {
            info!("\n{}", framed(&format!("Running chef on '{}'", node.name)));
            let outcome = match chef.cook(node, level).await {
                Ok(()) => Outcome::Configured,
                Err(e) => Outcome::failed(node.state, &e),
            };
            report.push(&node.name, outcome);
        }
        Ok(report)
    }

    /// Refresh known-hosts entries of the selected nodes that are running.
    pub async fn refresh_known_hosts(&self, nodes: &[Node]) -> Result<BatchReport> {
        let mut report = BatchReport::new("Known hosts");
        for node in nodes {
            let outcome = match is_running(self.gateway.as_ref(), node).await {
                Ok(true) => match node.host_name.as_deref() {
                    Some(host) => match self.known_hosts.update_for(host).await {
                        Ok(()) => Outcome::Refreshed {
                            host_name: host.to_string(),
                        },
                        Err(e) => Outcome::failed(node.state, &e),
                    },
                    None => Outcome::Skipped("no elastic address".to_string()),
                },
                Ok(false) => Outcome::Skipped("not running".to_string()),
                Err(e) => Outcome::failed(node.state, &e),
            };
            report.push(&node.name, outcome);
        }
        Ok(report)
    }

    pub async fn update_chef(&self, nodes: &[Node], chef: &dyn ConfigManager) -> Result<BatchReport> {
        let mut report = BatchReport::new("Update chef");
        for node in nodes {
            info!("\n{}", framed(&format!("Updating chef on server {}", node.name)));
            let outcome = match chef.update(node).await {
                Ok(()) => Outcome::Updated,
                Err(e) => Outcome::failed(node.state, &e),
            };
            report.push(&node.name, outcome);
        }
        Ok(report)
    }

    async fn session_key_pair(&self) -> Result<KeyPair> {
        let name = session_key_name();

        let material = self.gateway.create_key_pair(&name).await?;
        match KeyPair::write(&name, &material, &self.key_dir) {
            Ok(key_pair) => Ok(key_pair),
            Err(e) => {
                if let Err(delete) = self.gateway.delete_key_pair(&name).await {
                    warn!("couldn't delete key pair {}: {}", name, delete);
                }
                Err(e)
            }
        }
    }

    async fn discard_key_pair(&self, key_pair: &KeyPair) {
        if let Err(e) = self.gateway.delete_key_pair(&key_pair.name).await {
            warn!("couldn't delete key pair {}: {}", key_pair.name, e);
        }
        if let Err(e) = key_pair.discard() {
            warn!("couldn't remove {}: {}", key_pair.path.display(), e);
        }
    }
}

fn session_key_name() -> String {
    format!("launchpad-{}", Uuid::new_v4())
}

fn probe_outcome(running: Result<bool>) -> Outcome {
    match running {
        Ok(true) => Outcome::Skipped("already running".to_string()),
        Ok(false) => Outcome::Skipped("not launched".to_string()),
        Err(e) => Outcome::failed(ProvisionState::Idle, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClusterDeclaration;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn cluster(names: &[&str]) -> Cluster {
        let nodes: Vec<_> = names
            .iter()
            .map(|name| serde_json::json!({ "name": name }))
            .collect();
        let decl: ClusterDeclaration = serde_json::from_value(serde_json::json!({
            "defaults": {
                "image_id": "ami-1", "instance_type": "m1.small",
                "security_group": "default", "availability_zone": "us-east-1a",
                "sudo_user": "ubuntu"
            },
            "nodes": nodes
        }))
        .unwrap();
        Cluster::from_declaration(decl, Path::new(".")).unwrap()
    }

    fn names(nodes: &[Node]) -> Vec<&str> {
        nodes.iter().map(|node| node.name.as_str()).collect()
    }

    #[test]
    fn test_select_keeps_declaration_order() {
        let cluster = cluster(&["alpha", "gamma", "beta"]);
        let selected = select_nodes(&cluster, Some("beta,alpha")).unwrap();
        assert_eq!(names(&selected), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_select_without_filter_takes_all() {
        let cluster = cluster(&["alpha", "beta"]);
        assert_eq!(names(&select_nodes(&cluster, None).unwrap()), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_select_ignores_blank_tokens() {
        let cluster = cluster(&["alpha", "beta"]);
        let selected = select_nodes(&cluster, Some(" beta , ,")).unwrap();
        assert_eq!(names(&selected), vec!["beta"]);
    }

    #[test]
    fn test_select_rejects_unknown_names() {
        let cluster = cluster(&["alpha"]);
        let err = select_nodes(&cluster, Some("alpha,omega")).unwrap_err();
        assert!(matches!(err, Error::UnknownNodes(ref names) if names == &["omega"]));
    }

    #[test]
    fn test_session_key_names_are_unique() {
        let first = session_key_name();
        assert!(first.starts_with("launchpad-"), "{}", first);
        assert_eq!(first.len(), "launchpad-".len() + 36);
        assert_ne!(first, session_key_name());
    }

    #[test]
    fn test_framed() {
        assert_eq!(
            framed("Running chef on 'web'"),
            "*************************\n* Running chef on 'web' *\n*************************"
        );
    }

    #[test]
    fn test_report_success() {
        let mut report = BatchReport::new("Provision");
        report.push("alpha", Outcome::Skipped("already running".into()));
        assert!(report.is_success());
        report.push(
            "beta",
            Outcome::Failed {
                state: ProvisionState::KeyedIn,
                error: "boom".into(),
            },
        );
        assert!(!report.is_success());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.table().len(), 3);
    }
}
