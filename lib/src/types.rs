use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use shellexpand::tilde;

use crate::error::{Error, Result};

/// Settings shared by every node of a cluster unless a node overrides them.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct NodeDefaults {
    pub image_id: Option<String>,
    pub instance_type: Option<String>,
    pub security_group: Option<String>,
    #[serde(alias = "zone")]
    pub availability_zone: Option<String>,
    pub sudo_user: Option<String>,
    #[serde(default)]
    pub keys: Vec<String>,
    pub bootstrap_script: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDeclaration {
    pub name: String,
    #[serde(rename = "ip", alias = "elastic_address")]
    pub elastic_address: Option<String>,
    pub image_id: Option<String>,
    pub instance_type: Option<String>,
    pub security_group: Option<String>,
    #[serde(alias = "zone")]
    pub availability_zone: Option<String>,
    pub sudo_user: Option<String>,
    pub keys: Option<Vec<String>>,
    pub bootstrap_script: Option<String>,
    #[serde(default)]
    pub disks: Vec<Disk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub device: String,
    pub volume: String,
}

impl Disk {
    /// Bare device names get the `/dev/` prefix, paths are kept as declared.
    pub fn device_path(&self) -> String {
        normalize_device(&self.device)
    }
}

pub fn normalize_device(device: &str) -> String {
    if device.contains('/') {
        device.to_string()
    } else {
        format!("/dev/{}", device)
    }
}

/// The on-disk form of a cluster, as read from the declaration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDeclaration {
    #[serde(default = "default_cluster_name")]
    pub name: String,
    #[serde(default)]
    pub defaults: NodeDefaults,
    pub nodes: Vec<NodeDeclaration>,
}

fn default_cluster_name() -> String {
    "default".to_string()
}

/// A declared provisioning target with every default resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub elastic_address: Option<String>,
    pub image_id: String,
    pub instance_type: String,
    pub security_group: String,
    pub availability_zone: String,
    pub sudo_user: String,
    pub keys: Vec<PathBuf>,
    pub bootstrap_script: Option<PathBuf>,
    pub disks: Vec<Disk>,
    /// The address currently believed reachable.
    pub host_name: Option<String>,
    pub instance_id: Option<String>,
    pub state: ProvisionState,
}

impl Node {
    fn resolve(decl: NodeDeclaration, defaults: &NodeDefaults, base: &Path) -> Result<Self> {
        let name = decl.name;
        let required = |value: Option<String>, fallback: &Option<String>, field| {
            value
                .or_else(|| fallback.clone())
                .ok_or_else(|| Error::MissingField {
                    node: name.clone(),
                    field,
                })
        };

        let image_id = required(decl.image_id, &defaults.image_id, "image_id")?;
        let instance_type = required(decl.instance_type, &defaults.instance_type, "instance_type")?;
        let security_group =
            required(decl.security_group, &defaults.security_group, "security_group")?;
        let availability_zone = required(
            decl.availability_zone,
            &defaults.availability_zone,
            "availability_zone",
        )?;
        let sudo_user = required(decl.sudo_user, &defaults.sudo_user, "sudo_user")?;

        let keys = decl
            .keys
            .unwrap_or_else(|| defaults.keys.clone())
            .iter()
            .map(|key| resolve_path(base, key))
            .collect();
        let bootstrap_script = decl
            .bootstrap_script
            .or_else(|| defaults.bootstrap_script.clone())
            .map(|script| resolve_path(base, &script));

        Ok(Node {
            host_name: decl.elastic_address.clone(),
            elastic_address: decl.elastic_address,
            image_id,
            instance_type: normalize_instance_type(&instance_type),
            security_group,
            availability_zone: normalize_zone(&availability_zone),
            sudo_user,
            keys,
            bootstrap_script,
            disks: decl.disks,
            instance_id: None,
            state: ProvisionState::Idle,
            name,
        })
    }

    pub fn launch_request(&self, key_pair: &KeyPair) -> LaunchRequest {
        LaunchRequest {
            image_id: self.image_id.clone(),
            instance_type: self.instance_type.clone(),
            zone: self.availability_zone.clone(),
            key_pair_name: key_pair.name.clone(),
            security_group: self.security_group.clone(),
        }
    }

    /// The volume consulted by the "already running" probe.
    pub fn first_volume(&self) -> Option<&str> {
        self.disks.first().map(|disk| disk.volume.as_str())
    }
}

fn resolve_path(base: &Path, path: &str) -> PathBuf {
    let expanded = PathBuf::from(tilde(path).to_string());
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

/// `us_east_1a` -> `us-east-1a`
pub fn normalize_zone(zone: &str) -> String {
    zone.replace('_', "-")
}

/// `m1_small` -> `m1.small`, `m2_2xlarge` -> `m2.2xlarge`
pub fn normalize_instance_type(instance_type: &str) -> String {
    if instance_type.contains('.') {
        instance_type.to_string()
    } else {
        instance_type.replacen('_', ".", 1)
    }
}

#[derive(Debug, Clone)]
pub struct Cluster {
    pub name: String,
    pub nodes: Vec<Node>,
}

impl Cluster {
    /// Read a cluster declaration. Relative key and script paths are
    /// resolved against the directory holding the file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::Declaration(format!("couldn't read {}: {}", path.display(), e))
        })?;
        let decl: ClusterDeclaration = serde_json::from_reader(BufReader::new(file))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Cluster::from_declaration(decl, base)
    }

    pub fn from_declaration(decl: ClusterDeclaration, base: &Path) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(decl.nodes.len());

        for node in decl.nodes {
            if !seen.insert(node.name.clone()) {
                return Err(Error::DuplicateNode(node.name));
            }
            nodes.push(Node::resolve(node, &decl.defaults, base)?);
        }

        Ok(Cluster {
            name: decl.name,
            nodes,
        })
    }
}

/// Ephemeral credential used to reach a freshly launched instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub name: String,
    pub path: PathBuf,
}

impl KeyPair {
    /// Write the private key with owner-only permissions, as ssh insists.
    pub fn write(name: &str, material: &str, dir: &Path) -> Result<Self> {
        use std::io::Write;
        #[cfg(unix)]
        use std::os::unix::fs::OpenOptionsExt;

        let path = dir.join(format!("{}.pem", name));
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&path)?;
        file.write_all(material.as_bytes())?;
        if !material.ends_with('\n') {
            file.write_all(b"\n")?;
        }

        Ok(KeyPair {
            name: name.to_string(),
            path,
        })
    }

    pub fn discard(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub image_id: String,
    pub instance_type: String,
    pub zone: String,
    pub key_pair_name: String,
    pub security_group: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Stopping,
    Stopped,
    Terminated,
    Unknown,
}

impl From<&str> for InstanceState {
    fn from(name: &str) -> Self {
        match name {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "shutting-down" => InstanceState::ShuttingDown,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            "terminated" => InstanceState::Terminated,
            _ => InstanceState::Unknown,
        }
    }
}

/// The provider's current view of an instance. Never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    pub state: InstanceState,
    pub dns_name: Option<String>,
    pub launch_time: Option<String>,
}

impl InstanceDescription {
    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Transient,
    Elastic,
}

/// Provisioning steps a node has completed. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    Idle,
    Launching,
    Booting,
    HostTrusted(AddressKind),
    KeyedIn,
    AddressBound,
    Bootstrapped,
    VolumesAttached,
}

impl ProvisionState {
    fn rank(&self) -> u8 {
        match self {
            ProvisionState::Idle => 0,
            ProvisionState::Launching => 1,
            ProvisionState::Booting => 2,
            ProvisionState::HostTrusted(AddressKind::Transient) => 3,
            ProvisionState::KeyedIn => 4,
            ProvisionState::AddressBound => 5,
            ProvisionState::HostTrusted(AddressKind::Elastic) => 6,
            ProvisionState::Bootstrapped => 7,
            ProvisionState::VolumesAttached => 8,
        }
    }
}

impl PartialOrd for ProvisionState {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProvisionState {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProvisionState::Idle => write!(f, "idle"),
            ProvisionState::Launching => write!(f, "launching"),
            ProvisionState::Booting => write!(f, "booting"),
            ProvisionState::HostTrusted(AddressKind::Transient) => {
                write!(f, "host trusted (transient)")
            }
            ProvisionState::HostTrusted(AddressKind::Elastic) => {
                write!(f, "host trusted (elastic)")
            }
            ProvisionState::KeyedIn => write!(f, "keyed in"),
            ProvisionState::AddressBound => write!(f, "address bound"),
            ProvisionState::Bootstrapped => write!(f, "bootstrapped"),
            ProvisionState::VolumesAttached => write!(f, "volumes attached"),
        }
    }
}
