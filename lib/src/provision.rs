use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::known_hosts::KnownHosts;
use crate::poll::{wait_for, PollOptions};
use crate::ssh::{Remote, Target};
use crate::types::{AddressKind, KeyPair, Node, ProvisionState};

/// Drives a single node from nothing to a launched, keyed, bootstrapped
/// instance with its volumes attached.
///
/// Steps run strictly in order and are never rolled back: a failure leaves
/// `node.state` at the last completed step.
#[derive(Clone)]
pub struct Provisioner {
    gateway: Arc<dyn Gateway>,
    remote: Arc<dyn Remote>,
    known_hosts: Arc<KnownHosts>,
    poll: PollOptions,
    cancel: CancellationToken,
}

impl Provisioner {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        remote: Arc<dyn Remote>,
        known_hosts: Arc<KnownHosts>,
        poll: PollOptions,
        cancel: CancellationToken,
    ) -> Self {
        Provisioner {
            gateway,
            remote,
            known_hosts,
            poll,
            cancel,
        }
    }

    pub async fn provision(&self, node: &mut Node, key_pair: &KeyPair) -> Result<()> {
        let key_data = key_data(&node.keys).await?;

        self.launch(node, key_pair).await?;
        self.wait_until_running(node).await?;
        self.trust_host(node, AddressKind::Transient).await?;
        self.install_keys(node, key_pair, &key_data).await?;
        self.bind_address(node).await?;
        self.trust_host(node, AddressKind::Elastic).await?;
        self.bootstrap(node).await?;
        self.attach_volumes(node).await?;

        info!(
            "{} is up at {}",
            node.name,
            node.host_name.as_deref().unwrap_or_default()
        );
        Ok(())
    }

    async fn launch(&self, node: &mut Node, key_pair: &KeyPair) -> Result<()> {
        let request = node.launch_request(key_pair);
        debug!("launch {}: {:?}", node.name, request);

        let instance_id = self.gateway.launch_instance(&request).await?;
        info!("launched {} for {}", instance_id, node.name);
        node.instance_id = Some(instance_id);
        advance(node, ProvisionState::Launching);
        Ok(())
    }

    async fn wait_until_running(&self, node: &mut Node) -> Result<()> {
        let instance_id = instance_id(node)?;
        let gateway = &self.gateway;

        wait_for(
            &format!("instance {} ({}) to start", instance_id, node.name),
            &self.poll,
            &self.cancel,
            || async move {
                let description = gateway.describe_instance(instance_id).await?;
                debug!("{}: {:?}", instance_id, description);
                Ok(description.is_running())
            },
        )
        .await?;

        let description = self.gateway.describe_instance(instance_id).await?;
        let dns_name = description
            .dns_name
            .ok_or_else(|| Error::IncompleteResponse(instance_id.to_string(), "a dns name"))?;

        node.host_name = Some(dns_name);
        advance(node, ProvisionState::Booting);
        Ok(())
    }

    async fn trust_host(&self, node: &mut Node, kind: AddressKind) -> Result<()> {
        if kind == AddressKind::Elastic && node.elastic_address.is_none() {
            // Still on the transient address, which is already trusted.
            advance(node, ProvisionState::HostTrusted(kind));
            return Ok(());
        }

        let host = host_name(node)?.to_string();
        let host = host.as_str();
        let known_hosts = &self.known_hosts;

        // sshd may come up well after the instance reports running
        wait_for(
            &format!("ssh host key of {}", host),
            &self.poll,
            &self.cancel,
            || async move {
                match known_hosts.update_for(host).await {
                    Ok(()) => Ok(true),
                    Err(Error::NoHostKey(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            },
        )
        .await?;
        advance(node, ProvisionState::HostTrusted(kind));
        Ok(())
    }

    async fn install_keys(&self, node: &mut Node, key_pair: &KeyPair, key_data: &str) -> Result<()> {
        let target = Target::new(&node.sudo_user, host_name(node)?).with_identity(&key_pair.path);

        self.remote
            .run(&target, "cat > .ssh/authorized_keys", Some(key_data))
            .await?;
        self.remote
            .run(
                &target,
                "sudo cp .ssh/authorized_keys /root/.ssh/authorized_keys",
                None,
            )
            .await?;

        advance(node, ProvisionState::KeyedIn);
        Ok(())
    }

    async fn bind_address(&self, node: &mut Node) -> Result<()> {
        match node.elastic_address.clone() {
            Some(address) => {
                self.gateway
                    .associate_address(&address, instance_id(node)?)
                    .await?;
                // Describe may lag behind the association; trust the address we bound.
                node.host_name = Some(address);
            }
            None => warn!(
                "{} has no elastic address, staying on {}",
                node.name,
                host_name(node)?
            ),
        }

        advance(node, ProvisionState::AddressBound);
        Ok(())
    }

    async fn bootstrap(&self, node: &mut Node) -> Result<()> {
        if let Some(script) = node.bootstrap_script.clone() {
            let basename = script
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .ok_or_else(|| {
                    Error::Declaration(format!("bootstrap script {}", script.display()))
                })?;
            let target = Target::root(host_name(node)?);

            self.remote.copy(&target, &script, "/tmp").await?;
            self.remote
                .run(
                    &target,
                    &format!("cd /tmp && chmod 700 {0} && ./{0}", basename),
                    None,
                )
                .await?;
        }

        advance(node, ProvisionState::Bootstrapped);
        Ok(())
    }

    async fn attach_volumes(&self, node: &mut Node) -> Result<()> {
        let instance_id = instance_id(node)?.to_string();

        for disk in &node.disks {
            let device = disk.device_path();
            match self
                .gateway
                .attach_volume(&disk.volume, &instance_id, &device)
                .await
            {
                Ok(()) => info!("attached {} to {} as {}", disk.volume, node.name, device),
                Err(Error::VolumeInUse(volume)) => {
                    warn!("{} is already attached, leaving it be", volume)
                }
                Err(e) => return Err(e),
            }
        }

        advance(node, ProvisionState::VolumesAttached);
        Ok(())
    }
}

/// Whether the node already runs, judged by its first declared volume
/// only. Nodes without volumes never count as running, and a detached
/// first volume hides a running instance behind later ones.
pub async fn is_running(gateway: &dyn Gateway, node: &Node) -> Result<bool> {
    match node.first_volume() {
        Some(volume) => gateway.volume_has_running_instance(volume).await,
        None => Ok(false),
    }
}

/// Public keys from every source file, one per line.
pub async fn key_data(keys: &[impl AsRef<Path>]) -> Result<String> {
    let mut lines = Vec::new();
    for key in keys {
        let content = tokio::fs::read_to_string(key.as_ref()).await?;
        lines.extend(content.lines().map(String::from));
    }
    Ok(lines.join("\n"))
}

fn advance(node: &mut Node, state: ProvisionState) {
    debug_assert!(state > node.state, "{} -> {}", node.state, state);
    debug!("{}: {} -> {}", node.name, node.state, state);
    node.state = state;
}

fn instance_id(node: &Node) -> Result<&str> {
    node.instance_id
        .as_deref()
        .ok_or_else(|| Error::NoInstance(node.name.clone()))
}

fn host_name(node: &Node) -> Result<&str> {
    node.host_name
        .as_deref()
        .ok_or_else(|| Error::NoAddress(node.name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_key_data_joins_lines_of_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.pub");
        let second = dir.path().join("second.pub");
        std::fs::write(&first, "ssh-ed25519 AAA one\nssh-ed25519 BBB two\n").unwrap();
        std::fs::write(&second, "ssh-rsa CCC three\n").unwrap();

        assert_eq!(
            key_data(&[first, second]).await.unwrap(),
            "ssh-ed25519 AAA one\nssh-ed25519 BBB two\nssh-rsa CCC three"
        );
    }

    #[tokio::test]
    async fn test_missing_key_file_is_an_error() {
        let err = key_data(&[Path::new("/nonexistent/key.pub")]).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
