use async_trait::async_trait;
use log::debug;
use rusoto_core::{Region, RusotoError};
use rusoto_ec2::{
    AssociateAddressRequest, AttachVolumeRequest, CreateKeyPairRequest, DeleteKeyPairRequest,
    DescribeInstancesRequest, DescribeVolumesRequest, Ec2, Ec2Client, Placement,
    RunInstancesRequest,
};

use crate::error::{Error, Result};
use crate::types::{InstanceDescription, InstanceState, LaunchRequest};

/// The cloud provider operations provisioning relies on. Every call is a
/// single request/response against the provider's current view.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Starts provisioning asynchronously; the instance is not reachable yet.
    async fn launch_instance(&self, request: &LaunchRequest) -> Result<String>;

    async fn describe_instance(&self, instance_id: &str) -> Result<InstanceDescription>;

    /// Rebinds `address`. Later describes may still report the old
    /// transient address for a while.
    async fn associate_address(&self, address: &str, instance_id: &str) -> Result<()>;

    /// Fails with [`Error::VolumeInUse`] when the volume is already attached.
    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()>;

    async fn volume_has_running_instance(&self, volume_id: &str) -> Result<bool>;

    /// Returns the private key material of the new key pair.
    async fn create_key_pair(&self, name: &str) -> Result<String>;

    async fn delete_key_pair(&self, name: &str) -> Result<()>;
}

pub struct Ec2Gateway {
    client: Ec2Client,
}

impl Ec2Gateway {
    pub fn new(region: Region) -> Self {
        Ec2Gateway {
            client: Ec2Client::new(region),
        }
    }

    async fn instance(&self, instance_id: &str) -> Result<Option<rusoto_ec2::Instance>> {
        let request = DescribeInstancesRequest {
            instance_ids: Some(vec![instance_id.to_string()]),
            ..Default::default()
        };

        let response = match self.client.describe_instances(request).await {
            Ok(response) => response,
            // Fresh instances take a moment to show up in DescribeInstances.
            Err(RusotoError::Unknown(ref response))
                if response.body_as_str().contains("InvalidInstanceID.NotFound") =>
            {
                debug!("{} is not visible yet", instance_id);
                return Ok(None);
            }
            Err(e) => return Err(Error::provider("DescribeInstances", e)),
        };

        Ok(response
            .reservations
            .unwrap_or_default()
            .into_iter()
            .flat_map(|reservation| reservation.instances.unwrap_or_default())
            .next())
    }
}

fn state_of(instance: &rusoto_ec2::Instance) -> InstanceState {
    instance
        .state
        .as_ref()
        .and_then(|state| state.name.as_deref())
        .map(InstanceState::from)
        .unwrap_or(InstanceState::Unknown)
}

/// An instance the provider doesn't list yet is still pending.
fn description_of(instance: Option<rusoto_ec2::Instance>) -> InstanceDescription {
    match instance {
        Some(instance) => InstanceDescription {
            state: state_of(&instance),
            dns_name: instance.public_dns_name.filter(|name| !name.is_empty()),
            launch_time: instance.launch_time,
        },
        None => InstanceDescription {
            state: InstanceState::Pending,
            dns_name: None,
            launch_time: None,
        },
    }
}

#[async_trait]
impl Gateway for Ec2Gateway {
    async fn launch_instance(&self, request: &LaunchRequest) -> Result<String> {
        let run = RunInstancesRequest {
            image_id: Some(request.image_id.clone()),
            instance_type: Some(request.instance_type.clone()),
            key_name: Some(request.key_pair_name.clone()),
            security_groups: Some(vec![request.security_group.clone()]),
            placement: Some(Placement {
                availability_zone: Some(request.zone.clone()),
                ..Default::default()
            }),
            min_count: 1,
            max_count: 1,
            ..Default::default()
        };

        let reservation = self
            .client
            .run_instances(run)
            .await
            .map_err(|e| Error::provider("RunInstances", e))?;
        debug!("RunInstances: {:?}", reservation);

        reservation
            .instances
            .unwrap_or_default()
            .into_iter()
            .find_map(|instance| instance.instance_id)
            .ok_or_else(|| Error::IncompleteResponse("RunInstances".into(), "an instance id"))
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<InstanceDescription> {
        let instance = self.instance(instance_id).await?;
        debug!("DescribeInstances: {:?}", instance);
        Ok(description_of(instance))
    }

    async fn associate_address(&self, address: &str, instance_id: &str) -> Result<()> {
        let request = AssociateAddressRequest {
            public_ip: Some(address.to_string()),
            instance_id: Some(instance_id.to_string()),
            ..Default::default()
        };

        self.client
            .associate_address(request)
            .await
            .map_err(|e| Error::provider("AssociateAddress", e))?;
        Ok(())
    }

    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()> {
        let request = AttachVolumeRequest {
            device: device.to_string(),
            instance_id: instance_id.to_string(),
            volume_id: volume_id.to_string(),
            ..Default::default()
        };

        match self.client.attach_volume(request).await {
            Ok(attachment) => {
                debug!("AttachVolume: {:?}", attachment);
                Ok(())
            }
            Err(RusotoError::Unknown(ref response))
                if response.body_as_str().contains("VolumeInUse") =>
            {
                Err(Error::VolumeInUse(volume_id.to_string()))
            }
            Err(e) => Err(Error::provider("AttachVolume", e)),
        }
    }

    async fn volume_has_running_instance(&self, volume_id: &str) -> Result<bool> {
        let request = DescribeVolumesRequest {
            volume_ids: Some(vec![volume_id.to_string()]),
            ..Default::default()
        };

        let response = self
            .client
            .describe_volumes(request)
            .await
            .map_err(|e| Error::provider("DescribeVolumes", e))?;

        let attached = response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .flat_map(|volume| volume.attachments.unwrap_or_default())
            .find_map(|attachment| attachment.instance_id);

        match attached {
            Some(instance_id) => Ok(self
                .instance(&instance_id)
                .await?
                .map_or(false, |instance| state_of(&instance) == InstanceState::Running)),
            None => Ok(false),
        }
    }

    async fn create_key_pair(&self, name: &str) -> Result<String> {
        let request = CreateKeyPairRequest {
            key_name: name.to_string(),
            ..Default::default()
        };

        let key_pair = self
            .client
            .create_key_pair(request)
            .await
            .map_err(|e| Error::provider("CreateKeyPair", e))?;

        key_pair
            .key_material
            .ok_or_else(|| Error::IncompleteResponse("CreateKeyPair".into(), "key material"))
    }

    async fn delete_key_pair(&self, name: &str) -> Result<()> {
        let request = DeleteKeyPairRequest {
            key_name: Some(name.to_string()),
            ..Default::default()
        };

        self.client
            .delete_key_pair(request)
            .await
            .map_err(|e| Error::provider("DeleteKeyPair", e))?;
        Ok(())
    }
}
