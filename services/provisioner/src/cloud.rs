//! Cloud facade: the operations a deployment orchestrator calls.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stratus_id::{ImageId, InstanceId, SnapshotId, SubnetId, VolumeId, VpcId};
use stratus_reconcile::{retry_on, BackoffPolicy, ProviderError, ProviderErrorKind};
use tracing::{info, warn};
use uuid::Uuid;

use crate::availability_zone::{AvailabilityZoneSelector, RegionZoneSelector};
use crate::config::CloudOptions;
use crate::error::{CloudError, Result};
use crate::instance_manager::InstanceManager;
use crate::launch::{mib_to_gib, security_groups, NetworkSpecs, ResourcePool, VmRequest};
use crate::provider::{
    BlockDeviceMapping, CloudProvider, EbsBlockDevice, RegisterImageRequest, SubnetRequest,
};
use crate::registry::{AgentSettings, SettingsRegistry, EPHEMERAL_DEVICE};
use crate::resources::{
    Attachment, AttachmentState, Image, ImageState, Snapshot, SnapshotState, Subnet, SubnetState,
    Volume, VolumeState,
};
use crate::wait::ResourceWait;

pub const MAX_TAG_KEY_LENGTH: usize = 127;
pub const MAX_TAG_VALUE_LENGTH: usize = 255;

const MIN_DISK_MIB: u64 = 1024;
const MAX_DISK_MIB: u64 = 1024 * 1000;

const DEFAULT_ROOT_DEVICE: &str = "/dev/sda1";
const STEMCELL_SNAPSHOT_DEVICE: &str = "/dev/sda";

const SNAPSHOT_TAG_KEYS: &[&str] = &["agent_id", "instance_id", "director_name", "director_uuid"];

/// Properties of a stemcell registered from a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StemcellProperties {
    pub name: Option<String>,
    pub version: Option<String>,
    pub architecture: Option<String>,
    pub kernel_id: Option<String>,
    pub root_device_name: Option<String>,
}

/// Cloud facade.
pub struct Cloud {
    provider: Arc<dyn CloudProvider>,
    registry: Arc<dyn SettingsRegistry>,
    zones: Arc<dyn AvailabilityZoneSelector>,
    instances: InstanceManager,
    waits: ResourceWait,
    options: CloudOptions,
}

impl Cloud {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        registry: Arc<dyn SettingsRegistry>,
        options: CloudOptions,
    ) -> Self {
        let zones = Arc::new(RegionZoneSelector::new(
            options.region.clone(),
            options.default_availability_zone.clone(),
        ));
        Self::with_zone_selector(provider, registry, zones, options)
    }

    pub fn with_zone_selector(
        provider: Arc<dyn CloudProvider>,
        registry: Arc<dyn SettingsRegistry>,
        zones: Arc<dyn AvailabilityZoneSelector>,
        options: CloudOptions,
    ) -> Self {
        let instances = InstanceManager::new(
            Arc::clone(&provider),
            Arc::clone(&registry),
            Arc::clone(&zones),
            options.clone(),
        );
        Self {
            waits: ResourceWait::new(options.waits.clone()),
            provider,
            registry,
            zones,
            instances,
            options,
        }
    }

    pub fn instances(&self) -> &InstanceManager {
        &self.instances
    }

    pub fn options(&self) -> &CloudOptions {
        &self.options
    }

    // ---------------------------------------------------------------------
    // VMs
    // ---------------------------------------------------------------------

    /// Create a VM and store its initial agent settings.
    pub async fn create_vm(
        &self,
        agent_id: &str,
        stemcell_id: &str,
        resource_pool: ResourcePool,
        networks: NetworkSpecs,
        disk_locality: &[String],
        environment: Option<Value>,
    ) -> Result<InstanceId> {
        let stemcell_id = ImageId::parse(stemcell_id)?;
        let image = match self.provider.describe_image(&stemcell_id).await {
            Ok(image) => image,
            Err(err) if err.is_not_found() => {
                return Err(CloudError::cloud(format!("no stemcell info for {stemcell_id}")))
            }
            Err(err) => return Err(err.into()),
        };
        let root_device_name = image
            .root_device_name
            .unwrap_or_else(|| DEFAULT_ROOT_DEVICE.to_string());

        let disk_locality = disk_locality
            .iter()
            .map(|id| VolumeId::parse(id))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let request = VmRequest {
            agent_id: agent_id.to_string(),
            stemcell_id,
            resource_pool,
            networks,
            disk_locality,
            environment,
        };

        info!(agent_id, "Creating new instance");
        let instance = self.instances.create(&request).await?;
        let id = instance.instance_id().clone();

        let settings = AgentSettings::initial(
            agent_id,
            &root_device_name,
            request.networks,
            request.environment,
            &self.options.agent,
        );
        if let Err(err) = self.registry.update_settings(id.as_str(), &settings).await {
            self.instances.compensate(&id).await;
            return Err(err);
        }

        info!(instance_id = %id, agent_id, "Instance is ready");
        Ok(id)
    }

    pub async fn delete_vm(&self, instance_id: &str) -> Result<()> {
        let id = InstanceId::parse(instance_id)?;
        self.instances
            .terminate(&id, self.options.fast_path_delete)
            .await
    }

    pub async fn has_vm(&self, instance_id: &str) -> Result<bool> {
        let id = InstanceId::parse(instance_id)?;
        self.instances.has_instance(&id).await
    }

    pub async fn reboot_vm(&self, instance_id: &str) -> Result<()> {
        let id = InstanceId::parse(instance_id)?;
        self.instances.reboot(&id).await
    }

    /// Tag the instance with `metadata`, plus `Name = job/index`.
    ///
    /// Tagging failures are logged and ignored.
    pub async fn set_vm_metadata(
        &self,
        instance_id: &str,
        metadata: &Map<String, Value>,
    ) -> Result<()> {
        let id = InstanceId::parse(instance_id)?;
        self.instances.find_instance(&id).await?;

        for (key, value) in metadata {
            self.tag(id.as_str(), key, &tag_value(value)).await;
        }

        if let (Some(job), Some(index)) = (metadata.get("job"), metadata.get("index")) {
            let name = format!("{}/{}", tag_value(job), tag_value(index));
            self.tag(id.as_str(), "Name", &name).await;
        }
        Ok(())
    }

    /// Update network settings. A change of security groups cannot be
    /// applied to a running instance.
    pub async fn configure_networks(&self, instance_id: &str, networks: NetworkSpecs) -> Result<()> {
        let id = InstanceId::parse(instance_id)?;
        let info = self.describe_instance(&id).await?;

        let mut actual = info.security_groups;
        actual.sort();
        let mut wanted = security_groups(&networks, &self.options.default_security_groups);
        wanted.sort();

        if actual != wanted {
            return Err(CloudError::NotSupported(format!(
                "security groups change requires VM recreation: {} to {}",
                actual.join(", "),
                wanted.join(", ")
            )));
        }

        let mut settings = self.registry.read_settings(id.as_str()).await?;
        settings.networks = networks;
        self.registry.update_settings(id.as_str(), &settings).await?;

        info!(instance_id = %id, "Configured networks");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Disks
    // ---------------------------------------------------------------------

    /// Create a volume of `size_mib`, in the zone of `instance_id` if given.
    pub async fn create_disk(&self, size_mib: u64, instance_id: Option<&str>) -> Result<VolumeId> {
        if size_mib < MIN_DISK_MIB {
            return Err(CloudError::cloud("minimum disk size is 1 GiB"));
        }
        if size_mib > MAX_DISK_MIB {
            return Err(CloudError::cloud("maximum disk size is 1 TiB"));
        }

        let instance_zone = match instance_id {
            Some(raw) => {
                let id = InstanceId::parse(raw)?;
                self.describe_instance(&id).await?.availability_zone
            }
            None => None,
        };
        let availability_zone = self
            .zones
            .select_availability_zone(instance_zone.as_deref());

        let size_gib = mib_to_gib(size_mib);
        let id = self
            .provider
            .create_volume(size_gib, &availability_zone)
            .await?;
        info!(volume_id = %id, size_gib, availability_zone = %availability_zone, "Creating volume");

        let volume = Volume::new(id.clone(), Arc::clone(&self.provider));
        self.waits.for_volume(&volume, VolumeState::Available).await?;
        Ok(id)
    }

    /// Delete an unattached volume.
    pub async fn delete_disk(&self, disk_id: &str) -> Result<()> {
        let id = VolumeId::parse(disk_id)?;
        let info = self
            .provider
            .describe_volume(&id)
            .await
            .map_err(|err| disk_not_found(&id, err))?;

        if VolumeState::from_provider(&info.state) != VolumeState::Available {
            return Err(CloudError::cloud(format!(
                "Cannot delete volume `{id}', state is {}",
                info.state
            )));
        }

        let policy = BackoffPolicy::exponential(2.0)
            .with_total(10)
            .with_max(32.0);
        retry_on(&[ProviderErrorKind::VolumeInUse], &policy, "delete volume", || {
            self.provider.delete_volume(&id)
        })
        .await
        .map_err(|err| disk_not_found(&id, err))?;

        info!(volume_id = %id, "Deleting volume");
        let volume = Volume::new(id.clone(), Arc::clone(&self.provider));
        self.waits.for_volume(&volume, VolumeState::Deleted).await?;

        info!(volume_id = %id, "Volume has been deleted");
        Ok(())
    }

    /// Attach a volume at the first free device and record it in settings.
    pub async fn attach_disk(&self, instance_id: &str, disk_id: &str) -> Result<String> {
        let instance = InstanceId::parse(instance_id)?;
        let volume = VolumeId::parse(disk_id)?;

        let info = self.describe_instance(&instance).await?;
        self.provider
            .describe_volume(&volume)
            .await
            .map_err(|err| disk_not_found(&volume, err))?;

        let device = match info
            .block_devices
            .iter()
            .find(|(_, attached)| **attached == volume)
        {
            Some((device, _)) => {
                info!(volume_id = %volume, instance_id = %instance, device = %device, "Volume is already attached");
                device.clone()
            }
            None => {
                let device = free_device(&info.block_devices)
                    .ok_or_else(|| CloudError::cloud("Instance has too many disks attached"))?;
                self.provider
                    .attach_volume(&volume, &instance, &device)
                    .await?;
                info!(volume_id = %volume, instance_id = %instance, device = %device, "Attaching volume");

                let attachment = Attachment::new(
                    volume.clone(),
                    instance.clone(),
                    device.clone(),
                    Arc::clone(&self.provider),
                );
                self.waits
                    .for_attachment(&attachment, AttachmentState::Attached)
                    .await?;
                device
            }
        };

        let mut settings = self.registry.read_settings(instance.as_str()).await?;
        settings
            .disks
            .persistent
            .insert(volume.to_string(), device.clone());
        self.registry
            .update_settings(instance.as_str(), &settings)
            .await?;

        info!(volume_id = %volume, instance_id = %instance, device = %device, "Attached volume");
        Ok(device)
    }

    /// Detach a volume. Settings are updated before the detach starts.
    pub async fn detach_disk(&self, instance_id: &str, disk_id: &str) -> Result<()> {
        let instance = InstanceId::parse(instance_id)?;
        let volume = VolumeId::parse(disk_id)?;

        let info = self.describe_instance(&instance).await?;
        let device = info
            .block_devices
            .iter()
            .find(|(_, attached)| **attached == volume)
            .map(|(device, _)| device.clone())
            .ok_or_else(|| CloudError::DiskNotAttached {
                instance_id: instance.to_string(),
                disk_id: volume.to_string(),
            })?;

        let mut settings = self.registry.read_settings(instance.as_str()).await?;
        settings.disks.persistent.remove(volume.as_str());
        self.registry
            .update_settings(instance.as_str(), &settings)
            .await?;

        match self.provider.detach_volume(&volume, &instance, &device).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                info!(volume_id = %volume, "Attachment is no longer found, assuming it to be detached");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        info!(volume_id = %volume, instance_id = %instance, "Detaching volume");

        let attachment = Attachment::new(volume.clone(), instance.clone(), device, Arc::clone(&self.provider));
        self.waits
            .for_attachment(&attachment, AttachmentState::Detached)
            .await?;

        info!(volume_id = %volume, instance_id = %instance, "Detached volume");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Snapshots and stemcells
    // ---------------------------------------------------------------------

    /// Snapshot a volume, described and tagged from `metadata`.
    pub async fn snapshot_disk(
        &self,
        disk_id: &str,
        metadata: &Map<String, Value>,
    ) -> Result<SnapshotId> {
        let volume = VolumeId::parse(disk_id)?;
        self.provider
            .describe_volume(&volume)
            .await
            .map_err(|err| disk_not_found(&volume, err))?;

        let description = ["deployment", "job", "index"]
            .iter()
            .filter_map(|key| metadata.get(*key).map(tag_value))
            .collect::<Vec<_>>()
            .join("/");
        let description = (!description.is_empty()).then_some(description);

        let id = self
            .provider
            .create_snapshot(&volume, description.as_deref())
            .await?;
        info!(snapshot_id = %id, volume_id = %volume, "Creating snapshot");

        let snapshot = Snapshot::new(id.clone(), Arc::clone(&self.provider));
        self.waits
            .for_snapshot(&snapshot, SnapshotState::Completed)
            .await?;

        for key in SNAPSHOT_TAG_KEYS {
            if let Some(value) = metadata.get(*key) {
                self.tag(id.as_str(), key, &tag_value(value)).await;
            }
        }
        if let Some(name) = &description {
            self.tag(id.as_str(), "Name", name).await;
        }

        Ok(id)
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let id = SnapshotId::parse(snapshot_id)?;
        self.provider.delete_snapshot(&id).await.map_err(|err| {
            if err.is_not_found() {
                CloudError::cloud(format!("snapshot `{id}' not found"))
            } else {
                err.into()
            }
        })?;
        info!(snapshot_id = %id, "Deleting snapshot");

        let snapshot = Snapshot::new(id, Arc::clone(&self.provider));
        self.waits
            .for_snapshot(&snapshot, SnapshotState::Deleted)
            .await
    }

    /// Register an image backed by `snapshot_id`.
    pub async fn create_stemcell_from_snapshot(
        &self,
        snapshot_id: &str,
        properties: &StemcellProperties,
    ) -> Result<ImageId> {
        let snapshot = SnapshotId::parse(snapshot_id)?;
        self.provider.describe_snapshot(&snapshot).await.map_err(|err| {
            if err.is_not_found() {
                CloudError::cloud(format!("snapshot `{snapshot}' not found"))
            } else {
                err.into()
            }
        })?;

        let description = match (&properties.name, &properties.version) {
            (Some(name), Some(version)) => Some(format!("{name} {version}")),
            _ => None,
        };
        let request = RegisterImageRequest {
            name: format!("BOSH-{}", Uuid::new_v4()),
            description: description.clone(),
            architecture: properties.architecture.clone(),
            kernel_id: properties.kernel_id.clone(),
            root_device_name: properties
                .root_device_name
                .clone()
                .unwrap_or_else(|| DEFAULT_ROOT_DEVICE.to_string()),
            block_device_mappings: vec![
                BlockDeviceMapping {
                    device_name: STEMCELL_SNAPSHOT_DEVICE.to_string(),
                    virtual_name: None,
                    ebs: Some(EbsBlockDevice {
                        snapshot_id: Some(snapshot.clone()),
                        volume_size_gib: None,
                        volume_type: None,
                        delete_on_termination: true,
                    }),
                },
                BlockDeviceMapping {
                    device_name: EPHEMERAL_DEVICE.to_string(),
                    virtual_name: Some("ephemeral0".to_string()),
                    ebs: None,
                },
            ],
        };

        let id = self.provider.register_image(&request).await?;
        info!(image_id = %id, snapshot_id = %snapshot, "Registering stemcell");

        let image = Image::new(id.clone(), Arc::clone(&self.provider));
        self.waits.for_image(&image, ImageState::Available).await?;

        if let Some(name) = &description {
            self.tag(id.as_str(), "Name", name).await;
        }
        Ok(id)
    }

    /// Deregister an image and delete the snapshots backing it.
    pub async fn delete_stemcell(&self, stemcell_id: &str) -> Result<()> {
        let id = ImageId::parse(stemcell_id)?;
        let image = self.provider.describe_image(&id).await.map_err(|err| {
            if err.is_not_found() {
                CloudError::cloud(format!("stemcell `{id}' not found"))
            } else {
                err.into()
            }
        })?;

        self.provider.deregister_image(&id).await?;
        info!(image_id = %id, "Deregistered stemcell");

        for snapshot_id in &image.snapshot_ids {
            info!(snapshot_id = %snapshot_id, "Cleaning up snapshot");
            self.provider.delete_snapshot(snapshot_id).await?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Networking
    // ---------------------------------------------------------------------

    pub async fn create_subnet(
        &self,
        vpc_id: &str,
        cidr_block: &str,
        availability_zone: Option<&str>,
    ) -> Result<SubnetId> {
        let request = SubnetRequest {
            vpc_id: VpcId::parse(vpc_id)?,
            cidr_block: cidr_block.to_string(),
            availability_zone: availability_zone.map(String::from),
        };

        let id = self.provider.create_subnet(&request).await?;
        info!(subnet_id = %id, cidr = cidr_block, "Creating subnet");

        let subnet = Subnet::new(id.clone(), Arc::clone(&self.provider));
        self.waits.for_subnet(&subnet, SubnetState::Available).await?;
        Ok(id)
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    async fn describe_instance(&self, id: &InstanceId) -> Result<crate::provider::InstanceInfo> {
        self.provider.describe_instance(id).await.map_err(|err| {
            if err.is_not_found() {
                CloudError::VmNotFound(id.to_string())
            } else {
                err.into()
            }
        })
    }

    async fn tag(&self, resource_id: &str, key: &str, value: &str) {
        let key = truncate(key, MAX_TAG_KEY_LENGTH);
        let value = truncate(value, MAX_TAG_VALUE_LENGTH);
        if let Err(err) = self.provider.create_tag(resource_id, &key, &value).await {
            warn!(resource_id, key = %key, error = %err, "Could not tag resource");
        }
    }
}

fn disk_not_found(id: &VolumeId, err: ProviderError) -> CloudError {
    if err.is_not_found() {
        CloudError::DiskNotFound(id.to_string())
    } else {
        err.into()
    }
}

/// First of `/dev/sdf` through `/dev/sdp` not in use.
fn free_device(in_use: &std::collections::BTreeMap<String, VolumeId>) -> Option<String> {
    ('f'..='p')
        .map(|letter| format!("/dev/sd{letter}"))
        .find(|device| !in_use.contains_key(device))
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn tag_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
