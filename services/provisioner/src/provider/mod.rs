//! Provider adapter boundary.
//!
//! Everything below this trait speaks the provider's API; everything above
//! it only sees [`ProviderError`] kinds and raw state strings. Adapters must
//! classify native failures before returning them.

mod mock;

pub use mock::{MockProvider, MockStep, Operation, RecordedCall, SpotStep};

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratus_id::{
    ImageId, InstanceId, SecurityGroupId, SnapshotId, SpotRequestId, SubnetId, VolumeId, VpcId,
};
use stratus_reconcile::ProviderError;

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: ImageId,
    pub state: String,
    pub root_device_name: Option<String>,
    pub snapshot_ids: Vec<SnapshotId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub state: String,
    pub availability_zone: Option<String>,
    pub private_ip_address: Option<String>,

    /// Security group names.
    pub security_groups: Vec<String>,

    /// Device name to attached volume.
    pub block_devices: BTreeMap<String, VolumeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub id: VolumeId,
    pub state: String,
    pub size_gib: u32,
    pub availability_zone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: SnapshotId,
    pub state: String,
    pub volume_id: Option<VolumeId>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetInfo {
    pub id: SubnetId,
    pub state: String,
    pub vpc_id: VpcId,
    pub cidr_block: String,
    pub availability_zone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityGroupInfo {
    pub id: SecurityGroupId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotRequestInfo {
    pub id: SpotRequestId,
    pub state: String,
    pub status_code: Option<String>,
    pub instance_id: Option<InstanceId>,
}

/// Block device mapping, shared by on-demand, spot and image requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    pub device_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ebs: Option<EbsBlockDevice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EbsBlockDevice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<SnapshotId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_size_gib: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,

    pub delete_on_termination: bool,
}

/// Flat on-demand launch parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub image_id: ImageId,
    pub count: u32,
    pub instance_type: String,
    pub key_name: Option<String>,
    pub security_groups: Vec<String>,

    /// JSON text.
    pub user_data: String,
    pub availability_zone: Option<String>,
    pub subnet_id: Option<SubnetId>,
    pub private_ip_address: Option<String>,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub availability_zone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub subnet_id: Option<SubnetId>,
    pub groups: Vec<SecurityGroupId>,
    pub device_index: u32,
    pub private_ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotLaunchSpecification {
    pub image_id: ImageId,
    pub key_name: Option<String>,
    pub instance_type: String,

    /// Base64 of the JSON user data.
    pub user_data: String,
    pub placement: Option<Placement>,
    pub network_interfaces: Vec<NetworkInterface>,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotInstanceRequest {
    /// Bid price rendered as text, e.g. `"0.15"`.
    pub spot_price: String,
    pub instance_count: u32,
    pub valid_until: DateTime<Utc>,
    pub launch_specification: SpotLaunchSpecification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterImageRequest {
    pub name: String,
    pub description: Option<String>,
    pub architecture: Option<String>,
    pub kernel_id: Option<String>,
    pub root_device_name: String,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetRequest {
    pub vpc_id: VpcId,
    pub cidr_block: String,
    pub availability_zone: Option<String>,
}

/// The provider API as seen by the provisioner.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    // Images

    async fn describe_image(&self, id: &ImageId) -> ProviderResult<ImageInfo>;

    async fn register_image(&self, request: &RegisterImageRequest) -> ProviderResult<ImageId>;

    async fn deregister_image(&self, id: &ImageId) -> ProviderResult<()>;

    // Instances

    async fn run_instance(&self, request: &InstanceRequest) -> ProviderResult<InstanceId>;

    async fn describe_instance(&self, id: &InstanceId) -> ProviderResult<InstanceInfo>;

    async fn terminate_instance(&self, id: &InstanceId) -> ProviderResult<()>;

    async fn reboot_instance(&self, id: &InstanceId) -> ProviderResult<()>;

    /// Tag any taggable resource by its id string.
    async fn create_tag(&self, resource_id: &str, key: &str, value: &str) -> ProviderResult<()>;

    async fn security_groups(&self) -> ProviderResult<Vec<SecurityGroupInfo>>;

    // Subnets

    async fn create_subnet(&self, request: &SubnetRequest) -> ProviderResult<SubnetId>;

    async fn describe_subnet(&self, id: &SubnetId) -> ProviderResult<SubnetInfo>;

    // Spot capacity

    async fn request_spot_instance(
        &self,
        request: &SpotInstanceRequest,
    ) -> ProviderResult<SpotRequestId>;

    async fn describe_spot_request(&self, id: &SpotRequestId) -> ProviderResult<SpotRequestInfo>;

    async fn cancel_spot_request(&self, id: &SpotRequestId) -> ProviderResult<()>;

    // Load balancers

    async fn register_with_load_balancer(
        &self,
        load_balancer: &str,
        instance: &InstanceId,
    ) -> ProviderResult<()>;

    async fn deregister_from_load_balancer(
        &self,
        load_balancer: &str,
        instance: &InstanceId,
    ) -> ProviderResult<()>;

    async fn load_balancers_for_instance(&self, instance: &InstanceId)
        -> ProviderResult<Vec<String>>;

    // Volumes

    async fn create_volume(&self, size_gib: u32, availability_zone: &str)
        -> ProviderResult<VolumeId>;

    async fn describe_volume(&self, id: &VolumeId) -> ProviderResult<VolumeInfo>;

    async fn delete_volume(&self, id: &VolumeId) -> ProviderResult<()>;

    async fn attach_volume(
        &self,
        volume: &VolumeId,
        instance: &InstanceId,
        device: &str,
    ) -> ProviderResult<()>;

    async fn detach_volume(
        &self,
        volume: &VolumeId,
        instance: &InstanceId,
        device: &str,
    ) -> ProviderResult<()>;

    /// Raw attachment status. Not-found once the attachment is gone.
    async fn attachment_state(
        &self,
        volume: &VolumeId,
        instance: &InstanceId,
    ) -> ProviderResult<String>;

    // Snapshots

    async fn create_snapshot(
        &self,
        volume: &VolumeId,
        description: Option<&str>,
    ) -> ProviderResult<SnapshotId>;

    async fn describe_snapshot(&self, id: &SnapshotId) -> ProviderResult<SnapshotInfo>;

    async fn delete_snapshot(&self, id: &SnapshotId) -> ProviderResult<()>;
}
