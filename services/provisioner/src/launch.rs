//! Launch specification.
//!
//! Turns the deployment-level inputs of a VM request (resource pool,
//! networks, disk locality) into the flat parameters the provider expects.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use stratus_id::{ImageId, SecurityGroupId, SubnetId, VolumeId};

use crate::config::CloudOptions;
use crate::error::{CloudError, Result};
use crate::provider::{
    BlockDeviceMapping, EbsBlockDevice, InstanceRequest, NetworkInterface, Placement,
    SecurityGroupInfo, SpotInstanceRequest, SpotLaunchSpecification,
};
use crate::registry::EPHEMERAL_DEVICE;

const EPHEMERAL_VIRTUAL_NAME: &str = "ephemeral0";
const DEFAULT_VOLUME_TYPE: &str = "standard";

/// Networks by name. Ordered so "first network" is deterministic.
pub type NetworkSpecs = BTreeMap<String, NetworkSpec>;

/// One network a VM joins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub network_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    /// Nameservers, a single address or a list.
    #[serde(
        default,
        deserialize_with = "optional_one_or_many",
        skip_serializing_if = "Option::is_none"
    )]
    pub dns: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Vec<String>>,

    #[serde(default)]
    pub cloud_properties: NetworkCloudProperties,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkCloudProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,

    /// A single name or a list of names.
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub security_groups: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for Vec<String> {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(optional_one_or_many(deserializer)?.unwrap_or_default())
}

fn optional_one_or_many<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<OneOrMany>::deserialize(deserializer)?.map(Vec::from))
}

/// How a network is wired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkKind {
    /// Static IP in a subnet.
    Manual,
    Dynamic,
    /// Elastic IP; never places the instance.
    Vip,
    Other(String),
}

impl NetworkSpec {
    /// Classify by declared type. An untyped network with an IP or subnet
    /// is manual.
    pub fn kind(&self) -> NetworkKind {
        match self.network_type.as_deref() {
            Some("manual") => NetworkKind::Manual,
            Some("dynamic") => NetworkKind::Dynamic,
            Some("vip") => NetworkKind::Vip,
            Some(other) => NetworkKind::Other(other.to_string()),
            None if self.ip.is_some() || self.cloud_properties.subnet.is_some() => {
                NetworkKind::Manual
            }
            None => NetworkKind::Dynamic,
        }
    }
}

/// VM sizing and placement for a group of VMs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcePool {
    #[serde(default)]
    pub instance_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,

    /// Spot bid; on-demand when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_bid_price: Option<f64>,

    /// Load balancers to register with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub elbs: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_disk: Option<EphemeralDisk>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EphemeralDisk {
    /// MiB.
    pub size: u64,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub disk_type: Option<String>,
}

/// Everything needed to create one VM.
#[derive(Debug, Clone, PartialEq)]
pub struct VmRequest {
    pub agent_id: String,
    pub stemcell_id: ImageId,
    pub resource_pool: ResourcePool,
    pub networks: NetworkSpecs,
    pub disk_locality: Vec<VolumeId>,
    pub environment: Option<Value>,
}

/// Derived launch parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub image_id: ImageId,
    pub instance_type: String,
    pub key_name: Option<String>,
    pub security_groups: Vec<String>,
    pub availability_zone: Option<String>,
    pub subnet_id: Option<SubnetId>,
    pub private_ip_address: Option<String>,

    /// JSON text.
    pub user_data: String,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    pub spot_bid_price: Option<f64>,
    pub load_balancers: Vec<String>,
}

impl LaunchSpec {
    /// Build the spec. The availability zone is resolved by the caller.
    pub fn build(
        request: &VmRequest,
        options: &CloudOptions,
        registry_endpoint: &str,
        availability_zone: Option<String>,
    ) -> Result<Self> {
        let pool = &request.resource_pool;
        if pool.instance_type.trim().is_empty() {
            return Err(CloudError::invalid_argument(
                "resource pool must specify an instance type",
            ));
        }

        let (subnet_id, private_ip_address) = vpc_parameters(&request.networks)?;

        Ok(Self {
            image_id: request.stemcell_id.clone(),
            instance_type: pool.instance_type.clone(),
            key_name: key_name(pool, options),
            security_groups: security_groups(&request.networks, &options.default_security_groups),
            availability_zone,
            subnet_id,
            private_ip_address,
            user_data: user_data(registry_endpoint, &request.networks)?,
            block_device_mappings: block_device_mappings(pool),
            spot_bid_price: pool.spot_bid_price,
            load_balancers: pool.elbs.clone(),
        })
    }

    /// Flat on-demand parameters.
    pub fn to_instance_request(&self) -> InstanceRequest {
        InstanceRequest {
            image_id: self.image_id.clone(),
            count: 1,
            instance_type: self.instance_type.clone(),
            key_name: self.key_name.clone(),
            security_groups: self.security_groups.clone(),
            user_data: self.user_data.clone(),
            availability_zone: self.availability_zone.clone(),
            subnet_id: self.subnet_id.clone(),
            private_ip_address: self.private_ip_address.clone(),
            block_device_mappings: self.block_device_mappings.clone(),
        }
    }

    /// Spot request parameters. Groups must already be resolved to ids.
    pub fn to_spot_request(
        &self,
        price: f64,
        groups: Vec<SecurityGroupId>,
        valid_until: DateTime<Utc>,
    ) -> SpotInstanceRequest {
        SpotInstanceRequest {
            spot_price: price.to_string(),
            instance_count: 1,
            valid_until,
            launch_specification: SpotLaunchSpecification {
                image_id: self.image_id.clone(),
                key_name: self.key_name.clone(),
                instance_type: self.instance_type.clone(),
                user_data: BASE64.encode(self.user_data.as_bytes()),
                placement: self.availability_zone.clone().map(|availability_zone| Placement {
                    availability_zone,
                }),
                network_interfaces: vec![NetworkInterface {
                    subnet_id: self.subnet_id.clone(),
                    groups,
                    device_index: 0,
                    private_ip_address: self.private_ip_address.clone(),
                }],
                block_device_mappings: self.block_device_mappings.clone(),
            },
        }
    }
}

/// Unique security group names across non-vip networks, in first-seen
/// order, or `defaults` when no network names any.
pub fn security_groups(networks: &NetworkSpecs, defaults: &[String]) -> Vec<String> {
    let mut groups: Vec<String> = Vec::new();
    for network in networks.values() {
        if network.kind() == NetworkKind::Vip {
            continue;
        }
        for group in &network.cloud_properties.security_groups {
            if !groups.contains(group) {
                groups.push(group.clone());
            }
        }
    }

    if groups.is_empty() {
        defaults.to_vec()
    } else {
        groups
    }
}

/// Subnet and private IP. The IP comes from the first manual network; the
/// subnet from the first manual or dynamic network that names one.
pub fn vpc_parameters(networks: &NetworkSpecs) -> Result<(Option<SubnetId>, Option<String>)> {
    let mut subnet = None;
    let mut private_ip = None;

    for network in networks.values() {
        let kind = network.kind();
        if !matches!(kind, NetworkKind::Manual | NetworkKind::Dynamic) {
            continue;
        }
        if private_ip.is_none() && kind == NetworkKind::Manual {
            private_ip = network.ip.clone();
        }
        if subnet.is_none() {
            if let Some(raw) = &network.cloud_properties.subnet {
                subnet = Some(SubnetId::parse(raw)?);
            }
        }
    }

    Ok((subnet, private_ip))
}

/// Resource pool key, then the configured default.
pub fn key_name(pool: &ResourcePool, options: &CloudOptions) -> Option<String> {
    pool.key_name
        .clone()
        .or_else(|| options.default_key_name.clone())
}

/// The ephemeral disk mapping.
pub fn block_device_mappings(pool: &ResourcePool) -> Vec<BlockDeviceMapping> {
    let mapping = match &pool.ephemeral_disk {
        None => BlockDeviceMapping {
            device_name: EPHEMERAL_DEVICE.to_string(),
            virtual_name: Some(EPHEMERAL_VIRTUAL_NAME.to_string()),
            ebs: None,
        },
        Some(disk) => BlockDeviceMapping {
            device_name: EPHEMERAL_DEVICE.to_string(),
            virtual_name: None,
            ebs: Some(EbsBlockDevice {
                snapshot_id: None,
                volume_size_gib: Some(mib_to_gib(disk.size)),
                volume_type: Some(
                    disk.disk_type
                        .clone()
                        .unwrap_or_else(|| DEFAULT_VOLUME_TYPE.to_string()),
                ),
                delete_on_termination: true,
            }),
        },
    };
    vec![mapping]
}

/// MiB rounded up to whole GiB.
pub fn mib_to_gib(mib: u64) -> u32 {
    u32::try_from(mib.div_ceil(1024)).unwrap_or(u32::MAX)
}

#[derive(Serialize)]
struct UserData<'a> {
    registry: RegistryEndpoint<'a>,

    #[serde(skip_serializing_if = "Option::is_none")]
    dns: Option<Nameservers<'a>>,
}

#[derive(Serialize)]
struct RegistryEndpoint<'a> {
    endpoint: &'a str,
}

#[derive(Serialize)]
struct Nameservers<'a> {
    nameserver: &'a [String],
}

/// User data JSON: the registry endpoint, then the nameservers of the first
/// network that declares any.
pub fn user_data(registry_endpoint: &str, networks: &NetworkSpecs) -> Result<String> {
    let dns = networks
        .values()
        .find_map(|network| network.dns.as_deref())
        .map(|nameserver| Nameservers { nameserver });

    let data = UserData {
        registry: RegistryEndpoint {
            endpoint: registry_endpoint,
        },
        dns,
    };
    serde_json::to_string(&data)
        .map_err(|err| CloudError::cloud(format!("cannot encode user data: {err}")))
}

/// Translate group names to ids. Unknown names are an error.
pub fn resolve_group_ids(
    names: &[String],
    groups: &[SecurityGroupInfo],
) -> Result<Vec<SecurityGroupId>> {
    names
        .iter()
        .map(|name| {
            groups
                .iter()
                .find(|group| &group.name == name)
                .map(|group| group.id.clone())
                .ok_or_else(|| {
                    CloudError::invalid_argument(format!("unknown security group `{name}'"))
                })
        })
        .collect()
}
