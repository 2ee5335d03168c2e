//! In-memory provider for tests and development.
//!
//! Every resource follows a scripted sequence of states: each describe call
//! consumes the next step, and the last state repeats once the script runs
//! out. [`MockStep::Vanish`] makes the resource disappear, after which the
//! provider answers not-found. Failures can be queued per operation and
//! every call is recorded.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use stratus_id::{
    ImageId, InstanceId, SecurityGroupId, SnapshotId, SpotRequestId, SubnetId, VolumeId, VpcId,
};
use stratus_reconcile::{ProviderError, ResourceKind};
use tracing::{debug, info};

use super::{
    CloudProvider, ImageInfo, InstanceInfo, InstanceRequest, ProviderResult,
    RegisterImageRequest, SecurityGroupInfo, SnapshotInfo, SpotInstanceRequest, SpotRequestInfo,
    SubnetInfo, SubnetRequest, VolumeInfo,
};

const DEFAULT_ZONE: &str = "us-east-1a";

/// Provider operations, for failure scripting and call recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DescribeImage,
    RegisterImage,
    DeregisterImage,
    RunInstance,
    DescribeInstance,
    TerminateInstance,
    RebootInstance,
    CreateTag,
    SecurityGroups,
    CreateSubnet,
    DescribeSubnet,
    RequestSpot,
    DescribeSpot,
    CancelSpot,
    RegisterLoadBalancer,
    DeregisterLoadBalancer,
    LoadBalancersForInstance,
    CreateVolume,
    DescribeVolume,
    DeleteVolume,
    AttachVolume,
    DetachVolume,
    AttachmentState,
    CreateSnapshot,
    DescribeSnapshot,
    DeleteSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub operation: Operation,
    pub target: String,
}

/// One step of a scripted resource lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockStep {
    State(String),
    Vanish,
}

impl MockStep {
    pub fn state(state: &str) -> Self {
        Self::State(state.to_string())
    }

    pub fn sequence(states: &[&str]) -> Vec<Self> {
        states.iter().map(|s| Self::state(s)).collect()
    }
}

/// One observed state of a spot request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotStep {
    pub state: String,
    pub status_code: Option<String>,
}

impl SpotStep {
    pub fn new(state: &str, status_code: Option<&str>) -> Self {
        Self {
            state: state.to_string(),
            status_code: status_code.map(String::from),
        }
    }

    pub fn open() -> Self {
        Self::new("open", Some("pending-evaluation"))
    }

    /// Fulfilled; the mock launches the instance on first observation.
    pub fn active() -> Self {
        Self::new("active", Some("fulfilled"))
    }

    pub fn price_too_low() -> Self {
        Self::new("open", Some("price-too-low"))
    }

    pub fn failed() -> Self {
        Self::new("failed", Some("bad-parameters"))
    }
}

#[derive(Debug)]
struct Tracked {
    current: String,
    pending: VecDeque<MockStep>,
}

impl Tracked {
    fn new(steps: Vec<MockStep>) -> Self {
        Self {
            current: "unknown".to_string(),
            pending: steps.into(),
        }
    }

    /// Consume the next step. `None` once the resource has vanished.
    fn observe(&mut self) -> Option<String> {
        match self.pending.pop_front() {
            Some(MockStep::State(state)) => {
                self.current = state;
                Some(self.current.clone())
            }
            Some(MockStep::Vanish) => None,
            None => Some(self.current.clone()),
        }
    }

    fn replace(&mut self, steps: Vec<MockStep>) {
        self.pending = steps.into();
    }
}

#[derive(Debug)]
struct MockInstance {
    tracked: Tracked,
    availability_zone: String,
    private_ip_address: Option<String>,
    security_groups: Vec<String>,
    block_devices: BTreeMap<String, VolumeId>,
}

#[derive(Debug)]
struct MockVolume {
    tracked: Tracked,
    size_gib: u32,
    availability_zone: String,
    attached_to: Option<InstanceId>,
}

#[derive(Debug)]
struct MockSnapshot {
    tracked: Tracked,
    volume_id: Option<VolumeId>,
    description: Option<String>,
}

#[derive(Debug)]
struct MockImage {
    tracked: Tracked,
    root_device_name: Option<String>,
    snapshot_ids: Vec<SnapshotId>,
}

#[derive(Debug)]
struct MockSubnet {
    tracked: Tracked,
    vpc_id: VpcId,
    cidr_block: String,
    availability_zone: Option<String>,
}

#[derive(Debug)]
struct MockSpot {
    pending: VecDeque<SpotStep>,
    current: SpotStep,
    request: SpotInstanceRequest,
    instance_id: Option<InstanceId>,
}

#[derive(Debug, Default)]
struct MockState {
    seq: u32,
    images: HashMap<ImageId, MockImage>,
    instances: HashMap<InstanceId, MockInstance>,
    volumes: HashMap<VolumeId, MockVolume>,
    snapshots: HashMap<SnapshotId, MockSnapshot>,
    subnets: HashMap<SubnetId, MockSubnet>,
    spots: HashMap<SpotRequestId, MockSpot>,
    attachments: HashMap<(VolumeId, InstanceId), Tracked>,
    security_groups: Vec<SecurityGroupInfo>,
    load_balancers: BTreeMap<String, BTreeSet<InstanceId>>,
    tags: HashMap<String, BTreeMap<String, String>>,
    scripts: HashMap<ResourceKind, VecDeque<Vec<MockStep>>>,
    spot_scripts: VecDeque<Vec<SpotStep>>,
    failures: HashMap<Operation, VecDeque<ProviderError>>,
    calls: Vec<RecordedCall>,
    instance_requests: Vec<InstanceRequest>,
    spot_requests: Vec<SpotInstanceRequest>,
}

impl MockState {
    fn next_seq(&mut self) -> u32 {
        self.seq += 1;
        self.seq
    }

    /// Record the call and pop a scripted failure, if any.
    fn enter(&mut self, operation: Operation, target: impl Into<String>) -> ProviderResult<()> {
        self.calls.push(RecordedCall {
            operation,
            target: target.into(),
        });
        match self.failures.get_mut(&operation).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn lifecycle(&mut self, kind: ResourceKind, default: &[&str]) -> Vec<MockStep> {
        self.scripts
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| MockStep::sequence(default))
    }

    fn launch(
        &mut self,
        availability_zone: Option<String>,
        private_ip_address: Option<String>,
        security_groups: Vec<String>,
    ) -> InstanceId {
        let id = InstanceId::from_seq(self.next_seq());
        let steps = self.lifecycle(ResourceKind::Instance, &["pending", "running"]);
        self.instances.insert(
            id.clone(),
            MockInstance {
                tracked: Tracked::new(steps),
                availability_zone: availability_zone.unwrap_or_else(|| DEFAULT_ZONE.to_string()),
                private_ip_address,
                security_groups,
                block_devices: BTreeMap::new(),
            },
        );
        id
    }

    fn group_names(&self, ids: &[SecurityGroupId]) -> Vec<String> {
        self.security_groups
            .iter()
            .filter(|group| ids.contains(&group.id))
            .map(|group| group.name.clone())
            .collect()
    }

    fn instance(&mut self, id: &InstanceId) -> ProviderResult<&mut MockInstance> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| ProviderError::not_found(format!("instance {id} does not exist")))
    }

    fn volume(&mut self, id: &VolumeId) -> ProviderResult<&mut MockVolume> {
        self.volumes
            .get_mut(id)
            .ok_or_else(|| ProviderError::not_found(format!("volume {id} does not exist")))
    }
}

/// In-memory [`CloudProvider`].
#[derive(Debug)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// Create an empty provider with a single `default` security group.
    pub fn new() -> Self {
        let provider = Self {
            state: Mutex::new(MockState::default()),
        };
        provider.add_security_group("default");
        provider
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---------------------------------------------------------------------
    // Seeding
    // ---------------------------------------------------------------------

    /// Register an available image.
    pub fn add_image(&self, root_device_name: &str) -> ImageId {
        self.add_image_with_snapshots(root_device_name, Vec::new())
    }

    pub fn add_image_with_snapshots(
        &self,
        root_device_name: &str,
        snapshot_ids: Vec<SnapshotId>,
    ) -> ImageId {
        let mut state = self.lock();
        let id = ImageId::from_seq(state.next_seq());
        state.images.insert(
            id.clone(),
            MockImage {
                tracked: Tracked::new(MockStep::sequence(&["available"])),
                root_device_name: Some(root_device_name.to_string()),
                snapshot_ids,
            },
        );
        id
    }

    pub fn add_security_group(&self, name: &str) -> SecurityGroupId {
        let mut state = self.lock();
        let id = SecurityGroupId::from_seq(state.next_seq());
        state.security_groups.push(SecurityGroupInfo {
            id: id.clone(),
            name: name.to_string(),
        });
        id
    }

    pub fn add_load_balancer(&self, name: &str) {
        self.lock()
            .load_balancers
            .entry(name.to_string())
            .or_default();
    }

    /// Add an available, unattached volume.
    pub fn add_volume(&self, size_gib: u32, availability_zone: &str) -> VolumeId {
        let mut state = self.lock();
        let id = VolumeId::from_seq(state.next_seq());
        state.volumes.insert(
            id.clone(),
            MockVolume {
                tracked: Tracked::new(MockStep::sequence(&["available"])),
                size_gib,
                availability_zone: availability_zone.to_string(),
                attached_to: None,
            },
        );
        id
    }

    pub fn add_snapshot(&self) -> SnapshotId {
        let mut state = self.lock();
        let id = SnapshotId::from_seq(state.next_seq());
        state.snapshots.insert(
            id.clone(),
            MockSnapshot {
                tracked: Tracked::new(MockStep::sequence(&["completed"])),
                volume_id: None,
                description: None,
            },
        );
        id
    }

    pub fn add_subnet(&self, availability_zone: &str) -> SubnetId {
        let mut state = self.lock();
        let seq = state.next_seq();
        let id = SubnetId::from_seq(seq);
        state.subnets.insert(
            id.clone(),
            MockSubnet {
                tracked: Tracked::new(MockStep::sequence(&["available"])),
                vpc_id: VpcId::from_seq(seq),
                cidr_block: "10.0.0.0/24".to_string(),
                availability_zone: Some(availability_zone.to_string()),
            },
        );
        id
    }

    /// Launch an instance outside of any request, already running.
    pub fn add_running_instance(&self, availability_zone: &str) -> InstanceId {
        let mut state = self.lock();
        let id = InstanceId::from_seq(state.next_seq());
        state.instances.insert(
            id.clone(),
            MockInstance {
                tracked: Tracked::new(MockStep::sequence(&["running"])),
                availability_zone: availability_zone.to_string(),
                private_ip_address: None,
                security_groups: vec!["default".to_string()],
                block_devices: BTreeMap::new(),
            },
        );
        id
    }

    // ---------------------------------------------------------------------
    // Scripting
    // ---------------------------------------------------------------------

    /// Lifecycle for the next transition of `kind`: creation, and also
    /// termination for instances and detach for attachments.
    pub fn script_next(&self, kind: ResourceKind, steps: Vec<MockStep>) {
        self.lock()
            .scripts
            .entry(kind)
            .or_default()
            .push_back(steps);
    }

    /// Observed states for the next spot request.
    pub fn script_next_spot(&self, steps: Vec<SpotStep>) {
        self.lock().spot_scripts.push_back(steps);
    }

    /// Replace the remaining lifecycle of an existing instance.
    pub fn script_instance(&self, id: &InstanceId, steps: Vec<MockStep>) {
        if let Some(instance) = self.lock().instances.get_mut(id) {
            instance.tracked.replace(steps);
        }
    }

    /// Replace the remaining lifecycle of an existing volume.
    pub fn script_volume(&self, id: &VolumeId, steps: Vec<MockStep>) {
        if let Some(volume) = self.lock().volumes.get_mut(id) {
            volume.tracked.replace(steps);
        }
    }

    /// Fail the next call to `operation` with `error`.
    pub fn fail_next(&self, operation: Operation, error: ProviderError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    // ---------------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------------

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    pub fn instance_requests(&self) -> Vec<InstanceRequest> {
        self.lock().instance_requests.clone()
    }

    pub fn spot_requests(&self) -> Vec<SpotInstanceRequest> {
        self.lock().spot_requests.clone()
    }

    pub fn tags(&self, resource_id: &str) -> BTreeMap<String, String> {
        self.lock()
            .tags
            .get(resource_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn load_balancer_members(&self, name: &str) -> Vec<InstanceId> {
        self.lock()
            .load_balancers
            .get(name)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_image(&self, id: &ImageId) -> bool {
        self.lock().images.contains_key(id)
    }

    pub fn has_snapshot(&self, id: &SnapshotId) -> bool {
        self.lock().snapshots.contains_key(id)
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    async fn describe_image(&self, id: &ImageId) -> ProviderResult<ImageInfo> {
        let mut state = self.lock();
        state.enter(Operation::DescribeImage, id.as_str())?;

        let Some(image) = state.images.get_mut(id) else {
            return Err(ProviderError::not_found(format!("image {id} does not exist")));
        };
        let Some(current) = image.tracked.observe() else {
            state.images.remove(id);
            return Err(ProviderError::not_found(format!("image {id} does not exist")));
        };

        Ok(ImageInfo {
            id: id.clone(),
            state: current,
            root_device_name: image.root_device_name.clone(),
            snapshot_ids: image.snapshot_ids.clone(),
        })
    }

    async fn register_image(&self, request: &RegisterImageRequest) -> ProviderResult<ImageId> {
        let mut state = self.lock();
        state.enter(Operation::RegisterImage, request.name.as_str())?;

        let id = ImageId::from_seq(state.next_seq());
        let steps = state.lifecycle(ResourceKind::Image, &["pending", "available"]);
        let snapshot_ids = request
            .block_device_mappings
            .iter()
            .filter_map(|mapping| mapping.ebs.as_ref()?.snapshot_id.clone())
            .collect();
        state.images.insert(
            id.clone(),
            MockImage {
                tracked: Tracked::new(steps),
                root_device_name: Some(request.root_device_name.clone()),
                snapshot_ids,
            },
        );

        info!(image_id = %id, name = %request.name, "[MOCK] Registered image");
        Ok(id)
    }

    async fn deregister_image(&self, id: &ImageId) -> ProviderResult<()> {
        let mut state = self.lock();
        state.enter(Operation::DeregisterImage, id.as_str())?;

        let Some(image) = state.images.get_mut(id) else {
            return Err(ProviderError::not_found(format!("image {id} does not exist")));
        };
        image.tracked.replace(vec![MockStep::Vanish]);

        info!(image_id = %id, "[MOCK] Deregistered image");
        Ok(())
    }

    async fn run_instance(&self, request: &InstanceRequest) -> ProviderResult<InstanceId> {
        let mut state = self.lock();
        state.enter(Operation::RunInstance, request.image_id.as_str())?;
        state.instance_requests.push(request.clone());

        let id = state.launch(
            request.availability_zone.clone(),
            request.private_ip_address.clone(),
            request.security_groups.clone(),
        );

        info!(
            instance_id = %id,
            image_id = %request.image_id,
            instance_type = %request.instance_type,
            "[MOCK] Launched instance"
        );
        Ok(id)
    }

    async fn describe_instance(&self, id: &InstanceId) -> ProviderResult<InstanceInfo> {
        let mut state = self.lock();
        state.enter(Operation::DescribeInstance, id.as_str())?;

        let instance = state.instance(id)?;
        let Some(current) = instance.tracked.observe() else {
            state.instances.remove(id);
            return Err(ProviderError::not_found(format!("instance {id} does not exist")));
        };

        debug!(instance_id = %id, state = %current, "[MOCK] Described instance");
        Ok(InstanceInfo {
            id: id.clone(),
            state: current,
            availability_zone: Some(instance.availability_zone.clone()),
            private_ip_address: instance.private_ip_address.clone(),
            security_groups: instance.security_groups.clone(),
            block_devices: instance.block_devices.clone(),
        })
    }

    async fn terminate_instance(&self, id: &InstanceId) -> ProviderResult<()> {
        let mut state = self.lock();
        state.enter(Operation::TerminateInstance, id.as_str())?;

        let steps = state.lifecycle(ResourceKind::Instance, &["shutting-down", "terminated"]);
        let instance = state.instance(id)?;
        instance.tracked.replace(steps);
        let volumes: Vec<VolumeId> = std::mem::take(&mut instance.block_devices)
            .into_values()
            .collect();

        for volume_id in volumes {
            state.attachments.remove(&(volume_id.clone(), id.clone()));
            if let Some(volume) = state.volumes.get_mut(&volume_id) {
                volume.attached_to = None;
                volume.tracked.replace(MockStep::sequence(&["available"]));
            }
        }

        info!(instance_id = %id, "[MOCK] Terminating instance");
        Ok(())
    }

    async fn reboot_instance(&self, id: &InstanceId) -> ProviderResult<()> {
        let mut state = self.lock();
        state.enter(Operation::RebootInstance, id.as_str())?;
        state.instance(id)?;

        info!(instance_id = %id, "[MOCK] Rebooting instance");
        Ok(())
    }

    async fn create_tag(&self, resource_id: &str, key: &str, value: &str) -> ProviderResult<()> {
        let mut state = self.lock();
        state.enter(Operation::CreateTag, resource_id)?;
        state
            .tags
            .entry(resource_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn security_groups(&self) -> ProviderResult<Vec<SecurityGroupInfo>> {
        let mut state = self.lock();
        state.enter(Operation::SecurityGroups, "")?;
        Ok(state.security_groups.clone())
    }

    async fn create_subnet(&self, request: &SubnetRequest) -> ProviderResult<SubnetId> {
        let mut state = self.lock();
        state.enter(Operation::CreateSubnet, request.vpc_id.as_str())?;

        let id = SubnetId::from_seq(state.next_seq());
        let steps = state.lifecycle(ResourceKind::Subnet, &["pending", "available"]);
        state.subnets.insert(
            id.clone(),
            MockSubnet {
                tracked: Tracked::new(steps),
                vpc_id: request.vpc_id.clone(),
                cidr_block: request.cidr_block.clone(),
                availability_zone: request.availability_zone.clone(),
            },
        );

        info!(subnet_id = %id, cidr = %request.cidr_block, "[MOCK] Created subnet");
        Ok(id)
    }

    async fn describe_subnet(&self, id: &SubnetId) -> ProviderResult<SubnetInfo> {
        let mut state = self.lock();
        state.enter(Operation::DescribeSubnet, id.as_str())?;

        let Some(subnet) = state.subnets.get_mut(id) else {
            return Err(ProviderError::not_found(format!("subnet {id} does not exist")));
        };
        let Some(current) = subnet.tracked.observe() else {
            state.subnets.remove(id);
            return Err(ProviderError::not_found(format!("subnet {id} does not exist")));
        };

        Ok(SubnetInfo {
            id: id.clone(),
            state: current,
            vpc_id: subnet.vpc_id.clone(),
            cidr_block: subnet.cidr_block.clone(),
            availability_zone: subnet.availability_zone.clone(),
        })
    }

    async fn request_spot_instance(
        &self,
        request: &SpotInstanceRequest,
    ) -> ProviderResult<SpotRequestId> {
        let mut state = self.lock();
        state.enter(Operation::RequestSpot, request.spot_price.as_str())?;
        state.spot_requests.push(request.clone());

        let id = SpotRequestId::from_seq(state.next_seq());
        let steps = state
            .spot_scripts
            .pop_front()
            .unwrap_or_else(|| vec![SpotStep::open(), SpotStep::active()]);
        state.spots.insert(
            id.clone(),
            MockSpot {
                pending: steps.into(),
                current: SpotStep::open(),
                request: request.clone(),
                instance_id: None,
            },
        );

        info!(spot_request_id = %id, price = %request.spot_price, "[MOCK] Requested spot instance");
        Ok(id)
    }

    async fn describe_spot_request(&self, id: &SpotRequestId) -> ProviderResult<SpotRequestInfo> {
        let mut state = self.lock();
        state.enter(Operation::DescribeSpot, id.as_str())?;

        let Some(spot) = state.spots.get_mut(id) else {
            return Err(ProviderError::not_found(format!(
                "spot request {id} does not exist"
            )));
        };
        if let Some(step) = spot.pending.pop_front() {
            spot.current = step;
        }

        let fulfil = spot.current.state == "active" && spot.instance_id.is_none();
        let current = spot.current.clone();
        let existing = spot.instance_id.clone();
        let spec = spot.request.launch_specification.clone();

        let instance_id = if fulfil {
            let interface = spec.network_interfaces.first();
            let groups = interface.map(|i| i.groups.clone()).unwrap_or_default();
            let names = state.group_names(&groups);
            let id_for_spot = state.launch(
                spec.placement.map(|p| p.availability_zone),
                interface.and_then(|i| i.private_ip_address.clone()),
                names,
            );
            if let Some(spot) = state.spots.get_mut(id) {
                spot.instance_id = Some(id_for_spot.clone());
            }
            info!(spot_request_id = %id, instance_id = %id_for_spot, "[MOCK] Fulfilled spot request");
            Some(id_for_spot)
        } else {
            existing
        };

        Ok(SpotRequestInfo {
            id: id.clone(),
            state: current.state,
            status_code: current.status_code,
            instance_id,
        })
    }

    async fn cancel_spot_request(&self, id: &SpotRequestId) -> ProviderResult<()> {
        let mut state = self.lock();
        state.enter(Operation::CancelSpot, id.as_str())?;

        let Some(spot) = state.spots.get_mut(id) else {
            return Err(ProviderError::not_found(format!(
                "spot request {id} does not exist"
            )));
        };
        spot.pending.clear();
        spot.current = SpotStep::new("cancelled", Some("canceled-before-fulfillment"));

        info!(spot_request_id = %id, "[MOCK] Cancelled spot request");
        Ok(())
    }

    async fn register_with_load_balancer(
        &self,
        load_balancer: &str,
        instance: &InstanceId,
    ) -> ProviderResult<()> {
        let mut state = self.lock();
        state.enter(Operation::RegisterLoadBalancer, load_balancer)?;

        let Some(members) = state.load_balancers.get_mut(load_balancer) else {
            return Err(ProviderError::not_found(format!(
                "load balancer {load_balancer} does not exist"
            )));
        };
        members.insert(instance.clone());
        Ok(())
    }

    async fn deregister_from_load_balancer(
        &self,
        load_balancer: &str,
        instance: &InstanceId,
    ) -> ProviderResult<()> {
        let mut state = self.lock();
        state.enter(Operation::DeregisterLoadBalancer, load_balancer)?;

        if let Some(members) = state.load_balancers.get_mut(load_balancer) {
            members.remove(instance);
        }
        Ok(())
    }

    async fn load_balancers_for_instance(
        &self,
        instance: &InstanceId,
    ) -> ProviderResult<Vec<String>> {
        let mut state = self.lock();
        state.enter(Operation::LoadBalancersForInstance, instance.as_str())?;

        Ok(state
            .load_balancers
            .iter()
            .filter(|(_, members)| members.contains(instance))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn create_volume(
        &self,
        size_gib: u32,
        availability_zone: &str,
    ) -> ProviderResult<VolumeId> {
        let mut state = self.lock();
        state.enter(Operation::CreateVolume, availability_zone)?;

        let id = VolumeId::from_seq(state.next_seq());
        let steps = state.lifecycle(ResourceKind::Volume, &["creating", "available"]);
        state.volumes.insert(
            id.clone(),
            MockVolume {
                tracked: Tracked::new(steps),
                size_gib,
                availability_zone: availability_zone.to_string(),
                attached_to: None,
            },
        );

        info!(volume_id = %id, size_gib, "[MOCK] Created volume");
        Ok(id)
    }

    async fn describe_volume(&self, id: &VolumeId) -> ProviderResult<VolumeInfo> {
        let mut state = self.lock();
        state.enter(Operation::DescribeVolume, id.as_str())?;

        let volume = state.volume(id)?;
        let Some(current) = volume.tracked.observe() else {
            state.volumes.remove(id);
            return Err(ProviderError::not_found(format!("volume {id} does not exist")));
        };

        Ok(VolumeInfo {
            id: id.clone(),
            state: current,
            size_gib: volume.size_gib,
            availability_zone: volume.availability_zone.clone(),
        })
    }

    async fn delete_volume(&self, id: &VolumeId) -> ProviderResult<()> {
        let mut state = self.lock();
        state.enter(Operation::DeleteVolume, id.as_str())?;

        let volume = state.volume(id)?;
        if let Some(instance) = &volume.attached_to {
            return Err(ProviderError::volume_in_use(format!(
                "volume {id} is attached to {instance}"
            )));
        }
        volume.tracked.replace(vec![MockStep::state("deleting"), MockStep::Vanish]);

        info!(volume_id = %id, "[MOCK] Deleting volume");
        Ok(())
    }

    async fn attach_volume(
        &self,
        volume: &VolumeId,
        instance: &InstanceId,
        device: &str,
    ) -> ProviderResult<()> {
        let mut state = self.lock();
        state.enter(Operation::AttachVolume, volume.as_str())?;

        if state.instance(instance)?.block_devices.contains_key(device) {
            return Err(ProviderError::other(format!(
                "device {device} is already in use on {instance}"
            )));
        }
        let record = state.volume(volume)?;
        if let Some(owner) = &record.attached_to {
            return Err(ProviderError::volume_in_use(format!(
                "volume {volume} is attached to {owner}"
            )));
        }
        record.attached_to = Some(instance.clone());
        record.tracked.replace(MockStep::sequence(&["in-use"]));

        state
            .instance(instance)?
            .block_devices
            .insert(device.to_string(), volume.clone());
        let steps = state.lifecycle(ResourceKind::Attachment, &["attaching", "attached"]);
        state
            .attachments
            .insert((volume.clone(), instance.clone()), Tracked::new(steps));

        info!(volume_id = %volume, instance_id = %instance, device, "[MOCK] Attaching volume");
        Ok(())
    }

    async fn detach_volume(
        &self,
        volume: &VolumeId,
        instance: &InstanceId,
        device: &str,
    ) -> ProviderResult<()> {
        let mut state = self.lock();
        state.enter(Operation::DetachVolume, volume.as_str())?;

        let key = (volume.clone(), instance.clone());
        if !state.attachments.contains_key(&key) {
            return Err(ProviderError::not_found(format!(
                "volume {volume} is not attached to {instance}"
            )));
        }

        state.instance(instance)?.block_devices.remove(device);
        if let Some(record) = state.volumes.get_mut(volume) {
            record.attached_to = None;
            record.tracked.replace(MockStep::sequence(&["available"]));
        }
        let steps = state
            .scripts
            .get_mut(&ResourceKind::Attachment)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| vec![MockStep::state("detaching"), MockStep::Vanish]);
        if let Some(attachment) = state.attachments.get_mut(&key) {
            attachment.replace(steps);
        }

        info!(volume_id = %volume, instance_id = %instance, device, "[MOCK] Detaching volume");
        Ok(())
    }

    async fn attachment_state(
        &self,
        volume: &VolumeId,
        instance: &InstanceId,
    ) -> ProviderResult<String> {
        let mut state = self.lock();
        state.enter(Operation::AttachmentState, volume.as_str())?;

        let key = (volume.clone(), instance.clone());
        let observed = state.attachments.get_mut(&key).map(Tracked::observe);
        match observed {
            Some(Some(current)) => Ok(current),
            Some(None) => {
                state.attachments.remove(&key);
                Err(ProviderError::not_found(format!(
                    "no attachment of {volume} to {instance}"
                )))
            }
            None => Err(ProviderError::not_found(format!(
                "no attachment of {volume} to {instance}"
            ))),
        }
    }

    async fn create_snapshot(
        &self,
        volume: &VolumeId,
        description: Option<&str>,
    ) -> ProviderResult<SnapshotId> {
        let mut state = self.lock();
        state.enter(Operation::CreateSnapshot, volume.as_str())?;
        state.volume(volume)?;

        let id = SnapshotId::from_seq(state.next_seq());
        let steps = state.lifecycle(ResourceKind::Snapshot, &["pending", "completed"]);
        state.snapshots.insert(
            id.clone(),
            MockSnapshot {
                tracked: Tracked::new(steps),
                volume_id: Some(volume.clone()),
                description: description.map(String::from),
            },
        );

        info!(snapshot_id = %id, volume_id = %volume, "[MOCK] Creating snapshot");
        Ok(id)
    }

    async fn describe_snapshot(&self, id: &SnapshotId) -> ProviderResult<SnapshotInfo> {
        let mut state = self.lock();
        state.enter(Operation::DescribeSnapshot, id.as_str())?;

        let Some(snapshot) = state.snapshots.get_mut(id) else {
            return Err(ProviderError::not_found(format!("snapshot {id} does not exist")));
        };
        let Some(current) = snapshot.tracked.observe() else {
            state.snapshots.remove(id);
            return Err(ProviderError::not_found(format!("snapshot {id} does not exist")));
        };

        Ok(SnapshotInfo {
            id: id.clone(),
            state: current,
            volume_id: snapshot.volume_id.clone(),
            description: snapshot.description.clone(),
        })
    }

    async fn delete_snapshot(&self, id: &SnapshotId) -> ProviderResult<()> {
        let mut state = self.lock();
        state.enter(Operation::DeleteSnapshot, id.as_str())?;

        let Some(snapshot) = state.snapshots.get_mut(id) else {
            return Err(ProviderError::not_found(format!("snapshot {id} does not exist")));
        };
        snapshot.tracked.replace(vec![MockStep::Vanish]);

        info!(snapshot_id = %id, "[MOCK] Deleting snapshot");
        Ok(())
    }
}
