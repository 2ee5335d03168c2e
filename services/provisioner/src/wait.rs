//! Per-kind waits built on the shared poller.
//!
//! Every wait tolerates service-unavailable and rate-limited errors. While
//! waiting for a creation target a not-found error means "not visible yet";
//! while waiting for a deletion or detach target it means "done".

use stratus_reconcile::{wait_for, Observable, ProviderErrorKind, TerminalStates};
use tracing::info;

use crate::config::{WaitPolicies, WaitPolicy};
use crate::error::Result;
use crate::resources::{
    Attachment, AttachmentState, Image, ImageState, Instance, InstanceState, Snapshot,
    SnapshotState, Subnet, SubnetState, Volume, VolumeState,
};

/// Resource waits with per-kind backoff policies.
#[derive(Debug, Clone, Default)]
pub struct ResourceWait {
    policies: WaitPolicies,
}

impl ResourceWait {
    pub fn new(policies: WaitPolicies) -> Self {
        Self { policies }
    }

    pub async fn for_instance(&self, instance: &Instance, target: InstanceState) -> Result<()> {
        converge(instance, instance_states(target), self.policies.instance).await
    }

    pub async fn for_volume(&self, volume: &Volume, target: VolumeState) -> Result<()> {
        converge(volume, volume_states(target), self.policies.volume).await
    }

    pub async fn for_snapshot(&self, snapshot: &Snapshot, target: SnapshotState) -> Result<()> {
        converge(snapshot, snapshot_states(target), self.policies.snapshot).await
    }

    pub async fn for_image(&self, image: &Image, target: ImageState) -> Result<()> {
        converge(image, image_states(target), self.policies.image).await
    }

    pub async fn for_subnet(&self, subnet: &Subnet, target: SubnetState) -> Result<()> {
        converge(subnet, subnet_states(target), self.policies.subnet).await
    }

    pub async fn for_attachment(
        &self,
        attachment: &Attachment,
        target: AttachmentState,
    ) -> Result<()> {
        converge(attachment, attachment_states(target), self.policies.attachment).await
    }
}

async fn converge<R: Observable>(
    resource: &R,
    states: TerminalStates<R::State>,
    policy: WaitPolicy,
) -> Result<()> {
    let backoff = policy.to_backoff();
    info!(
        resource = %resource.describe(),
        target = %states.expected(),
        "Waiting for resource"
    );
    wait_for(resource, &states, &backoff).await?;
    Ok(())
}

fn creation<S: stratus_reconcile::ResourceState>(target: S) -> TerminalStates<S> {
    TerminalStates::target(target).tolerate(ProviderErrorKind::NotFound)
}

fn removal<S: stratus_reconcile::ResourceState>(target: S) -> TerminalStates<S> {
    TerminalStates::target(target).gone_when_absent()
}

pub fn instance_states(target: InstanceState) -> TerminalStates<InstanceState> {
    match target {
        InstanceState::Terminated => removal(target),
        InstanceState::Running => creation(target).fatal(InstanceState::Terminated),
        other => creation(other),
    }
}

pub fn volume_states(target: VolumeState) -> TerminalStates<VolumeState> {
    match target {
        VolumeState::Deleted => removal(target),
        other => creation(other).fatal(VolumeState::Error),
    }
}

pub fn snapshot_states(target: SnapshotState) -> TerminalStates<SnapshotState> {
    match target {
        SnapshotState::Deleted => removal(target),
        other => creation(other).fatal(SnapshotState::Error),
    }
}

pub fn image_states(target: ImageState) -> TerminalStates<ImageState> {
    match target {
        ImageState::Deregistered => removal(target),
        other => creation(other).fatal(ImageState::Failed),
    }
}

pub fn subnet_states(target: SubnetState) -> TerminalStates<SubnetState> {
    creation(target)
}

pub fn attachment_states(target: AttachmentState) -> TerminalStates<AttachmentState> {
    match target {
        AttachmentState::Detached => removal(target),
        other => creation(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use stratus_reconcile::{ConvergeError, ResourceKind};

    use crate::error::CloudError;
    use crate::provider::{CloudProvider, InstanceRequest, MockProvider, MockStep};

    fn request(provider: &MockProvider) -> InstanceRequest {
        InstanceRequest {
            image_id: provider.add_image("/dev/sda1"),
            count: 1,
            instance_type: "m1.small".to_string(),
            key_name: None,
            security_groups: vec!["default".to_string()],
            user_data: "{}".to_string(),
            availability_zone: None,
            subnet_id: None,
            private_ip_address: None,
            block_device_mappings: Vec::new(),
        }
    }

    async fn launch(provider: &Arc<MockProvider>, steps: &[&str]) -> Instance {
        provider.script_next(ResourceKind::Instance, MockStep::sequence(steps));
        let id = provider.run_instance(&request(provider)).await.unwrap();
        Instance::new(id, provider.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_reaches_running() {
        let provider = Arc::new(MockProvider::new());
        let instance = launch(&provider, &["pending", "pending", "running"]).await;

        ResourceWait::default()
            .for_instance(&instance, InstanceState::Running)
            .await
            .unwrap();
        assert_eq!(
            provider.call_count(crate::provider::Operation::DescribeInstance),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminated_while_waiting_for_running_is_fatal() {
        let provider = Arc::new(MockProvider::new());
        let instance = launch(&provider, &["pending", "pending", "terminated"]).await;

        let err = ResourceWait::default()
            .for_instance(&instance, InstanceState::Running)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(matches!(
            err,
            CloudError::Converge(ConvergeError::UnexpectedTerminalState { .. })
        ));
        assert!(message.contains("terminated"));
        assert!(message.contains("running"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_volume_counts_as_deleted() {
        let provider = Arc::new(MockProvider::new());
        let id = provider.add_volume(1, "us-east-1a");
        provider.script_volume(&id, vec![MockStep::state("deleting"), MockStep::Vanish]);

        ResourceWait::default()
            .for_volume(&Volume::new(id, provider.clone()), VolumeState::Deleted)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_with_attempt_count() {
        let provider = Arc::new(MockProvider::new());
        let id = provider.add_volume(1, "us-east-1a");
        provider.script_volume(&id, MockStep::sequence(&["creating"]));

        let started = tokio::time::Instant::now();
        let err = ResourceWait::default()
            .for_volume(&Volume::new(id, provider.clone()), VolumeState::Available)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CloudError::Converge(ConvergeError::Timeout { attempts: 54, .. })
        ));
        assert_eq!(started.elapsed(), Duration::from_secs(24 * 60));
    }
}
