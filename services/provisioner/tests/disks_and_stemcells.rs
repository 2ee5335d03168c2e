//! Persistent disk, snapshot and stemcell operations.

use std::sync::Arc;

use serde_json::{json, Map};
use stratus_id::{ImageId, SnapshotId};
use stratus_provisioner::cloud::StemcellProperties;
use stratus_provisioner::config::CloudOptions;
use stratus_provisioner::launch::{NetworkSpecs, ResourcePool};
use stratus_provisioner::provider::{CloudProvider, MockProvider, MockStep, Operation};
use stratus_provisioner::registry::InMemoryRegistry;
use stratus_provisioner::{Cloud, CloudError};
use stratus_reconcile::{ProviderError, ResourceKind};

struct Harness {
    mock: Arc<MockProvider>,
    registry: Arc<InMemoryRegistry>,
    cloud: Cloud,
}

fn harness() -> Harness {
    let mock = Arc::new(MockProvider::new());
    let registry = Arc::new(InMemoryRegistry::default());
    let cloud = Cloud::new(mock.clone(), registry.clone(), CloudOptions::default());
    Harness {
        mock,
        registry,
        cloud,
    }
}

impl Harness {
    async fn vm(&self) -> String {
        let stemcell = self.mock.add_image("/dev/sda1");
        let pool = ResourcePool {
            instance_type: "m1.small".to_string(),
            availability_zone: Some("us-east-1d".to_string()),
            ..ResourcePool::default()
        };
        self.cloud
            .create_vm("agent-1", stemcell.as_str(), pool, NetworkSpecs::new(), &[], None)
            .await
            .unwrap()
            .to_string()
    }

    fn persistent(&self, instance_id: &str) -> Vec<(String, String)> {
        self.registry
            .get(instance_id)
            .unwrap()
            .disks
            .persistent
            .into_iter()
            .collect()
    }
}

#[tokio::test(start_paused = true)]
async fn test_disk_lifecycle() {
    let h = harness();
    let vm = h.vm().await;

    let disk = h.cloud.create_disk(2048, Some(vm.as_str())).await.unwrap();
    let volume = h.mock.describe_volume(&disk).await.unwrap();
    assert_eq!(volume.size_gib, 2);
    assert_eq!(volume.availability_zone, "us-east-1d");
    assert_eq!(volume.state, "available");

    let device = h.cloud.attach_disk(&vm, disk.as_str()).await.unwrap();
    assert_eq!(device, "/dev/sdf");
    assert_eq!(
        h.persistent(&vm),
        vec![(disk.to_string(), "/dev/sdf".to_string())]
    );

    // Attaching again reuses the existing mapping.
    let again = h.cloud.attach_disk(&vm, disk.as_str()).await.unwrap();
    assert_eq!(again, "/dev/sdf");
    assert_eq!(h.mock.call_count(Operation::AttachVolume), 1);

    let err = h.cloud.delete_disk(disk.as_str()).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("Cannot delete volume `{disk}', state is in-use")
    );

    h.cloud.detach_disk(&vm, disk.as_str()).await.unwrap();
    assert!(h.persistent(&vm).is_empty());

    let err = h.cloud.detach_disk(&vm, disk.as_str()).await.unwrap_err();
    assert!(matches!(err, CloudError::DiskNotAttached { .. }), "{err:?}");

    h.cloud.delete_disk(disk.as_str()).await.unwrap();
    let gone = h.mock.describe_volume(&disk).await.unwrap_err();
    assert!(gone.is_not_found());
}

#[tokio::test(start_paused = true)]
async fn test_second_disk_takes_the_next_device() {
    let h = harness();
    let vm = h.vm().await;
    let first = h.cloud.create_disk(1024, Some(vm.as_str())).await.unwrap();
    let second = h.cloud.create_disk(1024, Some(vm.as_str())).await.unwrap();

    h.cloud.attach_disk(&vm, first.as_str()).await.unwrap();
    let device = h.cloud.attach_disk(&vm, second.as_str()).await.unwrap();

    assert_eq!(device, "/dev/sdg");
    assert_eq!(h.persistent(&vm).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disk_size_limits() {
    let h = harness();

    let err = h.cloud.create_disk(512, None).await.unwrap_err();
    assert!(err.to_string().contains("minimum disk size"));

    let err = h.cloud.create_disk(2 * 1024 * 1000, None).await.unwrap_err();
    assert!(err.to_string().contains("maximum disk size"));

    assert_eq!(h.mock.call_count(Operation::CreateVolume), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disk_without_instance_uses_the_fallback_zone() {
    let h = harness();

    let disk = h.cloud.create_disk(1500, None).await.unwrap();

    let volume = h.mock.describe_volume(&disk).await.unwrap();
    assert_eq!(volume.availability_zone, "us-east-1a");
    assert_eq!(volume.size_gib, 2);
}

#[tokio::test(start_paused = true)]
async fn test_delete_disk_retries_while_in_use() {
    let h = harness();
    let disk = h.mock.add_volume(10, "us-east-1a");
    for _ in 0..2 {
        h.mock.fail_next(
            Operation::DeleteVolume,
            ProviderError::volume_in_use("volume is still detaching"),
        );
    }

    h.cloud.delete_disk(disk.as_str()).await.unwrap();

    assert_eq!(h.mock.call_count(Operation::DeleteVolume), 3);
}

#[tokio::test(start_paused = true)]
async fn test_missing_disk() {
    let h = harness();
    let vm = h.vm().await;

    let err = h.cloud.delete_disk("vol-0000dead").await.unwrap_err();
    assert!(matches!(err, CloudError::DiskNotFound(_)), "{err:?}");

    let err = h.cloud.attach_disk(&vm, "vol-0000dead").await.unwrap_err();
    assert!(matches!(err, CloudError::DiskNotFound(_)), "{err:?}");
}

#[tokio::test(start_paused = true)]
async fn test_attachment_that_disappears_counts_as_detached() {
    let h = harness();
    let vm = h.vm().await;
    let disk = h.cloud.create_disk(1024, Some(vm.as_str())).await.unwrap();
    h.cloud.attach_disk(&vm, disk.as_str()).await.unwrap();
    h.mock
        .script_next(ResourceKind::Attachment, vec![MockStep::Vanish]);

    h.cloud.detach_disk(&vm, disk.as_str()).await.unwrap();

    assert!(h.persistent(&vm).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_disk_is_described_and_tagged() {
    let h = harness();
    let disk = h.mock.add_volume(10, "us-east-1a");
    let metadata = json!({
        "deployment": "cf",
        "job": "router",
        "index": 0,
        "agent_id": "agent-1",
        "director_uuid": "abc-123",
    });

    let snapshot = h
        .cloud
        .snapshot_disk(disk.as_str(), metadata.as_object().unwrap())
        .await
        .unwrap();

    let info = h.mock.describe_snapshot(&snapshot).await.unwrap();
    assert_eq!(info.state, "completed");
    assert_eq!(info.volume_id, Some(disk));
    assert_eq!(info.description.as_deref(), Some("cf/router/0"));

    let tags = h.mock.tags(snapshot.as_str());
    assert_eq!(tags["Name"], "cf/router/0");
    assert_eq!(tags["agent_id"], "agent-1");
    assert_eq!(tags["director_uuid"], "abc-123");
    assert!(!tags.contains_key("deployment"));

    h.cloud.delete_snapshot(snapshot.as_str()).await.unwrap();
    assert!(h.mock.describe_snapshot(&snapshot).await.unwrap_err().is_not_found());
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_without_metadata_has_no_name() {
    let h = harness();
    let disk = h.mock.add_volume(10, "us-east-1a");

    let snapshot = h.cloud.snapshot_disk(disk.as_str(), &Map::new()).await.unwrap();

    assert!(h.mock.tags(snapshot.as_str()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stemcell_from_snapshot() {
    let h = harness();
    let snapshot = h.mock.add_snapshot();
    let properties = StemcellProperties {
        name: Some("ubuntu-jammy".to_string()),
        version: Some("1.42".to_string()),
        architecture: Some("x86_64".to_string()),
        ..StemcellProperties::default()
    };

    let image = h
        .cloud
        .create_stemcell_from_snapshot(snapshot.as_str(), &properties)
        .await
        .unwrap();

    let info = h.mock.describe_image(&image).await.unwrap();
    assert_eq!(info.state, "available");
    assert_eq!(info.root_device_name.as_deref(), Some("/dev/sda1"));
    assert_eq!(info.snapshot_ids, vec![snapshot.clone()]);
    assert_eq!(h.mock.tags(image.as_str())["Name"], "ubuntu-jammy 1.42");

    h.cloud.delete_stemcell(image.as_str()).await.unwrap();
    assert_eq!(h.mock.call_count(Operation::DeregisterImage), 1);
    assert_eq!(h.mock.call_count(Operation::DeleteSnapshot), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stemcell_from_missing_snapshot() {
    let h = harness();

    let err = h
        .cloud
        .create_stemcell_from_snapshot("snap-0000beef", &StemcellProperties::default())
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "snapshot `snap-0000beef' not found");
    assert_eq!(h.mock.call_count(Operation::RegisterImage), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delete_unknown_stemcell() {
    let h = harness();
    let unknown = ImageId::parse("ami-0000f00d").unwrap();

    let err = h.cloud.delete_stemcell(unknown.as_str()).await.unwrap_err();

    assert!(err.to_string().contains("not found"));
    assert!(!h.mock.has_image(&unknown));
}

#[tokio::test(start_paused = true)]
async fn test_delete_stemcell_keeps_unrelated_snapshots() {
    let h = harness();
    let mine = h.mock.add_snapshot();
    let other: SnapshotId = h.mock.add_snapshot();
    let image = h.mock.add_image_with_snapshots("/dev/sda1", vec![mine.clone()]);

    h.cloud.delete_stemcell(image.as_str()).await.unwrap();

    let deleted: Vec<String> = h
        .mock
        .calls()
        .into_iter()
        .filter(|call| call.operation == Operation::DeleteSnapshot)
        .map(|call| call.target)
        .collect();
    assert_eq!(deleted, vec![mine.to_string()]);
    assert!(h.mock.has_snapshot(&other));
}

#[tokio::test(start_paused = true)]
async fn test_create_subnet_waits_until_available() {
    let h = harness();

    let subnet = h
        .cloud
        .create_subnet("vpc-0000abcd", "10.0.1.0/24", Some("us-east-1b"))
        .await
        .unwrap();

    let info = h.mock.describe_subnet(&subnet).await.unwrap();
    assert_eq!(info.state, "available");
    assert_eq!(info.cidr_block, "10.0.1.0/24");
    assert_eq!(info.availability_zone.as_deref(), Some("us-east-1b"));
}

#[tokio::test(start_paused = true)]
async fn test_volume_ids_are_validated() {
    let h = harness();

    let err = h.cloud.delete_disk("disk-1").await.unwrap_err();

    assert!(matches!(err, CloudError::InvalidArgument(_)), "{err:?}");
    assert_eq!(h.mock.call_count(Operation::DescribeVolume), 0);
}
