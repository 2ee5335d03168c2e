//! VM create and delete flows against the mock provider.
//!
//! Covers on-demand and spot allocation, create retries, compensation when
//! anything after allocation fails, and teardown of instance settings.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use stratus_provisioner::config::CloudOptions;
use stratus_provisioner::instance_manager::DELETE_MARKER;
use stratus_provisioner::launch::{NetworkSpecs, ResourcePool};
use stratus_provisioner::provider::{MockProvider, MockStep, Operation, SpotStep};
use stratus_provisioner::registry::{AgentSettings, InMemoryRegistry, SettingsRegistry};
use stratus_provisioner::{Cloud, CloudError};
use stratus_reconcile::{ProviderError, ResourceKind};

struct Harness {
    mock: Arc<MockProvider>,
    registry: Arc<InMemoryRegistry>,
    cloud: Cloud,
}

fn harness_with(options: CloudOptions) -> Harness {
    let mock = Arc::new(MockProvider::new());
    let registry = Arc::new(InMemoryRegistry::new("http://registry.internal:25777"));
    let cloud = Cloud::new(mock.clone(), registry.clone(), options);
    Harness {
        mock,
        registry,
        cloud,
    }
}

fn harness() -> Harness {
    harness_with(CloudOptions::default())
}

fn resource_pool() -> ResourcePool {
    ResourcePool {
        instance_type: "m1.small".to_string(),
        availability_zone: Some("us-east-1c".to_string()),
        ..ResourcePool::default()
    }
}

fn spot_pool() -> ResourcePool {
    ResourcePool {
        spot_bid_price: Some(0.25),
        ..resource_pool()
    }
}

fn networks() -> NetworkSpecs {
    serde_json::from_value(json!({
        "default": {
            "type": "dynamic",
            "dns": ["10.0.0.2"],
            "cloud_properties": {}
        }
    }))
    .unwrap()
}

impl Harness {
    async fn create_vm(&self, pool: ResourcePool) -> stratus_provisioner::Result<String> {
        let stemcell = self.mock.add_image("/dev/xvda");
        self.cloud
            .create_vm(
                "agent-007",
                stemcell.as_str(),
                pool,
                networks(),
                &[],
                Some(json!({"bosh": {"password": "secret"}})),
            )
            .await
            .map(|id| id.to_string())
    }
}

#[tokio::test(start_paused = true)]
async fn test_create_vm_stores_initial_settings() {
    let h = harness();

    let id = h.create_vm(resource_pool()).await.unwrap();

    let settings = h.registry.get(&id).unwrap();
    assert_eq!(settings.agent_id, "agent-007");
    assert_eq!(settings.disks.system, "/dev/xvda");
    assert_eq!(settings.disks.ephemeral.as_deref(), Some("/dev/sdb"));
    assert!(settings.disks.persistent.is_empty());
    assert!(settings.vm.name.starts_with("vm-"));
    assert_eq!(settings.env, Some(json!({"bosh": {"password": "secret"}})));

    let requests = h.mock.instance_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].availability_zone.as_deref(), Some("us-east-1c"));
    assert_eq!(requests[0].security_groups, vec!["default".to_string()]);

    let user_data: Value = serde_json::from_str(&requests[0].user_data).unwrap();
    assert_eq!(
        user_data,
        json!({
            "registry": {"endpoint": "http://registry.internal:25777"},
            "dns": {"nameserver": ["10.0.0.2"]}
        })
    );

    assert!(h.cloud.has_vm(&id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_create_vm_with_unknown_stemcell() {
    let h = harness();

    let err = h
        .cloud
        .create_vm(
            "agent-007",
            "ami-0000beef",
            resource_pool(),
            networks(),
            &[],
            None,
        )
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "no stemcell info for ami-0000beef");
    assert_eq!(h.mock.call_count(Operation::RunInstance), 0);
}

#[tokio::test(start_paused = true)]
async fn test_private_ip_in_use_is_retried() {
    let h = harness();
    h.mock.fail_next(
        Operation::RunInstance,
        ProviderError::private_ip_in_use("address 10.0.0.5 is in use"),
    );

    let id = h.create_vm(resource_pool()).await.unwrap();

    assert_eq!(h.mock.call_count(Operation::RunInstance), 2);
    assert!(h.registry.get(&id).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_create_is_retried() {
    let h = harness();
    h.mock.fail_next(
        Operation::RunInstance,
        ProviderError::rate_limited("Request limit exceeded"),
    );

    let id = h.create_vm(resource_pool()).await.unwrap();

    assert_eq!(h.mock.call_count(Operation::RunInstance), 2);
    assert_eq!(h.mock.call_count(Operation::TerminateInstance), 0);
    assert!(h.registry.get(&id).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_instance_that_never_runs_is_terminated() {
    let h = harness();
    h.mock
        .script_next(ResourceKind::Instance, MockStep::sequence(&["pending", "terminated"]));

    let err = h.create_vm(resource_pool()).await.unwrap_err();

    assert!(err.to_string().contains("terminated"), "{err}");
    assert_eq!(h.mock.call_count(Operation::TerminateInstance), 1);
    assert!(h.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_compensation_keeps_the_original_error() {
    let h = harness();
    h.mock
        .script_next(ResourceKind::Instance, MockStep::sequence(&["pending", "terminated"]));
    h.mock.fail_next(
        Operation::TerminateInstance,
        ProviderError::service_unavailable("provider is down"),
    );

    let err = h.create_vm(resource_pool()).await.unwrap_err();

    assert!(matches!(err, CloudError::Converge(_)), "{err:?}");
    assert!(!err.to_string().contains("provider is down"));
    assert_eq!(h.mock.call_count(Operation::TerminateInstance), 1);
}

#[tokio::test(start_paused = true)]
async fn test_registry_failure_terminates_the_new_instance() {
    let h = harness();
    h.registry.set_failing(true);

    let err = h.create_vm(resource_pool()).await.unwrap_err();

    assert!(matches!(err, CloudError::Registry(_)), "{err:?}");
    assert_eq!(h.mock.call_count(Operation::TerminateInstance), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_load_balancer_fails_the_create() {
    let h = harness();
    let pool = ResourcePool {
        elbs: vec!["public-lb".to_string()],
        ..resource_pool()
    };

    h.create_vm(pool).await.unwrap_err();

    assert_eq!(h.mock.call_count(Operation::TerminateInstance), 1);
}

#[tokio::test(start_paused = true)]
async fn test_spot_instance_is_fulfilled() {
    let h = harness();

    let id = h.create_vm(spot_pool()).await.unwrap();

    assert_eq!(h.mock.call_count(Operation::RunInstance), 0);
    assert_eq!(h.mock.call_count(Operation::CancelSpot), 0);

    let requests = h.mock.spot_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].spot_price, "0.25");
    assert!(h.registry.get(&id).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_unfulfilled_spot_request_times_out_as_retryable() {
    let h = harness();
    h.mock.script_next_spot(vec![SpotStep::open()]);

    let err = h.create_vm(spot_pool()).await.unwrap_err();

    assert!(matches!(err, CloudError::VmCreationFailed { .. }), "{err:?}");
    assert!(err.ok_to_retry());
    assert_eq!(h.mock.call_count(Operation::CancelSpot), 1);
    assert_eq!(h.mock.call_count(Operation::RunInstance), 0);
    assert!(h.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_spot_price_too_low_is_not_retryable() {
    let h = harness();
    h.mock
        .script_next_spot(vec![SpotStep::open(), SpotStep::price_too_low()]);

    let err = h.create_vm(spot_pool()).await.unwrap_err();

    assert!(matches!(err, CloudError::VmCreationFailed { .. }), "{err:?}");
    assert!(!err.ok_to_retry());
    assert_eq!(h.mock.call_count(Operation::CancelSpot), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delete_vm_waits_and_drops_settings() {
    let h = harness();
    h.mock.add_load_balancer("public-lb");
    let pool = ResourcePool {
        elbs: vec!["public-lb".to_string()],
        ..resource_pool()
    };
    let id = h.create_vm(pool).await.unwrap();
    assert_eq!(h.mock.load_balancer_members("public-lb").len(), 1);

    h.cloud.delete_vm(&id).await.unwrap();

    assert!(h.registry.get(&id).is_none());
    assert!(h.mock.load_balancer_members("public-lb").is_empty());
    assert!(!h.cloud.has_vm(&id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_delete_missing_vm_still_drops_settings() {
    let h = harness();
    let settings = AgentSettings::initial("agent-9", "/dev/sda1", NetworkSpecs::new(), None, &Map::new());
    h.registry
        .update_settings("i-000000ff", &settings)
        .await
        .unwrap();

    let err = h.cloud.delete_vm("i-000000ff").await.unwrap_err();

    assert!(matches!(err, CloudError::VmNotFound(_)), "{err:?}");
    assert!(h.registry.get("i-000000ff").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_fast_path_delete_tags_instead_of_waiting() {
    let h = harness_with(CloudOptions {
        fast_path_delete: true,
        ..CloudOptions::default()
    });
    let id = h.create_vm(resource_pool()).await.unwrap();
    let describes_before = h.mock.call_count(Operation::DescribeInstance);

    h.cloud.delete_vm(&id).await.unwrap();

    assert_eq!(h.mock.tags(&id).get("Name").map(String::as_str), Some(DELETE_MARKER));
    assert_eq!(h.mock.call_count(Operation::DescribeInstance), describes_before);
}

#[tokio::test(start_paused = true)]
async fn test_set_vm_metadata_names_the_instance() {
    let h = harness();
    let id = h.create_vm(resource_pool()).await.unwrap();
    let metadata = json!({"job": "router", "index": 2, "deployment": "cf"});

    h.cloud
        .set_vm_metadata(&id, metadata.as_object().unwrap())
        .await
        .unwrap();

    let tags = h.mock.tags(&id);
    assert_eq!(tags["job"], "router");
    assert_eq!(tags["index"], "2");
    assert_eq!(tags["Name"], "router/2");
}

#[tokio::test(start_paused = true)]
async fn test_configure_networks_rejects_security_group_changes() {
    let h = harness();
    let id = h.create_vm(resource_pool()).await.unwrap();

    let changed: NetworkSpecs = serde_json::from_value(json!({
        "default": {"type": "dynamic", "cloud_properties": {"security_groups": ["web"]}}
    }))
    .unwrap();
    let err = h.cloud.configure_networks(&id, changed).await.unwrap_err();
    assert!(matches!(err, CloudError::NotSupported(_)), "{err:?}");
    assert!(err.to_string().contains("default to web"));

    let same: NetworkSpecs = serde_json::from_value(json!({
        "default": {"type": "dynamic", "dns": ["10.0.0.53"]}
    }))
    .unwrap();
    h.cloud.configure_networks(&id, same.clone()).await.unwrap();
    assert_eq!(h.registry.get(&id).unwrap().networks, same);
}
