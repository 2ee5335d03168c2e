//! End-to-end CPI requests, decoded from and encoded to JSON.

use std::sync::Arc;

use serde_json::{json, Value};
use stratus_provisioner::config::CloudOptions;
use stratus_provisioner::cpi::{self, Response};
use stratus_provisioner::provider::{MockProvider, Operation, SpotStep};
use stratus_provisioner::registry::InMemoryRegistry;
use stratus_provisioner::Cloud;

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
    async fn call(&self, method: &str, arguments: Value) -> Response {
        let raw = json!({
            "method": method,
            "arguments": arguments,
            "context": {"director_uuid": "d-1", "request_id": "42"},
        });
        cpi::handle_raw(&self.cloud, &raw.to_string()).await
    }

    async fn ok(&self, method: &str, arguments: Value) -> Value {
        let response = self.call(method, arguments).await;
        assert_eq!(response.error, None, "{method} failed");
        response.result
    }
}

fn cloud_properties() -> Value {
    json!({"instance_type": "m3.medium", "availability_zone": "us-east-1b"})
}

fn networks() -> Value {
    json!({"private": {"type": "dynamic", "cloud_properties": {}}})
}

#[tokio::test(start_paused = true)]
async fn test_deployment_round_trip() {
    let h = harness();
    let stemcell = h.mock.add_image("/dev/sda1");

    let vm = h
        .ok(
            "create_vm",
            json!(["agent-1", stemcell.as_str(), cloud_properties(), networks(), null, {}]),
        )
        .await;
    let vm = vm.as_str().unwrap().to_string();
    assert!(vm.starts_with("i-"));
    assert_eq!(h.ok("has_vm", json!([vm])).await, json!(true));

    h.ok(
        "set_vm_metadata",
        json!([vm, {"job": "api", "index": "0"}]),
    )
    .await;
    assert_eq!(h.mock.tags(&vm)["Name"], "api/0");

    let disk = h.ok("create_disk", json!([4096, {}, vm])).await;
    let disk = disk.as_str().unwrap().to_string();
    assert!(disk.starts_with("vol-"));

    h.ok("attach_disk", json!([vm, disk])).await;
    let persistent = h.registry.get(&vm).unwrap().disks.persistent;
    assert_eq!(persistent.get(&disk).map(String::as_str), Some("/dev/sdf"));

    let snapshot = h
        .ok("snapshot_disk", json!([disk, {"deployment": "d", "job": "api", "index": 0}]))
        .await;
    let snapshot = snapshot.as_str().unwrap().to_string();
    h.ok("delete_snapshot", json!([snapshot])).await;

    h.ok("detach_disk", json!([vm, disk])).await;
    h.ok("delete_disk", json!([disk])).await;

    h.ok("reboot_vm", json!([vm])).await;
    assert_eq!(h.ok("delete_vm", json!([vm])).await, Value::Null);
    assert_eq!(h.ok("has_vm", json!([vm])).await, json!(false));
    assert!(h.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retryable_creation_failure_on_the_wire() {
    let h = harness();
    let stemcell = h.mock.add_image("/dev/sda1");
    h.mock.script_next_spot(vec![SpotStep::open()]);

    let mut properties = cloud_properties();
    properties["spot_bid_price"] = json!(0.1);
    let response = h
        .call(
            "create_vm",
            json!(["agent-1", stemcell.as_str(), properties, networks(), [], null]),
        )
        .await;

    let error = response.error.unwrap();
    assert_eq!(error.error_type, "Bosh::Clouds::VMCreationFailed");
    assert!(error.ok_to_retry);
    assert_eq!(response.result, Value::Null);
    assert_eq!(h.mock.call_count(Operation::CancelSpot), 1);
}

#[tokio::test(start_paused = true)]
async fn test_create_disk_without_a_vm() {
    let h = harness();

    let disk = h.ok("create_disk", json!([1024, {}])).await;

    assert!(disk.as_str().unwrap().starts_with("vol-"));
}

#[tokio::test(start_paused = true)]
async fn test_stemcell_from_snapshot_on_the_wire() {
    let h = harness();
    let snapshot = h.mock.add_snapshot();

    let image = h
        .ok(
            "create_stemcell",
            json!([
                "/unused/image",
                {"name": "ubuntu", "version": "7", "snapshot_id": snapshot.as_str()}
            ]),
        )
        .await;
    let image = image.as_str().unwrap().to_string();
    assert!(image.starts_with("ami-"));

    h.ok("delete_stemcell", json!([image])).await;
    assert_eq!(h.mock.call_count(Operation::DeleteSnapshot), 1);
}

#[tokio::test(start_paused = true)]
async fn test_detach_of_unattached_disk_on_the_wire() {
    let h = harness();
    let vm = h.mock.add_running_instance("us-east-1a");
    let disk = h.mock.add_volume(1, "us-east-1a");

    let response = h
        .call("detach_disk", json!([vm.as_str(), disk.as_str()]))
        .await;

    let error = response.error.unwrap();
    assert_eq!(error.error_type, "Bosh::Clouds::DiskNotAttached");
    assert!(!error.ok_to_retry);
}

#[tokio::test]
async fn test_response_encoding() {
    let h = harness();

    let response = h.call("current_vm_id", json!([])).await;
    let encoded = serde_json::to_value(&response).unwrap();

    assert_eq!(
        encoded,
        json!({
            "result": null,
            "error": {
                "type": "Bosh::Clouds::NotImplemented",
                "message": "method `current_vm_id' is not implemented",
                "ok_to_retry": false,
            },
            "log": "",
        })
    );
}
