// REST client tests against a local mock of the Compute Engine API.

use gce_rescue::compute::{
    AttachDiskRequest, ComputeApi, ComputeClient, InstanceStatus, Location, Metadata,
    MetadataItem, OperationStatus,
};
use gce_rescue::operation::OperationWaiter;
use gce_rescue::RescueError;
use mockito::{Matcher, Server, ServerGuard};
use serde_json::json;
use std::time::Duration;

const TOKEN: &str = "ya29.test-token";

fn loc() -> Location {
    Location::new("p", "z")
}

fn client(server: &ServerGuard) -> ComputeClient {
    ComputeClient::with_endpoint(server.url(), TOKEN).expect("client builds") // test: known-good input
}

fn running_operation(name: &str) -> String {
    json!({"name": name, "status": "RUNNING"}).to_string()
}

#[test]
fn test_get_instance_sends_bearer_token() {
    let mut server = Server::new();
    let mock = server
        .mock("GET", "/projects/p/zones/z/instances/v1")
        .match_header("authorization", format!("Bearer {}", TOKEN).as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "name": "v1",
                "status": "TERMINATED",
                "disks": [{
                    "deviceName": "persistent-disk-0",
                    "source": "https://www.googleapis.com/compute/v1/projects/p/zones/z/disks/d1",
                    "boot": true
                }],
                "metadata": {"fingerprint": "abc=", "items": []}
            })
            .to_string(),
        )
        .create();

    let instance = client(&server).get_instance(&loc(), "v1").expect("instance");
    mock.assert();
    assert_eq!(instance.status, InstanceStatus::Terminated);
    assert_eq!(instance.boot_disk().unwrap().disk_name(), "d1");
}

#[test]
fn test_missing_resource_is_not_found() {
    let mut server = Server::new();
    server
        .mock("GET", "/projects/p/zones/z/disks/rescue-linux-disk-1")
        .with_status(404)
        .with_body(json!({"error": {"code": 404, "message": "was not found"}}).to_string())
        .create();

    let err = client(&server)
        .get_disk(&loc(), "rescue-linux-disk-1")
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_api_error_message_is_extracted() {
    let mut server = Server::new();
    server
        .mock("POST", "/projects/p/zones/z/instances/v1/setMetadata")
        .with_status(412)
        .with_body(
            json!({"error": {"code": 412, "message": "Supplied fingerprint does not match"}})
                .to_string(),
        )
        .create();

    let metadata = Metadata {
        fingerprint: Some("stale".into()),
        items: vec![MetadataItem::new("rescue-mode", "1")],
    };
    match client(&server).set_metadata(&loc(), "v1", &metadata) {
        Err(RescueError::Api { status, message }) => {
            assert_eq!(status, 412);
            assert_eq!(message, "Supplied fingerprint does not match");
        }
        other => panic!("expected Api error, got {:?}", other),
    }
}

#[test]
fn test_attach_disk_body() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/projects/p/zones/z/instances/v1/attachDisk")
        .match_body(Matcher::Json(json!({
            "boot": true,
            "deviceName": "rescue-linux-disk-1",
            "source": "projects/p/zones/z/disks/rescue-linux-disk-1",
            "type": "PERSISTENT"
        })))
        .with_status(200)
        .with_body(running_operation("operation-attach"))
        .create();

    let request = AttachDiskRequest {
        boot: true,
        device_name: "rescue-linux-disk-1".into(),
        source: loc().disk_path("rescue-linux-disk-1"),
        disk_type: "PERSISTENT".into(),
    };
    let operation = client(&server)
        .attach_disk(&loc(), "v1", &request)
        .expect("accepted");
    mock.assert();
    assert_eq!(operation.status, OperationStatus::Running);
}

#[test]
fn test_detach_disk_passes_device_name() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/projects/p/zones/z/instances/v1/detachDisk")
        .match_query(Matcher::UrlEncoded(
            "deviceName".into(),
            "persistent-disk-0".into(),
        ))
        .with_status(200)
        .with_body(running_operation("operation-detach"))
        .create();

    client(&server)
        .detach_disk(&loc(), "v1", "persistent-disk-0")
        .expect("accepted");
    mock.assert();
}

#[test]
fn test_list_disks_follows_pages() {
    let mut server = Server::new();
    let first = server
        .mock("GET", "/projects/p/zones/z/disks")
        .match_query(Matcher::Regex("^filter=[^&]+$".into()))
        .with_status(200)
        .with_body(json!({"items": [{"name": "d1"}], "nextPageToken": "next"}).to_string())
        .create();
    let second = server
        .mock("GET", "/projects/p/zones/z/disks")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("filter".into(), "labels.rescue=1".into()),
            Matcher::UrlEncoded("pageToken".into(), "next".into()),
        ]))
        .with_status(200)
        .with_body(json!({"items": [{"name": "d2"}]}).to_string())
        .create();

    let disks = client(&server)
        .list_disks(&loc(), "labels.rescue=1")
        .expect("listed");
    first.assert();
    second.assert();
    let names: Vec<&str> = disks.iter().map(|disk| disk.name.as_str()).collect();
    assert_eq!(names, vec!["d1", "d2"]);
}

#[test]
fn test_empty_disk_list() {
    let mut server = Server::new();
    server
        .mock("GET", "/projects/p/zones/z/disks")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body("{}")
        .create();

    assert!(client(&server)
        .list_disks(&loc(), "labels.rescue=1")
        .unwrap()
        .is_empty());
}

#[test]
fn test_waiter_reports_failed_operation() {
    let mut server = Server::new();
    server
        .mock("GET", "/projects/p/zones/z/operations/operation-1")
        .with_status(200)
        .with_body(
            json!({
                "name": "operation-1",
                "status": "DONE",
                "error": {"errors": [{"code": "RESOURCE_IN_USE_BY_ANOTHER_RESOURCE", "message": "disk in use"}]}
            })
            .to_string(),
        )
        .create();

    let client = client(&server);
    let pending = serde_json::from_str(&running_operation("operation-1")).unwrap();
    let err = OperationWaiter::new(Duration::ZERO)
        .wait(&client, &loc(), pending)
        .unwrap_err();
    match err {
        RescueError::OperationFailed { operation, details } => {
            assert_eq!(operation, "operation-1");
            assert!(details.contains("RESOURCE_IN_USE_BY_ANOTHER_RESOURCE"));
        }
        other => panic!("expected OperationFailed, got {:?}", other),
    }
}
