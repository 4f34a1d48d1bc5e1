//! Compute Engine resource types
//!
//! Only the fields the rescue pipeline reads or writes are modelled; the
//! JSON field names follow the Compute Engine v1 REST API (camelCase).
//! `Instance` and `AttachedDisk` keep every other field in `extra` so the
//! resource serializes back in full.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use strum::{Display, EnumString};

/// Project and zone a VM lives in.
///
/// Resolved once when the context is built and passed explicitly to every
/// control-plane call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub project: String,
    pub zone: String,
}

impl Location {
    pub fn new(project: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
        }
    }

    /// Partial resource path of a disk, as accepted by `attachDisk`.
    pub fn disk_path(&self, disk_name: &str) -> String {
        format!(
            "projects/{}/zones/{}/disks/{}",
            self.project, self.zone, disk_name
        )
    }

    /// Partial resource path of a disk type.
    pub fn disk_type_path(&self, disk_type: &str) -> String {
        format!(
            "projects/{}/zones/{}/diskTypes/{}",
            self.project, self.zone, disk_type
        )
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.zone)
    }
}

/// Instance power status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Provisioning,
    Staging,
    Running,
    Stopping,
    Stopped,
    Suspending,
    Suspended,
    Repairing,
    Terminated,
    #[default]
    #[serde(other)]
    Unknown,
}

/// A single `{key, value}` custom metadata entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl MetadataItem {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }
}

/// Instance metadata: the item set plus its concurrency token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub items: Vec<MetadataItem>,
}

/// A disk as seen from the instance that has it attached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    pub device_name: String,
    /// Full or partial URL of the disk resource; empty for local SSDs
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default)]
    pub boot: bool,
    #[serde(default)]
    pub licenses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    /// Unmodelled fields (`type`, `mode`, `autoDelete`, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AttachedDisk {
    /// Disk name: the last segment of `source`, empty for scratch disks.
    pub fn disk_name(&self) -> &str {
        resource_name(&self.source)
    }

    /// Whether the attachment is backed by a persistent disk resource.
    pub fn has_source(&self) -> bool {
        !self.source.is_empty()
    }
}

/// An `instances.get` resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub disks: Vec<AttachedDisk>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    /// Unmodelled fields (`machineType`, `networkInterfaces`, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Instance {
    /// The attached disk flagged as boot, if any.
    pub fn boot_disk(&self) -> Option<&AttachedDisk> {
        self.disks.iter().find(|disk| disk.boot)
    }
}

/// Body of `instances.attachDisk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachDiskRequest {
    pub boot: bool,
    pub device_name: String,
    pub source: String,
    #[serde(rename = "type")]
    pub disk_type: String,
}

/// A persistent disk resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub name: String,
    /// Instances the disk is attached to
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub disk_type: Option<String>,
}

/// Body of `disks.insert`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskInsert {
    pub name: String,
    pub source_image: String,
    #[serde(rename = "type")]
    pub disk_type: String,
}

/// Body of `disks.setLabels`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLabelsRequest {
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_fingerprint: Option<String>,
}

/// Response of `instances.getSerialPortOutput`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerialPortOutput {
    #[serde(default)]
    pub contents: String,
}

/// Long-running operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Running,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationErrorDetail {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub errors: Vec<OperationErrorDetail>,
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "unknown error");
        }
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// Handle to an asynchronous remote state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub name: String,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_link: Option<String>,
}

impl Operation {
    pub fn is_done(&self) -> bool {
        self.status == OperationStatus::Done
    }
}

/// Last path segment of a resource URL (`.../disks/foo` → `foo`).
pub fn resource_name(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_deserializes_api_shape() {
        let json = r#"{
            "name": "v1",
            "status": "RUNNING",
            "selfLink": "https://www.googleapis.com/compute/v1/projects/p/zones/z/instances/v1",
            "disks": [{
                "deviceName": "persistent-disk-0",
                "source": "https://www.googleapis.com/compute/v1/projects/p/zones/z/disks/d1",
                "boot": true,
                "architecture": "X86_64",
                "licenses": ["https://www.googleapis.com/compute/v1/projects/debian-cloud/global/licenses/debian-11-bullseye"]
            }],
            "metadata": {
                "fingerprint": "cRcIE4_rlPM=",
                "items": [{"key": "ssh-keys", "value": "user:ssh-ed25519 AAAA"}]
            }
        }"#;
        let instance: Instance = serde_json::from_str(json).expect("valid instance json"); // test: fixed fixture
        assert_eq!(instance.status, InstanceStatus::Running);
        let boot = instance.boot_disk().expect("boot disk present");
        assert_eq!(boot.disk_name(), "d1");
        assert_eq!(boot.device_name, "persistent-disk-0");
        assert_eq!(instance.metadata.fingerprint.as_deref(), Some("cRcIE4_rlPM="));
        assert_eq!(instance.metadata.items.len(), 1);
    }

    #[test]
    fn test_local_ssd_without_source_is_accepted() {
        let instance: Instance = serde_json::from_value(serde_json::json!({
            "name": "v1",
            "status": "RUNNING",
            "disks": [
                {
                    "deviceName": "persistent-disk-0",
                    "source": "projects/p/zones/z/disks/d1",
                    "boot": true,
                    "type": "PERSISTENT"
                },
                {
                    "deviceName": "local-ssd-0",
                    "type": "SCRATCH",
                    "interface": "NVME",
                    "autoDelete": true
                }
            ]
        }))
        .expect("instance with a local SSD parses");

        let scratch = &instance.disks[1];
        assert!(!scratch.has_source());
        assert_eq!(scratch.disk_name(), "");
        assert_eq!(scratch.extra["type"], "SCRATCH");
        assert_eq!(instance.boot_disk().map(AttachedDisk::disk_name), Some("d1"));

        let value = serde_json::to_value(&instance).expect("serializes");
        assert!(value["disks"][1].get("source").is_none());
        assert_eq!(value["disks"][1]["interface"], "NVME");
    }

    #[test]
    fn test_unmodelled_fields_survive_serialization() {
        let json = serde_json::json!({
            "name": "v1",
            "status": "RUNNING",
            "machineType": "projects/p/zones/z/machineTypes/e2-medium",
            "networkInterfaces": [{"network": "global/networks/default"}],
            "disks": [{
                "deviceName": "persistent-disk-0",
                "source": "projects/p/zones/z/disks/d1",
                "boot": true,
                "autoDelete": true,
                "mode": "READ_WRITE"
            }]
        });
        let instance: Instance = serde_json::from_value(json).expect("parses");
        assert!(instance.extra.contains_key("machineType"));

        let value = serde_json::to_value(&instance).expect("serializes");
        assert_eq!(value["machineType"], "projects/p/zones/z/machineTypes/e2-medium");
        assert_eq!(value["networkInterfaces"][0]["network"], "global/networks/default");
        assert_eq!(value["disks"][0]["autoDelete"], true);
        assert_eq!(value["disks"][0]["mode"], "READ_WRITE");
    }

    #[test]
    fn test_unknown_status_is_tolerated() {
        let instance: Instance =
            serde_json::from_str(r#"{"name": "v1", "status": "HIBERNATING"}"#).expect("parses");
        assert_eq!(instance.status, InstanceStatus::Unknown);
        assert!(instance.metadata.items.is_empty());
    }

    #[test]
    fn test_operation_error_display() {
        let op: Operation = serde_json::from_value(serde_json::json!({
            "name": "operation-1",
            "status": "DONE",
            "error": {"errors": [{"code": "RESOURCE_IN_USE", "message": "disk busy"}]}
        }))
        .expect("parses");
        assert!(op.is_done());
        assert_eq!(
            op.error.expect("error present").to_string(),
            "RESOURCE_IN_USE: disk busy"
        );
    }

    #[test]
    fn test_attach_request_uses_type_field() {
        let req = AttachDiskRequest {
            boot: false,
            device_name: "persistent-disk-0".into(),
            source: Location::new("p", "z").disk_path("d1"),
            disk_type: "PERSISTENT".into(),
        };
        let value = serde_json::to_value(&req).expect("serializes");
        assert_eq!(value["type"], "PERSISTENT");
        assert_eq!(value["deviceName"], "persistent-disk-0");
        assert_eq!(value["source"], "projects/p/zones/z/disks/d1");
    }

    #[test]
    fn test_status_display_matches_api() {
        assert_eq!(InstanceStatus::Terminated.to_string(), "TERMINATED");
        assert_eq!(OperationStatus::Done.to_string(), "DONE");
    }
}
