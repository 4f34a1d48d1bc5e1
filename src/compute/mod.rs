//! Compute Engine control plane
//!
//! The rescue pipeline talks to the control plane exclusively through the
//! [`ComputeApi`] trait. Two implementations ship with the crate:
//!
//! - [`ComputeClient`]: blocking REST client for the real API
//! - [`SimulatedCompute`]: in-memory model used for `--dry-run` and tests
//!
//! Mutating calls return an [`Operation`] handle; callers hand it to the
//! [`OperationWaiter`](crate::operation::OperationWaiter) before proceeding.

pub mod http;
pub mod simulated;
pub mod types;

pub use http::ComputeClient;
pub use simulated::SimulatedCompute;
pub use types::*;

use crate::error::Result;

/// Control-plane calls required by the rescue pipeline.
///
/// Implementations must be shareable across threads: the disk snapshot runs
/// on a background thread while the main pipeline keeps issuing calls.
///
/// # Contract
///
/// - A missing resource is reported as [`RescueError::NotFound`](crate::RescueError::NotFound)
/// - Every other failure propagates as-is; implementations never retry
pub trait ComputeApi: Send + Sync {
    /// `instances.get`
    fn get_instance(&self, loc: &Location, instance: &str) -> Result<Instance>;

    /// `instances.start`
    fn start_instance(&self, loc: &Location, instance: &str) -> Result<Operation>;

    /// `instances.stop`
    fn stop_instance(&self, loc: &Location, instance: &str) -> Result<Operation>;

    /// `instances.attachDisk`
    fn attach_disk(
        &self,
        loc: &Location,
        instance: &str,
        request: &AttachDiskRequest,
    ) -> Result<Operation>;

    /// `instances.detachDisk`
    fn detach_disk(&self, loc: &Location, instance: &str, device_name: &str)
    -> Result<Operation>;

    /// `instances.setMetadata`, preconditioned on `metadata.fingerprint`
    fn set_metadata(&self, loc: &Location, instance: &str, metadata: &Metadata)
    -> Result<Operation>;

    /// `instances.getSerialPortOutput` (port 1)
    fn get_serial_port_output(&self, loc: &Location, instance: &str) -> Result<SerialPortOutput>;

    /// `disks.get`
    fn get_disk(&self, loc: &Location, disk: &str) -> Result<Disk>;

    /// `disks.insert`
    fn insert_disk(&self, loc: &Location, disk: &DiskInsert) -> Result<Operation>;

    /// `disks.delete`
    fn delete_disk(&self, loc: &Location, disk: &str) -> Result<Operation>;

    /// `disks.list` with a filter expression such as `labels.rescue=123`
    fn list_disks(&self, loc: &Location, filter: &str) -> Result<Vec<Disk>>;

    /// `disks.setLabels`, preconditioned on `request.label_fingerprint`
    fn set_disk_labels(
        &self,
        loc: &Location,
        disk: &str,
        request: &SetLabelsRequest,
    ) -> Result<Operation>;

    /// `disks.createSnapshot`
    fn create_snapshot(&self, loc: &Location, disk: &str, snapshot_name: &str)
    -> Result<Operation>;

    /// `zoneOperations.get`
    fn get_zone_operation(&self, loc: &Location, operation: &str) -> Result<Operation>;
}
