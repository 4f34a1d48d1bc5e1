//! Disk operations
//!
//! `DiskSwapper` wraps every disk-level control-plane call the pipeline issues
//! and blocks on the resulting operation before returning.
//!
//! # Design
//!
//! - **Strict label lookup**: a label filter must resolve to exactly one disk
//! - **Idempotent rescue disk**: an existing, unattached rescue disk is reused
//! - **Label before attach**: the original disk is labelled `rescue=<ts>`
//!   (plus its boot device name) before it is attached as a secondary disk,
//!   so a later run can find it and put it back even after a partial exit

use crate::compute::{
    AttachDiskRequest, ComputeApi, Disk, DiskInsert, Instance, Location, Operation,
    SetLabelsRequest,
};
use crate::config::RescueConfig;
use crate::error::{RescueError, Result};
use crate::instance::{InstanceState, RESCUE_DEVICE_LABEL, RESCUE_LABEL};
use crate::operation::OperationWaiter;
use tracing::{debug, info, warn};

/// Architecture assumed when the boot disk does not report one
pub const DEFAULT_ARCHITECTURE: &str = "x86_64";

/// Attachment type of every disk the pipeline attaches
const PERSISTENT: &str = "PERSISTENT";

/// List disks matching `filter` and require exactly one match.
pub fn find_disk_by_label(api: &dyn ComputeApi, loc: &Location, filter: &str) -> Result<Disk> {
    let mut disks = api.list_disks(loc, filter)?;
    debug!("filter {} matched {} disk(s)", filter, disks.len());
    match disks.len() {
        1 => Ok(disks.remove(0)),
        matches => Err(RescueError::DiskLookup {
            filter: filter.to_string(),
            matches,
        }),
    }
}

/// Pick the recovery OS image for `instance`.
///
/// The boot disk architecture selects a candidate pair. The first candidate
/// is used unless the VM itself already runs it (its image name shows up in
/// a boot disk license), in which case the second one is used.
pub fn guess_recovery_image(instance: &Instance, config: &RescueConfig) -> Result<String> {
    let boot = instance.boot_disk();
    let arch = boot
        .and_then(|disk| disk.architecture.as_deref())
        .unwrap_or(DEFAULT_ARCHITECTURE);

    let [first, second] = config.recovery_images(arch).ok_or_else(|| {
        RescueError::invalid_instance(format!("no recovery image for architecture {}", arch))
    })?;

    let first_name = first.rsplit('/').next().unwrap_or(first);
    let runs_first = boot
        .map(|disk| disk.licenses.iter().any(|license| license.contains(first_name)))
        .unwrap_or(false);

    let image = if runs_first { second } else { first };
    debug!("recovery image for {} ({}): {}", instance.name, arch, image);
    Ok(image.clone())
}

/// Label values: lowercase letters, digits, `-` and `_`, at most 63 chars.
fn is_label_value(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Disk-level steps of the rescue pipeline.
pub struct DiskSwapper<'a> {
    api: &'a dyn ComputeApi,
    waiter: OperationWaiter,
}

impl<'a> DiskSwapper<'a> {
    pub fn new(api: &'a dyn ComputeApi, waiter: OperationWaiter) -> Self {
        Self { api, waiter }
    }

    fn wait(&self, loc: &Location, operation: Operation) -> Result<Operation> {
        self.waiter.wait(self.api, loc, operation)
    }

    pub fn find_disk_by_label(&self, loc: &Location, filter: &str) -> Result<Disk> {
        find_disk_by_label(self.api, loc, filter)
    }

    /// Ensure the session's rescue disk exists and is free.
    ///
    /// # Errors
    ///
    /// - `DiskBusy` if the disk exists and is attached to any instance
    /// - probe failures other than `NotFound`, unchanged
    pub fn create_rescue_disk(
        &self,
        vm: &InstanceState,
        source_image: &str,
        disk_type: &str,
    ) -> Result<()> {
        let loc = &vm.location;
        let name = vm.rescue_disk_name();

        match self.api.get_disk(loc, &name) {
            Ok(disk) if !disk.users.is_empty() => Err(RescueError::DiskBusy {
                disk: name,
                users: disk.users,
            }),
            Ok(_) => {
                info!("rescue disk {} already exists, reusing it", name);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!("creating rescue disk {} from {}", name, source_image);
                let request = DiskInsert {
                    name,
                    source_image: source_image.to_string(),
                    disk_type: loc.disk_type_path(disk_type),
                };
                let operation = self.api.insert_disk(loc, &request)?;
                self.wait(loc, operation)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Add the `rescue=<ts>` and `rescue-device=<device>` labels to
    /// `disk_name`, keeping existing labels.
    pub fn label_disk(&self, vm: &InstanceState, disk_name: &str) -> Result<()> {
        let loc = &vm.location;
        let device = &vm.disk_binding.device_name;
        let result = self
            .find_disk_by_label(loc, &format!("name={}", disk_name))
            .and_then(|disk| {
                let mut labels = disk.labels;
                labels.insert(RESCUE_LABEL.to_string(), vm.rescue.ts.to_string());
                if is_label_value(device) {
                    labels.insert(RESCUE_DEVICE_LABEL.to_string(), device.clone());
                } else {
                    warn!("device name {} cannot be stored as a label", device);
                }
                let request = SetLabelsRequest {
                    labels,
                    label_fingerprint: disk.label_fingerprint,
                };
                let operation = self.api.set_disk_labels(loc, disk_name, &request)?;
                self.wait(loc, operation)
            });

        match result {
            Ok(_) => {
                info!("labelled {} with {}={}", disk_name, RESCUE_LABEL, vm.rescue.ts);
                Ok(())
            }
            Err(e) => Err(RescueError::LabelSetFailed {
                disk: disk_name.to_string(),
                details: e.to_string(),
            }),
        }
    }

    /// Attach `disk_name` under `device_name`. Secondary disks are labelled first.
    pub fn attach_disk(
        &self,
        vm: &InstanceState,
        disk_name: &str,
        device_name: &str,
        boot: bool,
    ) -> Result<()> {
        if !boot {
            self.label_disk(vm, disk_name)?;
        }

        let loc = &vm.location;
        let request = AttachDiskRequest {
            boot,
            device_name: device_name.to_string(),
            source: loc.disk_path(disk_name),
            disk_type: PERSISTENT.to_string(),
        };
        info!(
            "attaching {} to {} as {} (boot={})",
            disk_name, vm.name, device_name, boot
        );
        let operation = self.api.attach_disk(loc, &vm.name, &request)?;
        self.wait(loc, operation)?;
        Ok(())
    }

    /// Detach `device_name` unless the VM, as last loaded, no longer has it.
    pub fn detach_disk_if_attached(&self, vm: &InstanceState, device_name: &str) -> Result<()> {
        if !vm.has_device(device_name) {
            info!("device {} is not attached to {}, skipping", device_name, vm.name);
            return Ok(());
        }
        self.detach_disk(vm, device_name)
    }

    pub fn detach_disk(&self, vm: &InstanceState, device_name: &str) -> Result<()> {
        info!("detaching device {} from {}", device_name, vm.name);
        let operation = self.api.detach_disk(&vm.location, &vm.name, device_name)?;
        self.wait(&vm.location, operation)?;
        Ok(())
    }

    /// Delete `disk_name`; a disk that is already gone counts as deleted.
    pub fn delete_disk(&self, loc: &Location, disk_name: &str) -> Result<()> {
        info!("deleting disk {}", disk_name);
        let operation = match self.api.delete_disk(loc, disk_name) {
            Ok(operation) => operation,
            Err(e) if e.is_not_found() => {
                info!("disk {} is already gone", disk_name);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.wait(loc, operation)?;
        Ok(())
    }

    /// Snapshot `disk_name` and wait for the snapshot to be ready.
    pub fn create_snapshot(
        &self,
        loc: &Location,
        disk_name: &str,
        snapshot_name: &str,
    ) -> Result<Operation> {
        info!("creating snapshot {} of {}", snapshot_name, disk_name);
        let operation = self.api.create_snapshot(loc, disk_name, snapshot_name)?;
        self.wait(loc, operation)
    }

    /// Swap the boot disk: rescue disk in, original disk out.
    pub fn configure_rescue_disks(
        &self,
        vm: &InstanceState,
        source_image: &str,
        disk_type: &str,
    ) -> Result<()> {
        self.create_rescue_disk(vm, source_image, disk_type)?;
        self.detach_disk(vm, &vm.disk_binding.device_name)?;
        let rescue = vm.rescue_disk_name();
        self.attach_disk(vm, &rescue, &rescue, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{AttachedDisk, InstanceStatus, Metadata, SimulatedCompute};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn loc() -> Location {
        Location::new("p", "z")
    }

    fn instance() -> Instance {
        Instance {
            name: "v1".into(),
            status: InstanceStatus::Running,
            disks: vec![AttachedDisk {
                device_name: "persistent-disk-0".into(),
                source: loc().disk_path("d1"),
                boot: true,
                licenses: vec![],
                architecture: None,
                ..Default::default()
            }],
            metadata: Metadata::default(),
            self_link: None,
            ..Default::default()
        }
    }

    fn original_disk() -> Disk {
        Disk {
            name: "d1".into(),
            users: vec!["projects/p/zones/z/instances/v1".into()],
            labels: BTreeMap::from([("env".to_string(), "prod".to_string())]),
            label_fingerprint: Some("lf-0".into()),
            ..Disk::default()
        }
    }

    fn setup() -> (SimulatedCompute, InstanceState) {
        let api = SimulatedCompute::new(instance()).with_disk(original_disk());
        let vm = InstanceState::load(&api, loc(), "v1").expect("loads"); // test: known-good input
        (api, vm)
    }

    fn swapper(api: &SimulatedCompute) -> DiskSwapper<'_> {
        DiskSwapper::new(api, OperationWaiter::new(Duration::ZERO))
    }

    #[test]
    fn test_label_lookup_is_strict() {
        let labelled = |name: &str| Disk {
            name: name.into(),
            labels: BTreeMap::from([(RESCUE_LABEL.to_string(), "7".to_string())]),
            ..Disk::default()
        };
        let api = SimulatedCompute::new(instance()).with_disk(labelled("a"));
        assert_eq!(
            find_disk_by_label(&api, &loc(), "labels.rescue=7").unwrap().name,
            "a"
        );

        let err = find_disk_by_label(&api, &loc(), "labels.rescue=8").unwrap_err();
        assert!(matches!(err, RescueError::DiskLookup { matches: 0, .. }));

        let api = api.with_disk(labelled("b"));
        let err = find_disk_by_label(&api, &loc(), "labels.rescue=7").unwrap_err();
        assert!(matches!(err, RescueError::DiskLookup { matches: 2, .. }));
    }

    #[test]
    fn test_create_rescue_disk_creates_when_missing() {
        let (api, vm) = setup();
        swapper(&api)
            .create_rescue_disk(&vm, "projects/debian-cloud/global/images/family/debian-11", "pd-balanced")
            .expect("disk created");
        let disk = api.disk(&vm.rescue_disk_name()).expect("disk exists");
        assert_eq!(
            disk.disk_type.as_deref(),
            Some("projects/p/zones/z/diskTypes/pd-balanced")
        );
        assert_eq!(api.calls(), vec!["insert_disk"]);
    }

    #[test]
    fn test_create_rescue_disk_reuses_unattached_disk() {
        let (api, vm) = setup();
        let api = api.with_disk(Disk {
            name: vm.rescue_disk_name(),
            ..Disk::default()
        });
        swapper(&api)
            .create_rescue_disk(&vm, "img", "pd-balanced")
            .expect("existing disk reused");
        assert!(api.calls().is_empty());
    }

    #[test]
    fn test_create_rescue_disk_in_use_is_busy() {
        let (api, vm) = setup();
        let api = api.with_disk(Disk {
            name: vm.rescue_disk_name(),
            users: vec!["projects/p/zones/z/instances/other".into()],
            ..Disk::default()
        });
        let err = swapper(&api)
            .create_rescue_disk(&vm, "img", "pd-balanced")
            .unwrap_err();
        match err {
            RescueError::DiskBusy { disk, users } => {
                assert_eq!(disk, vm.rescue_disk_name());
                assert_eq!(users.len(), 1);
            }
            other => panic!("expected DiskBusy, got {:?}", other),
        }
        assert!(api.calls().is_empty());
    }

    #[test]
    fn test_label_disk_preserves_existing_labels() {
        let (api, vm) = setup();
        swapper(&api).label_disk(&vm, "d1").expect("labelled");
        let disk = api.disk("d1").expect("disk exists");
        assert_eq!(disk.labels.get("env").map(String::as_str), Some("prod"));
        assert_eq!(
            disk.labels.get(RESCUE_LABEL),
            Some(&vm.rescue.ts.to_string())
        );
        assert_eq!(
            disk.labels.get(RESCUE_DEVICE_LABEL).map(String::as_str),
            Some("persistent-disk-0")
        );
    }

    #[test]
    fn test_device_label_values() {
        assert!(is_label_value("persistent-disk-0"));
        assert!(is_label_value("data_1"));
        assert!(!is_label_value("Boot-Disk"));
        assert!(!is_label_value(""));
        assert!(!is_label_value(&"a".repeat(64)));
    }

    #[test]
    fn test_detach_skips_missing_device() {
        let (api, vm) = setup();
        swapper(&api)
            .detach_disk_if_attached(&vm, "rescue-linux-disk-1")
            .expect("nothing to detach");
        assert!(api.calls().is_empty());

        swapper(&api)
            .detach_disk_if_attached(&vm, "persistent-disk-0")
            .expect("detached");
        assert_eq!(api.calls(), vec!["detach_disk"]);
    }

    #[test]
    fn test_delete_missing_disk_is_done() {
        let (api, vm) = setup();
        swapper(&api)
            .delete_disk(&vm.location, "rescue-linux-disk-1")
            .expect("already gone");
    }

    #[test]
    fn test_label_failure_is_label_set_failed() {
        let (api, vm) = setup();
        api.fail_operation("set_disk_labels");
        let err = swapper(&api).label_disk(&vm, "d1").unwrap_err();
        assert!(matches!(err, RescueError::LabelSetFailed { ref disk, .. } if disk == "d1"));
    }

    #[test]
    fn test_secondary_attach_labels_first() {
        let (api, vm) = setup();
        let swapper = swapper(&api);
        swapper.detach_disk(&vm, "persistent-disk-0").expect("detached");
        swapper
            .attach_disk(&vm, "d1", "persistent-disk-0", false)
            .expect("attached");
        assert_eq!(
            api.calls(),
            vec!["detach_disk", "set_disk_labels", "attach_disk"]
        );
        let attached = api.instance().unwrap().disks;
        assert_eq!(attached.len(), 1);
        assert!(!attached[0].boot);
    }

    #[test]
    fn test_configure_rescue_disks_swaps_boot_disk() {
        let (api, vm) = setup();
        swapper(&api)
            .configure_rescue_disks(&vm, "img", "pd-balanced")
            .expect("configured");
        assert_eq!(api.calls(), vec!["insert_disk", "detach_disk", "attach_disk"]);

        let vm_now = api.instance().unwrap();
        let boot = vm_now.boot_disk().expect("boot disk");
        assert_eq!(boot.disk_name(), vm.rescue_disk_name());
        assert_eq!(boot.device_name, vm.rescue_disk_name());
        assert!(api.disk("d1").unwrap().users.is_empty());
    }

    #[test]
    fn test_delete_attached_disk_fails() {
        let (api, vm) = setup();
        assert!(swapper(&api).delete_disk(&vm.location, "d1").is_err());
    }

    #[test]
    fn test_snapshot() {
        let (api, vm) = setup();
        swapper(&api)
            .create_snapshot(&vm.location, "d1", &vm.snapshot_name())
            .expect("snapshot");
        assert_eq!(api.snapshots(), vec![vm.snapshot_name()]);
    }

    #[test]
    fn test_recovery_image_default_and_tie_break() {
        let config = RescueConfig::default();
        let mut vm = instance();
        assert_eq!(
            guess_recovery_image(&vm, &config).unwrap(),
            "projects/debian-cloud/global/images/family/debian-11"
        );

        vm.disks[0].licenses =
            vec!["https://www.googleapis.com/compute/v1/projects/debian-cloud/global/licenses/debian-11-bullseye".into()];
        assert_eq!(
            guess_recovery_image(&vm, &config).unwrap(),
            "projects/rocky-linux-cloud/global/images/family/rocky-linux-9"
        );
    }

    #[test]
    fn test_recovery_image_by_architecture() {
        let config = RescueConfig::default();
        let mut vm = instance();
        vm.disks[0].architecture = Some("ARM64".into());
        assert_eq!(
            guess_recovery_image(&vm, &config).unwrap(),
            "projects/debian-cloud/global/images/family/debian-11-arm64"
        );

        vm.disks[0].architecture = Some("RISCV64".into());
        assert!(matches!(
            guess_recovery_image(&vm, &config),
            Err(RescueError::InvalidInstance(_))
        ));
    }
}
