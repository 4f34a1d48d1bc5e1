//! VM state snapshot
//!
//! `InstanceState` is built once per invocation from a single `instances.get`
//! and carries everything the pipeline needs to know about the VM.
//!
//! # Design
//!
//! - **Rescue flag is fixed**: `rescue` is derived from the `rescue-mode`
//!   metadata item at construction and never recomputed, so the transition
//!   direction cannot change halfway through a run
//! - **One session timestamp**: every derived name (rescue disk, snapshot,
//!   label, marker) comes from `rescue.ts`
//! - **Backup items are the source of truth** for the metadata restored at the
//!   end of either direction

use crate::compute::{ComputeApi, Instance, InstanceStatus, Location, Metadata, MetadataItem};
use crate::disks;
use crate::error::{RescueError, Result};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Disk label key marking the original boot disk during a rescue session
pub const RESCUE_LABEL: &str = "rescue";

/// Disk label recording the original boot disk's device name
pub const RESCUE_DEVICE_LABEL: &str = "rescue-device";

/// Metadata key marking a VM as being in rescue mode
pub const RESCUE_MODE_KEY: &str = "rescue-mode";

/// Metadata key of the guest startup script
pub const STARTUP_SCRIPT_KEY: &str = "startup-script";

/// Whether the VM is in rescue mode, and the session timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RescueMode {
    pub active: bool,
    /// Unix seconds; taken from the marker when active, from the clock otherwise
    pub ts: u64,
}

impl RescueMode {
    /// Detect rescue mode from instance metadata, stamping new sessions with now.
    pub fn detect(metadata: &Metadata) -> Result<Self> {
        Self::detect_at(metadata, unix_now())
    }

    /// Like [`detect`](Self::detect) with an explicit clock.
    pub fn detect_at(metadata: &Metadata, now: u64) -> Result<Self> {
        let Some(item) = metadata.items.iter().find(|item| item.key == RESCUE_MODE_KEY) else {
            return Ok(Self {
                active: false,
                ts: now,
            });
        };

        let value = item.value.as_deref().unwrap_or_default().trim();
        let ts = value.parse::<u64>().map_err(|_| {
            RescueError::invalid_instance(format!(
                "metadata {} has non-numeric value '{}'",
                RESCUE_MODE_KEY, value
            ))
        })?;
        Ok(Self { active: true, ts })
    }

    /// Filter matching disks labelled for this session.
    pub fn label_filter(&self) -> String {
        format!("labels.{}={}", RESCUE_LABEL, self.ts)
    }

    /// The `rescue-mode` metadata item for this session.
    pub fn marker(&self) -> MetadataItem {
        MetadataItem::new(RESCUE_MODE_KEY, self.ts.to_string())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// The disk playing the boot role of the original configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskBinding {
    pub device_name: String,
    pub disk_name: String,
}

/// In-memory snapshot of one VM.
#[derive(Debug, Clone)]
pub struct InstanceState {
    pub location: Location,
    pub name: String,
    /// Updated after every successful start/stop
    pub status: InstanceStatus,
    pub rescue: RescueMode,
    pub disk_binding: DiskBinding,
    /// Original metadata items; markers are added/removed in place
    pub backup_items: Vec<MetadataItem>,
    /// Metadata fingerprint, refreshed before each metadata write
    pub fingerprint: Option<String>,
    /// Instance resource as fetched at construction
    pub instance: Instance,
}

impl InstanceState {
    /// Fetch the VM and derive its state.
    ///
    /// In rescue mode the original disk is the one labelled `rescue=<ts>`
    /// (strict lookup); otherwise it is the current boot disk. A labelled disk
    /// that an interrupted exit already detached keeps the device name from
    /// its `rescue-device` label, falling back to the disk name.
    pub fn load(api: &dyn ComputeApi, location: Location, name: &str) -> Result<Self> {
        let instance = api.get_instance(&location, name)?;
        let rescue = RescueMode::detect(&instance.metadata)?;
        debug!(
            "{} rescue mode active={} ts={}",
            name, rescue.active, rescue.ts
        );

        let disk_binding = if rescue.active {
            let disk = disks::find_disk_by_label(api, &location, &rescue.label_filter())?;
            let attached = instance
                .disks
                .iter()
                .find(|attached| attached.has_source() && attached.disk_name() == disk.name);
            let device_name = match (attached, disk.labels.get(RESCUE_DEVICE_LABEL)) {
                (Some(attached), _) => attached.device_name.clone(),
                (None, Some(device)) => {
                    warn!(
                        "{} is not attached to {}, will attach it as {}",
                        disk.name, name, device
                    );
                    device.clone()
                }
                (None, None) => {
                    warn!(
                        "{} is not attached to {} and has no {} label, using the disk name",
                        disk.name, name, RESCUE_DEVICE_LABEL
                    );
                    disk.name.clone()
                }
            };
            DiskBinding {
                device_name,
                disk_name: disk.name,
            }
        } else {
            let boot = instance.boot_disk().ok_or_else(|| {
                RescueError::invalid_instance(format!("{} has no boot disk", name))
            })?;
            DiskBinding {
                device_name: boot.device_name.clone(),
                disk_name: boot.disk_name().to_string(),
            }
        };

        info!(
            "loaded {} in {} ({}, original disk {} as {})",
            name, location, instance.status, disk_binding.disk_name, disk_binding.device_name
        );

        Ok(Self {
            name: name.to_string(),
            status: instance.status,
            rescue,
            disk_binding,
            backup_items: instance.metadata.items.clone(),
            fingerprint: instance.metadata.fingerprint.clone(),
            instance,
            location,
        })
    }

    /// Re-read the metadata fingerprint from the control plane.
    pub fn refresh_fingerprint(&mut self, api: &dyn ComputeApi) -> Result<()> {
        let current = api.get_instance(&self.location, &self.name)?;
        debug!(
            "metadata fingerprint {:?} -> {:?}",
            self.fingerprint, current.metadata.fingerprint
        );
        self.fingerprint = current.metadata.fingerprint;
        Ok(())
    }

    pub fn is_rescue_active(&self) -> bool {
        self.rescue.active
    }

    pub fn rescue_disk_name(&self) -> String {
        format!("rescue-linux-disk-{}", self.rescue.ts)
    }

    pub fn snapshot_name(&self) -> String {
        format!("{}-{}", self.disk_binding.disk_name, self.rescue.ts)
    }

    /// Whether a device with this name is attached, as of the last load.
    pub fn has_device(&self, device_name: &str) -> bool {
        self.instance
            .disks
            .iter()
            .any(|disk| disk.device_name == device_name)
    }

    /// `RESTORE#<json>` line preserving the original instance resource.
    pub fn restore_record(&self) -> Result<String> {
        Ok(format!("RESTORE#{}", serde_json::to_string(&self.instance)?))
    }
}
