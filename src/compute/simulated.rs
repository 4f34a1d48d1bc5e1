//! In-memory Compute Engine model.
//!
//! `SimulatedCompute` keeps one instance plus a pool of disks and applies
//! mutations the way the real control plane does, closely enough for the
//! rescue pipeline to run end to end:
//!
//! - Mutations return a `RUNNING` operation that reads back as `DONE`
//! - Metadata and label writes are rejected on a stale fingerprint (HTTP 412)
//! - Deleting an attached disk is rejected (HTTP 400)
//! - Starting the instance replays the startup script's `END:<ts>` sentinel
//!   on the serial console
//!
//! Every mutating call is appended to a journal. `--dry-run` prints the
//! journal; tests assert on it and inject failures per call.

use crate::compute::types::*;
use crate::compute::ComputeApi;
use crate::error::{RescueError, Result};
use crate::instance::InstanceState;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// In-memory implementation of [`ComputeApi`].
pub struct SimulatedCompute {
    state: Mutex<SimState>,
}

#[derive(Default)]
struct SimState {
    instance: Option<Instance>,
    disks: BTreeMap<String, Disk>,
    snapshots: Vec<String>,
    operations: HashMap<String, Operation>,
    next_operation: u64,
    next_fingerprint: u64,
    serial: String,
    journal: Vec<String>,
    failing_calls: BTreeSet<String>,
    failing_operations: BTreeSet<String>,
}

impl SimState {
    fn instance(&self, name: &str) -> Result<&Instance> {
        self.instance
            .as_ref()
            .filter(|instance| instance.name == name)
            .ok_or_else(|| RescueError::NotFound(format!("instance {}", name)))
    }

    fn instance_mut(&mut self, name: &str) -> Result<&mut Instance> {
        self.instance
            .as_mut()
            .filter(|instance| instance.name == name)
            .ok_or_else(|| RescueError::NotFound(format!("instance {}", name)))
    }

    fn disk_mut(&mut self, name: &str) -> Result<&mut Disk> {
        self.disks
            .get_mut(name)
            .ok_or_else(|| RescueError::NotFound(format!("disk {}", name)))
    }

    fn fingerprint(&mut self, prefix: &str) -> String {
        self.next_fingerprint += 1;
        format!("{}-{}", prefix, self.next_fingerprint)
    }

    /// Record a mutating call; fails if the call was marked as failing.
    fn record(&mut self, call: &str, detail: String) -> Result<()> {
        debug!("simulated {}({})", call, detail);
        self.journal.push(format!("{}({})", call, detail));
        if self.failing_calls.contains(call) {
            return Err(RescueError::Api {
                status: 500,
                message: format!("injected failure in {}", call),
            });
        }
        Ok(())
    }

    /// Register a new pending operation for `call`.
    fn operation(&mut self, call: &str, target: &str) -> Operation {
        self.next_operation += 1;
        let name = format!("operation-{}", self.next_operation);
        let error = self.failing_operations.contains(call).then(|| OperationError {
            errors: vec![OperationErrorDetail {
                code: "SIMULATED_FAILURE".to_string(),
                message: format!("{} on {} failed", call, target),
            }],
        });
        let done = Operation {
            name: name.clone(),
            status: OperationStatus::Done,
            error,
            target_link: Some(target.to_string()),
        };
        self.operations.insert(name.clone(), done);
        Operation {
            name,
            status: OperationStatus::Running,
            error: None,
            target_link: Some(target.to_string()),
        }
    }
}

fn instance_link(loc: &Location, name: &str) -> String {
    format!("projects/{}/zones/{}/instances/{}", loc.project, loc.zone, name)
}

/// Extract the `END:<digits>` sentinel a startup script will print, if any.
fn startup_sentinel(metadata: &Metadata) -> Option<String> {
    let script = metadata
        .items
        .iter()
        .find(|item| item.key == "startup-script")?
        .value
        .as_deref()?;
    let start = script.find("END:")?;
    let digits: String = script[start + 4..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    (!digits.is_empty()).then(|| format!("END:{}", digits))
}

/// Evaluate the two filter shapes the pipeline issues:
/// `labels.<key>=<value>` and `name=<value>`.
fn matches_filter(disk: &Disk, filter: &str) -> bool {
    let Some((field, value)) = filter.split_once('=') else {
        return false;
    };
    let (field, value) = (field.trim(), value.trim());
    match field.strip_prefix("labels.") {
        Some(label) => disk.labels.get(label).is_some_and(|v| v == value),
        None if field == "name" => disk.name == value,
        None => false,
    }
}

impl SimulatedCompute {
    /// Create a simulation holding `instance` and no disks.
    pub fn new(instance: Instance) -> Self {
        Self {
            state: Mutex::new(SimState {
                instance: Some(instance),
                ..SimState::default()
            }),
        }
    }

    /// Add a disk to the pool.
    pub fn with_disk(self, disk: Disk) -> Self {
        self.state().disks.insert(disk.name.clone(), disk);
        self
    }

    /// Make every call named `call` (e.g. `"start_instance"`) fail immediately.
    pub fn fail_call(&self, call: &str) {
        self.state().failing_calls.insert(call.to_string());
    }

    /// Let calls named `call` succeed again after [`fail_call`](Self::fail_call).
    pub fn clear_failure(&self, call: &str) {
        self.state().failing_calls.remove(call);
    }

    /// Make operations created by `call` finish `DONE` with an error payload.
    pub fn fail_operation(&self, call: &str) {
        self.state().failing_operations.insert(call.to_string());
    }

    /// Mirror the live VM behind `api` into a simulation.
    ///
    /// Only read calls are issued against `api`: the instance as captured in
    /// `vm`, every disk attached to it, the canonical rescue disk (if it
    /// exists) and, when rescue mode is active, the disks carrying the
    /// session label.
    pub fn mirror(api: &dyn ComputeApi, vm: &InstanceState) -> Result<Self> {
        let loc = &vm.location;
        let mut names: BTreeSet<String> = vm
            .instance
            .disks
            .iter()
            .filter(|disk| disk.has_source())
            .map(|disk| disk.disk_name().to_string())
            .collect();
        names.insert(vm.rescue_disk_name());

        let mut sim = Self::new(vm.instance.clone());
        for name in names {
            match api.get_disk(loc, &name) {
                Ok(disk) => sim = sim.with_disk(disk),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        if vm.rescue.active {
            for disk in api.list_disks(loc, &vm.rescue.label_filter())? {
                sim = sim.with_disk(disk);
            }
        }
        Ok(sim)
    }

    /// Mutating calls issued so far, formatted as `call(detail)`.
    pub fn journal(&self) -> Vec<String> {
        self.state().journal.clone()
    }

    /// Names of mutating calls issued so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state()
            .journal
            .iter()
            .map(|entry| entry.split('(').next().unwrap_or(entry).to_string())
            .collect()
    }

    /// Current state of the simulated instance.
    pub fn instance(&self) -> Option<Instance> {
        self.state().instance.clone()
    }

    /// Current state of a disk in the pool.
    pub fn disk(&self, name: &str) -> Option<Disk> {
        self.state().disks.get(name).cloned()
    }

    /// Names of snapshots created so far.
    pub fn snapshots(&self) -> Vec<String> {
        self.state().snapshots.clone()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not wedge the remaining assertions
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ComputeApi for SimulatedCompute {
    fn get_instance(&self, _loc: &Location, instance: &str) -> Result<Instance> {
        self.state().instance(instance).cloned()
    }

    fn start_instance(&self, loc: &Location, instance: &str) -> Result<Operation> {
        let mut state = self.state();
        state.record("start_instance", instance.to_string())?;
        let vm = state.instance_mut(instance)?;
        vm.status = InstanceStatus::Running;
        let sentinel = startup_sentinel(&vm.metadata);
        state.serial.push_str("Booting...\n");
        if let Some(sentinel) = sentinel {
            state.serial.push_str(&sentinel);
            state.serial.push('\n');
        }
        Ok(state.operation("start_instance", &instance_link(loc, instance)))
    }

    fn stop_instance(&self, loc: &Location, instance: &str) -> Result<Operation> {
        let mut state = self.state();
        state.record("stop_instance", instance.to_string())?;
        state.instance_mut(instance)?.status = InstanceStatus::Terminated;
        Ok(state.operation("stop_instance", &instance_link(loc, instance)))
    }

    fn attach_disk(
        &self,
        loc: &Location,
        instance: &str,
        request: &AttachDiskRequest,
    ) -> Result<Operation> {
        let mut state = self.state();
        let disk_name = resource_name(&request.source).to_string();
        state.record(
            "attach_disk",
            format!(
                "{} as {}, boot={}",
                disk_name, request.device_name, request.boot
            ),
        )?;

        let link = instance_link(loc, instance);
        if state
            .instance(instance)?
            .disks
            .iter()
            .any(|disk| disk.device_name == request.device_name)
        {
            return Err(RescueError::Api {
                status: 400,
                message: format!("device name {} already in use", request.device_name),
            });
        }
        state.disk_mut(&disk_name)?.users.push(link.clone());
        state.instance_mut(instance)?.disks.push(AttachedDisk {
            device_name: request.device_name.clone(),
            source: request.source.clone(),
            boot: request.boot,
            licenses: Vec::new(),
            architecture: None,
            ..Default::default()
        });
        Ok(state.operation("attach_disk", &link))
    }

    fn detach_disk(
        &self,
        loc: &Location,
        instance: &str,
        device_name: &str,
    ) -> Result<Operation> {
        let mut state = self.state();
        state.record("detach_disk", device_name.to_string())?;

        let link = instance_link(loc, instance);
        let vm = state.instance_mut(instance)?;
        let position = vm
            .disks
            .iter()
            .position(|disk| disk.device_name == device_name)
            .ok_or_else(|| {
                RescueError::NotFound(format!("device {} on {}", device_name, instance))
            })?;
        let detached = vm.disks.remove(position);
        // Mirrored disks carry full user URLs, simulated ones partial paths
        if let Ok(disk) = state.disk_mut(detached.disk_name()) {
            disk.users.retain(|user| resource_name(user) != instance);
        }
        Ok(state.operation("detach_disk", &link))
    }

    fn set_metadata(
        &self,
        loc: &Location,
        instance: &str,
        metadata: &Metadata,
    ) -> Result<Operation> {
        let mut state = self.state();
        let keys: Vec<&str> = metadata.items.iter().map(|item| item.key.as_str()).collect();
        state.record("set_metadata", keys.join(","))?;

        let fingerprint = state.fingerprint("md");
        let vm = state.instance_mut(instance)?;
        if vm.metadata.fingerprint != metadata.fingerprint {
            return Err(RescueError::Api {
                status: 412,
                message: "Supplied fingerprint does not match current metadata fingerprint."
                    .to_string(),
            });
        }
        vm.metadata = Metadata {
            fingerprint: Some(fingerprint),
            items: metadata.items.clone(),
        };
        Ok(state.operation("set_metadata", &instance_link(loc, instance)))
    }

    fn get_serial_port_output(&self, _loc: &Location, instance: &str) -> Result<SerialPortOutput> {
        let state = self.state();
        state.instance(instance)?;
        Ok(SerialPortOutput {
            contents: state.serial.clone(),
        })
    }

    fn get_disk(&self, _loc: &Location, disk: &str) -> Result<Disk> {
        self.state()
            .disks
            .get(disk)
            .cloned()
            .ok_or_else(|| RescueError::NotFound(format!("disk {}", disk)))
    }

    fn insert_disk(&self, loc: &Location, disk: &DiskInsert) -> Result<Operation> {
        let mut state = self.state();
        state.record(
            "insert_disk",
            format!("{} from {}", disk.name, disk.source_image),
        )?;
        if state.disks.contains_key(&disk.name) {
            return Err(RescueError::Api {
                status: 409,
                message: format!("disk {} already exists", disk.name),
            });
        }
        let label_fingerprint = state.fingerprint("lf");
        state.disks.insert(
            disk.name.clone(),
            Disk {
                name: disk.name.clone(),
                label_fingerprint: Some(label_fingerprint),
                source_image: Some(disk.source_image.clone()),
                disk_type: Some(disk.disk_type.clone()),
                ..Disk::default()
            },
        );
        Ok(state.operation("insert_disk", &loc.disk_path(&disk.name)))
    }

    fn delete_disk(&self, loc: &Location, disk: &str) -> Result<Operation> {
        let mut state = self.state();
        state.record("delete_disk", disk.to_string())?;
        let users = state.disk_mut(disk)?.users.clone();
        if !users.is_empty() {
            return Err(RescueError::Api {
                status: 400,
                message: format!("disk {} is in use by {:?}", disk, users),
            });
        }
        state.disks.remove(disk);
        Ok(state.operation("delete_disk", &loc.disk_path(disk)))
    }

    fn list_disks(&self, _loc: &Location, filter: &str) -> Result<Vec<Disk>> {
        Ok(self
            .state()
            .disks
            .values()
            .filter(|disk| matches_filter(disk, filter))
            .cloned()
            .collect())
    }

    fn set_disk_labels(
        &self,
        loc: &Location,
        disk: &str,
        request: &SetLabelsRequest,
    ) -> Result<Operation> {
        let mut state = self.state();
        let labels: Vec<String> = request
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        state.record("set_disk_labels", format!("{} {}", disk, labels.join(",")))?;

        let fingerprint = state.fingerprint("lf");
        let target = state.disk_mut(disk)?;
        if target.label_fingerprint != request.label_fingerprint {
            return Err(RescueError::Api {
                status: 412,
                message: "Labels fingerprint either invalid or resource labels have changed"
                    .to_string(),
            });
        }
        target.labels = request.labels.clone();
        target.label_fingerprint = Some(fingerprint);
        Ok(state.operation("set_disk_labels", &loc.disk_path(disk)))
    }

    fn create_snapshot(
        &self,
        loc: &Location,
        disk: &str,
        snapshot_name: &str,
    ) -> Result<Operation> {
        let mut state = self.state();
        state.record("create_snapshot", format!("{} -> {}", disk, snapshot_name))?;
        state.disk_mut(disk)?;
        if state.snapshots.iter().any(|name| name == snapshot_name) {
            return Err(RescueError::Api {
                status: 409,
                message: format!("snapshot {} already exists", snapshot_name),
            });
        }
        state.snapshots.push(snapshot_name.to_string());
        Ok(state.operation("create_snapshot", &loc.disk_path(disk)))
    }

    fn get_zone_operation(&self, _loc: &Location, operation: &str) -> Result<Operation> {
        self.state()
            .operations
            .get(operation)
            .cloned()
            .ok_or_else(|| RescueError::NotFound(format!("operation {}", operation)))
    }
}
