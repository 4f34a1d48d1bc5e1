//! Rescue pipeline
//!
//! Turns the VM's current rescue state into one of two ordered step lists
//! and runs it.
//!
//! | Transition   | Steps |
//! |--------------|-------|
//! | EnterRescue  | Stop → Snapshot (background) → Swap disks → Rescue metadata → Start → Attach original → Restore metadata (+marker) |
//! | ExitRescue   | Stop → Detach disks → Delete rescue disk → Restore metadata (−marker) → Reattach original as boot → Start |
//!
//! # Design
//!
//! - **Strictly sequential**: a step starts only after the previous one's
//!   operations are `DONE`
//! - **Fail fast, no rollback**: the first failing step aborts the run and
//!   leaves the VM where it is
//! - **Snapshot is joined, never abandoned**: the background snapshot is
//!   joined before the original disk is reattached, and on abort

use crate::background::BackgroundTask;
use crate::compute::{ComputeApi, InstanceStatus, Operation};
use crate::config::RescueConfig;
use crate::disks::{guess_recovery_image, DiskSwapper};
use crate::error::Result;
use crate::instance::InstanceState;
use crate::metadata::MetadataManager;
use crate::operation::OperationWaiter;
use crate::progress::ProgressHandle;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

// ============================================================================
// Plan
// ============================================================================

/// Direction of the run, fixed by the VM's rescue flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    EnterRescue,
    ExitRescue,
}

impl Transition {
    pub fn for_state(vm: &InstanceState) -> Self {
        if vm.is_rescue_active() {
            Self::ExitRescue
        } else {
            Self::EnterRescue
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnterRescue => write!(f, "enter rescue mode"),
            Self::ExitRescue => write!(f, "restore original configuration"),
        }
    }
}

/// One pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    StopInstance,
    /// Start snapshotting the original boot disk on a background thread
    BeginSnapshot,
    /// Create the rescue disk, detach the original, attach the rescue disk as boot
    ConfigureRescueDisks,
    SetRescueMetadata,
    StartInstance,
    /// Join the snapshot, label the original disk and attach it as secondary
    AttachOriginalDisk,
    RestoreMetadata { remove_rescue_mode: bool },
    /// Detach both the rescue disk and the relocated original disk
    DetachDisks,
    DeleteRescueDisk,
    /// Attach the original disk back as boot
    ReattachOriginalDisk,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StopInstance => write!(f, "Stopping instance"),
            Self::BeginSnapshot => write!(f, "Starting boot disk snapshot"),
            Self::ConfigureRescueDisks => write!(f, "Configuring rescue disks"),
            Self::SetRescueMetadata => write!(f, "Setting rescue metadata"),
            Self::StartInstance => write!(f, "Starting instance"),
            Self::AttachOriginalDisk => write!(f, "Attaching original disk"),
            Self::RestoreMetadata { remove_rescue_mode: false } => {
                write!(f, "Restoring metadata (marking rescue mode)")
            }
            Self::RestoreMetadata { remove_rescue_mode: true } => {
                write!(f, "Restoring metadata (removing rescue mode)")
            }
            Self::DetachDisks => write!(f, "Detaching disks"),
            Self::DeleteRescueDisk => write!(f, "Deleting rescue disk"),
            Self::ReattachOriginalDisk => write!(f, "Reattaching original boot disk"),
        }
    }
}

/// Ordered steps for `transition`.
pub fn plan(transition: Transition, skip_snapshot: bool) -> Vec<Step> {
    match transition {
        Transition::EnterRescue => {
            let mut steps = vec![Step::StopInstance];
            if !skip_snapshot {
                steps.push(Step::BeginSnapshot);
            }
            steps.extend([
                Step::ConfigureRescueDisks,
                Step::SetRescueMetadata,
                Step::StartInstance,
                Step::AttachOriginalDisk,
                Step::RestoreMetadata {
                    remove_rescue_mode: false,
                },
            ]);
            steps
        }
        Transition::ExitRescue => vec![
            Step::StopInstance,
            Step::DetachDisks,
            Step::DeleteRescueDisk,
            Step::RestoreMetadata {
                remove_rescue_mode: true,
            },
            Step::ReattachOriginalDisk,
            Step::StartInstance,
        ],
    }
}

// ============================================================================
// Execution
// ============================================================================

/// A planned run.
#[derive(Debug, Clone)]
pub struct TaskPipeline {
    transition: Transition,
    steps: Vec<Step>,
}

impl TaskPipeline {
    pub fn new(transition: Transition, config: &RescueConfig) -> Self {
        Self {
            transition,
            steps: plan(transition, config.skip_snapshot),
        }
    }

    pub fn for_state(vm: &InstanceState, config: &RescueConfig) -> Self {
        Self::new(Transition::for_state(vm), config)
    }

    pub fn transition(&self) -> Transition {
        self.transition
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Human-readable plan for logging and `--dry-run`.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("Plan: {} ({} steps)", self.transition, self.steps.len())];
        for (i, step) in self.steps.iter().enumerate() {
            lines.push(format!("  {}. {}", i + 1, step));
        }
        lines.join("\n")
    }

    /// Run every step through `execute`, stopping at the first error.
    pub fn run_with<F>(&self, progress: &ProgressHandle, mut execute: F) -> Result<()>
    where
        F: FnMut(Step) -> Result<()>,
    {
        let total = self.steps.len();
        for (i, step) in self.steps.iter().enumerate() {
            info!("[{}/{}] {}", i + 1, total, step);
            if let Err(e) = execute(*step) {
                error!("{} failed: {}", step, e);
                return Err(e);
            }
            progress.advance();
        }
        info!("{}: all {} steps completed", self.transition, total);
        Ok(())
    }

    /// Run the pipeline against `vm`.
    pub fn run(
        &self,
        api: Arc<dyn ComputeApi>,
        vm: &mut InstanceState,
        config: &RescueConfig,
        progress: &ProgressHandle,
    ) -> Result<()> {
        let mut executor = StepExecutor::new(api, vm, config);
        let result = self.run_with(progress, |step| executor.execute(step));
        executor.finish(result)
    }
}

fn metadata_manager<'b>(
    api: &'b dyn ComputeApi,
    waiter: OperationWaiter,
    config: &RescueConfig,
) -> MetadataManager<'b> {
    MetadataManager::new(api, waiter)
        .with_guest_boot(config.guest_boot_timeout(), config.guest_boot_poll_interval())
}

/// Pipeline state carried between steps.
struct StepExecutor<'a> {
    api: Arc<dyn ComputeApi>,
    vm: &'a mut InstanceState,
    config: &'a RescueConfig,
    waiter: OperationWaiter,
    pending_snapshot: Option<BackgroundTask<Operation>>,
}

impl<'a> StepExecutor<'a> {
    fn new(api: Arc<dyn ComputeApi>, vm: &'a mut InstanceState, config: &'a RescueConfig) -> Self {
        Self {
            api,
            vm,
            config,
            waiter: config.operation_waiter(),
            pending_snapshot: None,
        }
    }

    fn execute(&mut self, step: Step) -> Result<()> {
        match step {
            Step::StopInstance => self.stop_instance(),
            Step::StartInstance => self.start_instance(),
            Step::BeginSnapshot => self.begin_snapshot(),
            Step::ConfigureRescueDisks => {
                let image = guess_recovery_image(&self.vm.instance, self.config)?;
                info!("using recovery image {}", image);
                DiskSwapper::new(self.api.as_ref(), self.waiter)
                    .configure_rescue_disks(self.vm, &image, &self.config.disk_type)
            }
            Step::SetRescueMetadata => {
                let template = self.config.startup_script_template()?;
                metadata_manager(self.api.as_ref(), self.waiter, self.config)
                    .set_rescue_metadata(self.vm, &template)
            }
            Step::AttachOriginalDisk => {
                if let Some(snapshot) = self.pending_snapshot.take() {
                    if !snapshot.is_finished() {
                        info!("waiting for {}", snapshot.name());
                    }
                    snapshot.join()?;
                    info!("snapshot {} is ready", self.vm.snapshot_name());
                }
                let binding = self.vm.disk_binding.clone();
                DiskSwapper::new(self.api.as_ref(), self.waiter)
                    .attach_disk(self.vm, &binding.disk_name, &binding.device_name, false)
            }
            Step::RestoreMetadata { remove_rescue_mode } => {
                metadata_manager(self.api.as_ref(), self.waiter, self.config)
                    .restore_metadata(self.vm, remove_rescue_mode)
            }
            Step::DetachDisks => {
                let disks = DiskSwapper::new(self.api.as_ref(), self.waiter);
                disks.detach_disk_if_attached(self.vm, &self.vm.rescue_disk_name())?;
                disks.detach_disk_if_attached(self.vm, &self.vm.disk_binding.device_name)
            }
            Step::DeleteRescueDisk => DiskSwapper::new(self.api.as_ref(), self.waiter)
                .delete_disk(&self.vm.location, &self.vm.rescue_disk_name()),
            Step::ReattachOriginalDisk => {
                let binding = self.vm.disk_binding.clone();
                DiskSwapper::new(self.api.as_ref(), self.waiter)
                    .attach_disk(self.vm, &binding.disk_name, &binding.device_name, true)
            }
        }
    }

    fn stop_instance(&mut self) -> Result<()> {
        if matches!(
            self.vm.status,
            InstanceStatus::Terminated | InstanceStatus::Stopped
        ) {
            info!("{} is already {}, not stopping", self.vm.name, self.vm.status);
            return Ok(());
        }
        let operation = self.api.stop_instance(&self.vm.location, &self.vm.name)?;
        self.waiter.wait(self.api.as_ref(), &self.vm.location, operation)?;
        self.vm.status = InstanceStatus::Terminated;
        Ok(())
    }

    fn start_instance(&mut self) -> Result<()> {
        if self.vm.status == InstanceStatus::Running {
            info!("{} is already running, not starting", self.vm.name);
            return Ok(());
        }
        let operation = self.api.start_instance(&self.vm.location, &self.vm.name)?;
        self.waiter.wait(self.api.as_ref(), &self.vm.location, operation)?;
        self.vm.status = InstanceStatus::Running;
        Ok(())
    }

    fn begin_snapshot(&mut self) -> Result<()> {
        let api = Arc::clone(&self.api);
        let waiter = self.waiter;
        let location = self.vm.location.clone();
        let disk = self.vm.disk_binding.disk_name.clone();
        let snapshot = self.vm.snapshot_name();

        let task = BackgroundTask::spawn(format!("snapshot-{}", snapshot), move || {
            DiskSwapper::new(api.as_ref(), waiter).create_snapshot(&location, &disk, &snapshot)
        })?;
        self.pending_snapshot = Some(task);
        Ok(())
    }

    /// Join a snapshot still in flight, then hand back the run result.
    fn finish(mut self, result: Result<()>) -> Result<()> {
        let Some(snapshot) = self.pending_snapshot.take() else {
            return result;
        };

        warn!(
            "waiting for snapshot {} before exiting",
            self.vm.snapshot_name()
        );
        match (result, snapshot.join()) {
            (Err(e), Err(snapshot_err)) => {
                error!("snapshot failed too: {}", snapshot_err);
                Err(e)
            }
            (Err(e), Ok(_)) => Err(e),
            (Ok(()), joined) => joined.map(|_| ()),
        }
    }
}
