//! Instance metadata changes
//!
//! Entering rescue mode replaces the whole metadata item set with a single
//! `startup-script` item. Once the guest is up, the original items come back
//! together with the `rescue-mode` marker. Leaving rescue mode writes the
//! original items without the marker.
//!
//! Every write is preconditioned on a fingerprint read right before it.

use crate::compute::{ComputeApi, Metadata, MetadataItem};
use crate::error::{RescueError, Result};
use crate::instance::{InstanceState, RESCUE_MODE_KEY, STARTUP_SCRIPT_KEY};
use crate::operation::OperationWaiter;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Placeholder for the original boot disk's device name
pub const DISK_NAME_PLACEHOLDER: &str = "GOOGLE_DISK_NAME";

/// Placeholder for the rescue session timestamp
pub const TS_PLACEHOLDER: &str = "GOOGLE_TS";

pub const DEFAULT_GUEST_BOOT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_GUEST_BOOT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Substitute the template placeholders.
pub fn render_startup_script(template: &str, device_name: &str, ts: u64) -> String {
    template
        .replace(DISK_NAME_PLACEHOLDER, device_name)
        .replace(TS_PLACEHOLDER, &ts.to_string())
}

/// Serial console line the startup script prints when it is done.
pub fn boot_sentinel(ts: u64) -> String {
    format!("END:{}", ts)
}

pub struct MetadataManager<'a> {
    api: &'a dyn ComputeApi,
    waiter: OperationWaiter,
    boot_timeout: Duration,
    boot_poll_interval: Duration,
}

impl<'a> MetadataManager<'a> {
    pub fn new(api: &'a dyn ComputeApi, waiter: OperationWaiter) -> Self {
        Self {
            api,
            waiter,
            boot_timeout: DEFAULT_GUEST_BOOT_TIMEOUT,
            boot_poll_interval: DEFAULT_GUEST_BOOT_POLL_INTERVAL,
        }
    }

    /// Override how long, and how often, the guest boot is polled.
    pub fn with_guest_boot(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.boot_timeout = timeout;
        self.boot_poll_interval = poll_interval;
        self
    }

    fn write(&self, vm: &mut InstanceState, items: Vec<MetadataItem>) -> Result<()> {
        vm.refresh_fingerprint(self.api)?;
        let metadata = Metadata {
            fingerprint: vm.fingerprint.clone(),
            items,
        };
        let operation = self.api.set_metadata(&vm.location, &vm.name, &metadata)?;
        self.waiter.wait(self.api, &vm.location, operation)?;
        Ok(())
    }

    /// Replace all metadata items with the rendered startup script.
    pub fn set_rescue_metadata(&self, vm: &mut InstanceState, template: &str) -> Result<()> {
        let script =
            render_startup_script(template, &vm.disk_binding.device_name, vm.rescue.ts);
        info!("setting rescue startup script on {}", vm.name);
        self.write(vm, vec![MetadataItem::new(STARTUP_SCRIPT_KEY, script)])
    }

    /// Write the original metadata items back.
    ///
    /// With `remove_rescue_mode == false` (entering rescue mode) the marker is
    /// added and the write waits for the guest to finish booting, so the
    /// startup script is not pulled from under it. With `true` (leaving) the
    /// marker is removed and nothing waits on the guest.
    pub fn restore_metadata(&self, vm: &mut InstanceState, remove_rescue_mode: bool) -> Result<()> {
        let marker = vm.rescue.marker();

        if remove_rescue_mode {
            let before = vm.backup_items.len();
            vm.backup_items.retain(|item| item.key != RESCUE_MODE_KEY);
            if vm.backup_items.len() == before {
                warn!("{} has no {} item to remove", vm.name, RESCUE_MODE_KEY);
            }
        } else {
            vm.backup_items.retain(|item| item.key != RESCUE_MODE_KEY);
            vm.backup_items.push(marker);
            self.wait_for_guest_boot(vm)?;
        }

        info!("restoring original metadata on {}", vm.name);
        let items = vm.backup_items.clone();
        self.write(vm, items)
    }

    /// Poll the serial console until the session sentinel shows up.
    pub fn wait_for_guest_boot(&self, vm: &InstanceState) -> Result<()> {
        let sentinel = boot_sentinel(vm.rescue.ts);
        let started = Instant::now();
        info!("waiting for the startup script to complete ({})", sentinel);

        loop {
            let output = self.api.get_serial_port_output(&vm.location, &vm.name)?;
            if output.contents.contains(&sentinel) {
                info!("startup script has ended");
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= self.boot_timeout {
                return Err(RescueError::GuestBootTimeout { sentinel, waited });
            }
            debug!("{} not seen yet after {:?}", sentinel, waited);
            thread::sleep(self.boot_poll_interval.min(self.boot_timeout - waited));
        }
    }
}
