//! Long-running operation polling.
//!
//! Every mutating control-plane call returns an operation handle. Nothing in
//! the pipeline proceeds until the handle reaches `DONE`, so step N's remote
//! effects are durably applied before step N+1 issues any call.
//!
//! Polling has no timeout; it ends when the control plane reports `DONE`.

use crate::compute::{ComputeApi, Location, Operation};
use crate::error::{RescueError, Result};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Default delay between two fetches of the same operation
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Blocks on operation handles until they are terminal.
#[derive(Debug, Clone, Copy)]
pub struct OperationWaiter {
    interval: Duration,
}

impl Default for OperationWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl OperationWaiter {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Re-fetch `operation` until its status is `DONE`.
    ///
    /// # Errors
    ///
    /// - `OperationFailed` if the terminal operation carries an error payload
    /// - any error from fetching the operation, unchanged
    pub fn wait(
        &self,
        api: &dyn ComputeApi,
        loc: &Location,
        mut operation: Operation,
    ) -> Result<Operation> {
        let mut polls = 0u64;

        while !operation.is_done() {
            thread::sleep(self.interval);
            operation = api.get_zone_operation(loc, &operation.name)?;
            polls += 1;
            debug!(
                "operation {} is {} after {} poll(s)",
                operation.name, operation.status, polls
            );
        }

        if let Some(error) = &operation.error {
            return Err(RescueError::OperationFailed {
                operation: operation.name.clone(),
                details: error.to_string(),
            });
        }

        info!("operation {} done", operation.name);
        Ok(operation)
    }
}
