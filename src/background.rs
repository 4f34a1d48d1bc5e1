//! background.rs - Runs one slow control-plane job on a dedicated thread.
//!
//! The pipeline uses this for the boot disk snapshot: it is started before the
//! disks are swapped and only joined once the original disk is about to be
//! attached back. The task is a plain value owned by whoever started it.

use crate::error::{RescueError, Result};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// A named worker thread producing a `Result<T>`.
#[derive(Debug)]
pub struct BackgroundTask<T> {
    name: String,
    handle: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> BackgroundTask<T> {
    /// Start `job` on a new thread named `name`.
    pub fn spawn<F>(name: impl Into<String>, job: F) -> Result<Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(job)
            .map_err(|e| {
                error!("Failed to spawn background task {}: {}", name, e);
                RescueError::BackgroundTask(name.clone())
            })?;
        debug!("Background task {} started", name);
        Ok(Self { name, handle })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the job ends and return its result.
    pub fn join(self) -> Result<T> {
        debug!("Joining background task {}", self.name);
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => {
                error!("Background task {} panicked", self.name);
                Err(RescueError::BackgroundTask(self.name))
            }
        }
    }
}
