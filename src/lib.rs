//! gce-rescue Library
//!
//! Puts a Compute Engine VM into rescue mode (booting a temporary recovery
//! disk with the original boot disk attached as secondary) and restores it.

pub mod auth;
pub mod background;
pub mod cli;
pub mod compute;
pub mod config;
pub mod disks;
pub mod error;
pub mod instance;
pub mod messages;
pub mod metadata;
pub mod operation;
pub mod pipeline;
pub mod progress;

// Re-export main types for convenience
pub use background::BackgroundTask;
pub use compute::{ComputeApi, ComputeClient, Location, SimulatedCompute};
pub use config::RescueConfig;
pub use disks::{guess_recovery_image, DiskSwapper};
pub use error::{RescueError, Result};
pub use instance::{DiskBinding, InstanceState, RescueMode};
pub use metadata::MetadataManager;
pub use operation::OperationWaiter;
pub use pipeline::{Step, TaskPipeline, Transition};
pub use progress::{ProgressHandle, ProgressTracker};
