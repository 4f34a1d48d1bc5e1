//! Error handling module for gce-rescue
//!
//! Provides the error taxonomy of the rescue pipeline using thiserror.
//! Every remote failure is surfaced once; nothing here is retried.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the rescue pipeline
#[derive(Error, Debug)]
pub enum RescueError {
    /// A long-running operation reached DONE with an error payload
    #[error("Operation {operation} failed: {details}")]
    OperationFailed { operation: String, details: String },

    /// The rescue disk already exists and is attached somewhere
    #[error("Disk {disk} is currently in use: {users:?}")]
    DiskBusy { disk: String, users: Vec<String> },

    /// Setting the `rescue=<ts>` label on the original disk failed
    #[error("Unable to set label to disk {disk}: {details}")]
    LabelSetFailed { disk: String, details: String },

    /// The guest never wrote the completion sentinel to its serial console
    #[error("Guest OS boot timeout: {sentinel} not seen after {}s", waited.as_secs())]
    GuestBootTimeout { sentinel: String, waited: Duration },

    /// Resource does not exist (HTTP 404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// A disk lookup by filter did not resolve to exactly one disk
    #[error("Disk filter '{filter}' matched {matches} disks, expected exactly one")]
    DiskLookup { filter: String, matches: usize },

    /// The instance resource is not in a shape we can work with
    #[error("Invalid instance: {0}")]
    InvalidInstance(String),

    /// Any other non-success answer from the control plane
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// Transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO errors (startup script template, log file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (loading, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential or project discovery errors
    #[error("Authentication error: {0}")]
    Auth(String),

    /// A background worker panicked or could not be spawned
    #[error("Background task '{0}' failed")]
    BackgroundTask(String),
}

/// Result type alias for rescue operations
pub type Result<T> = std::result::Result<T, RescueError>;

impl RescueError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid instance error
    pub fn invalid_instance(msg: impl Into<String>) -> Self {
        Self::InvalidInstance(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Returns true for the one condition the pipeline treats as recoverable
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
