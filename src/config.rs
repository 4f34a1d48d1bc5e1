//! Configuration for the rescue pipeline.
//!
//! Every field has a default, so the configuration file is optional and may
//! set any subset of keys. CLI flags are applied on top of the loaded file.
//!
//! ```json
//! {
//!   "skip_snapshot": false,
//!   "source_guests": {
//!     "x86_64": ["projects/debian-cloud/global/images/family/debian-11",
//!                "projects/rocky-linux-cloud/global/images/family/rocky-linux-9"]
//!   },
//!   "guest_boot_timeout_secs": 60
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::RescueError;
use crate::operation::OperationWaiter;

/// Startup script shipped with the binary.
///
/// `GOOGLE_DISK_NAME` and `GOOGLE_TS` are substituted at write time.
pub const DEFAULT_STARTUP_SCRIPT: &str = include_str!("startup-script.sh");

/// Ordered pair of recovery image candidates for one architecture.
///
/// The first entry is the default; the second is used when the VM already
/// runs the first one.
pub type RecoveryImages = [String; 2];

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RescueConfig {
    /// Do not snapshot the original boot disk before entering rescue mode
    pub skip_snapshot: bool,
    /// CPU architecture (lower-case, e.g. `x86_64`) → recovery image candidates
    pub source_guests: BTreeMap<String, RecoveryImages>,
    /// Custom startup script template; the embedded one is used when unset
    pub startup_script: Option<PathBuf>,
    /// Disk type of the rescue disk
    pub disk_type: String,
    pub operation_poll_interval_ms: u64,
    /// Upper bound for the guest to signal the end of its startup script
    pub guest_boot_timeout_secs: u64,
    pub guest_boot_poll_interval_secs: u64,
    /// Compute API endpoint override
    pub api_endpoint: Option<String>,
}

impl Default for RescueConfig {
    fn default() -> Self {
        let source_guests = BTreeMap::from([
            (
                "x86_64".to_string(),
                [
                    "projects/debian-cloud/global/images/family/debian-11".to_string(),
                    "projects/rocky-linux-cloud/global/images/family/rocky-linux-9".to_string(),
                ],
            ),
            (
                "arm64".to_string(),
                [
                    "projects/debian-cloud/global/images/family/debian-11-arm64".to_string(),
                    "projects/rocky-linux-cloud/global/images/family/rocky-linux-9-arm64"
                        .to_string(),
                ],
            ),
        ]);

        Self {
            skip_snapshot: false,
            source_guests,
            startup_script: None,
            disk_type: "pd-balanced".to_string(),
            operation_poll_interval_ms: 1000,
            guest_boot_timeout_secs: 60,
            guest_boot_poll_interval_secs: 2,
            api_endpoint: None,
        }
    }
}

impl RescueConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.source_guests.is_empty() {
            anyhow::bail!("source_guests must list at least one architecture");
        }
        for (arch, images) in &self.source_guests {
            if arch != &arch.to_lowercase() {
                anyhow::bail!("source_guests key '{}' must be lower-case", arch);
            }
            if images.iter().any(|image| image.trim().is_empty()) {
                anyhow::bail!("source_guests.{} contains an empty image reference", arch);
            }
        }

        if self.disk_type.trim().is_empty() {
            anyhow::bail!("disk_type must be specified");
        }

        if self.guest_boot_poll_interval_secs == 0 {
            anyhow::bail!("guest_boot_poll_interval_secs must be at least 1");
        }
        if self.guest_boot_poll_interval_secs > self.guest_boot_timeout_secs {
            anyhow::bail!(
                "guest_boot_poll_interval_secs ({}) exceeds guest_boot_timeout_secs ({})",
                self.guest_boot_poll_interval_secs,
                self.guest_boot_timeout_secs
            );
        }

        if let Some(endpoint) = &self.api_endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                anyhow::bail!("api_endpoint must start with http:// or https://");
            }
        }

        Ok(())
    }

    /// Recovery image candidates for an architecture (case-insensitive).
    pub fn recovery_images(&self, arch: &str) -> Option<&RecoveryImages> {
        self.source_guests.get(&arch.to_lowercase())
    }

    /// Startup script template text.
    pub fn startup_script_template(&self) -> std::result::Result<String, RescueError> {
        match &self.startup_script {
            Some(path) => Ok(fs::read_to_string(path)?),
            None => Ok(DEFAULT_STARTUP_SCRIPT.to_string()),
        }
    }

    pub fn operation_waiter(&self) -> OperationWaiter {
        OperationWaiter::new(Duration::from_millis(self.operation_poll_interval_ms))
    }

    pub fn guest_boot_timeout(&self) -> Duration {
        Duration::from_secs(self.guest_boot_timeout_secs)
    }

    pub fn guest_boot_poll_interval(&self) -> Duration {
        Duration::from_secs(self.guest_boot_poll_interval_secs)
    }
}
