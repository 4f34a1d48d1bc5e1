use clap::Parser;
use std::path::PathBuf;

/// gce-rescue - Boot a Compute Engine VM from a temporary rescue disk
///
/// Running it against a normal VM puts it in rescue mode; running it again
/// restores the original configuration.
#[derive(Parser, Debug)]
#[command(name = "gce-rescue")]
#[command(about = "Boot a Compute Engine VM in rescue mode and restore it afterwards")]
#[command(version)]
pub struct Cli {
    /// Zone where the instance is created
    #[arg(long)]
    pub zone: String,

    /// Instance name
    #[arg(long)]
    pub name: String,

    /// Project that has the instance (defaults to the gcloud configuration)
    #[arg(long)]
    pub project: Option<String>,

    /// Write debug-level entries to the log file
    #[arg(long)]
    pub debug: bool,

    /// Don't ask for confirmation
    #[arg(long)]
    pub force: bool,

    /// Don't snapshot the boot disk before entering rescue mode
    #[arg(long)]
    pub skip_snapshot: bool,

    /// Show the control-plane calls a real run would issue, without making changes.
    ///
    /// The VM is only read; the pipeline runs against an in-memory copy.
    #[arg(long)]
    pub dry_run: bool,

    /// Path to a JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }

    /// Log file written next to the working directory, one per VM.
    pub fn log_file(&self) -> PathBuf {
        PathBuf::from(format!("{}.log", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_zone_and_name() {
        assert!(Cli::try_parse_from(["gce-rescue"]).is_err());
        assert!(Cli::try_parse_from(["gce-rescue", "--zone", "us-central1-a"]).is_err());
        assert!(Cli::try_parse_from(["gce-rescue", "--name", "web-1"]).is_err());
    }

    #[test]
    fn test_cli_minimal() {
        let cli = Cli::try_parse_from(["gce-rescue", "--zone", "us-central1-a", "--name", "web-1"])
            .expect("parses"); // test: known-good input
        assert_eq!(cli.zone, "us-central1-a");
        assert_eq!(cli.name, "web-1");
        assert!(cli.project.is_none());
        assert!(!cli.debug && !cli.force && !cli.skip_snapshot && !cli.dry_run);
        assert_eq!(cli.log_file(), PathBuf::from("web-1.log"));
    }

    #[test]
    fn test_cli_all_flags() {
        let cli = Cli::try_parse_from([
            "gce-rescue",
            "--zone",
            "europe-central2-a",
            "--name",
            "web-1",
            "--project",
            "my-project",
            "--debug",
            "--force",
            "--skip-snapshot",
            "--dry-run",
            "--config",
            "/etc/gce-rescue.json",
        ])
        .expect("parses");
        assert_eq!(cli.project.as_deref(), Some("my-project"));
        assert!(cli.debug && cli.force && cli.skip_snapshot && cli.dry_run);
        assert_eq!(cli.config.unwrap().to_str().unwrap(), "/etc/gce-rescue.json");
    }

    #[test]
    fn test_cli_rejects_unknown_flag() {
        let result = Cli::try_parse_from([
            "gce-rescue",
            "--zone",
            "z",
            "--name",
            "n",
            "--reboot",
        ]);
        assert!(result.is_err());
    }
}
