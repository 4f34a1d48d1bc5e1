//! User-facing messages: confirmation prompts and post-run tips.

use crate::instance::InstanceState;
use chrono::{DateTime, Local};

/// When the rescue session started, in local time.
pub fn rescue_date(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|utc| {
            utc.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| ts.to_string())
}

pub fn confirm_enter(vm: &InstanceState) -> String {
    format!(
        "This option will boot the instance {} in RESCUE MODE.\n\
         If your instance is running it will be rebooted.\n\
         Do you want to continue [y/N]: ",
        vm.name
    )
}

pub fn confirm_exit(vm: &InstanceState) -> String {
    format!(
        "The instance \"{}\" is currently configured to boot as rescue mode since {}.\n\
         Would you like to restore the original configuration ? [y/N]: ",
        vm.name,
        rescue_date(vm.rescue.ts)
    )
}

/// Only an explicit yes proceeds.
pub fn is_confirmed(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

pub fn tip_connect_ssh(vm: &InstanceState) -> String {
    let (project, zone, name) = (&vm.location.project, &vm.location.zone, &vm.name);
    format!(
        "- Your instance is READY! You can now connect your instance {name} via:\n\
         \x20 1. CLI. (add --tunnel-through-iap if necessary)\n\
         \x20   $ gcloud compute ssh {name} --zone={zone} --project={project} \
         --ssh-flag=\"-o StrictHostKeyChecking=no\"\n\
         \x20 OR\n\
         \x20 2. Google Cloud Console:\n\
         \x20   https://ssh.cloud.google.com/v2/ssh/projects/{project}/zones/{zone}/instances/{name}\
         ?authuser=0&hl=en_US&useAdminProxy=true&troubleshoot4005Enabled=true\
         &troubleshoot255Enabled=true&sshTroubleshootingToolEnabled=true\n\
         \x20 The original boot disk is mounted on /mnt/sysroot.\n"
    )
}

pub fn tip_restore_disk(vm: &InstanceState) -> String {
    format!(
        "- The instance {} was restored! Use the snapshot below if you need to restore \
         the modification made while the instance was in rescue mode.\n\
         \x20Snapshot name: {}\n\
         \x20More information: https://cloud.google.com/compute/docs/disks/restore-snapshot\n",
        vm.name,
        vm.snapshot_name()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{AttachedDisk, Instance, InstanceStatus, Location, Metadata};
    use crate::instance::{DiskBinding, RescueMode};

    fn vm(active: bool) -> InstanceState {
        let location = Location::new("my-project", "europe-central2-a");
        InstanceState {
            name: "web-1".into(),
            status: InstanceStatus::Running,
            rescue: RescueMode {
                active,
                ts: 1666774335,
            },
            disk_binding: DiskBinding {
                device_name: "persistent-disk-0".into(),
                disk_name: "web-1".into(),
            },
            backup_items: vec![],
            fingerprint: None,
            instance: Instance {
                name: "web-1".into(),
                status: InstanceStatus::Running,
                disks: vec![AttachedDisk {
                    device_name: "persistent-disk-0".into(),
                    source: location.disk_path("web-1"),
                    boot: true,
                    licenses: vec![],
                    architecture: None,
                    ..Default::default()
                }],
                metadata: Metadata::default(),
                self_link: None,
                ..Default::default()
            },
            location,
        }
    }

    #[test]
    fn test_ssh_tip() {
        let tip = tip_connect_ssh(&vm(false));
        assert!(tip.contains(
            "$ gcloud compute ssh web-1 --zone=europe-central2-a --project=my-project"
        ));
        assert!(tip.contains(
            "https://ssh.cloud.google.com/v2/ssh/projects/my-project/zones/europe-central2-a/instances/web-1?authuser=0"
        ));
    }

    #[test]
    fn test_restore_tip_names_snapshot() {
        let tip = tip_restore_disk(&vm(true));
        assert!(tip.contains("Snapshot name: web-1-1666774335"));
    }

    #[test]
    fn test_exit_prompt_shows_rescue_date() {
        let prompt = confirm_exit(&vm(true));
        assert!(prompt.contains("\"web-1\""));
        assert!(prompt.contains("2022-10-2"));
    }

    #[test]
    fn test_confirmation_answers() {
        assert!(is_confirmed("y\n"));
        assert!(is_confirmed(" YES "));
        assert!(!is_confirmed(""));
        assert!(!is_confirmed("n"));
        assert!(!is_confirmed("yep"));
    }

    #[test]
    fn test_rescue_date_out_of_range_falls_back() {
        assert_eq!(rescue_date(u64::MAX), u64::MAX.to_string());
    }
}
