//! Backup compatibility checks.
//!
//! A backup can only be restored by the binary that matches it: same embedded
//! cluster version, same application, same airgap mode, and the same network
//! and data directory when those are already fixed on this host. Each check
//! returns the first failing reason verbatim so it can be shown to an operator.

use ipnet::IpNet;

use keel_common::config::NetworkSpec;
use keel_common::crd::velero::{Backup, BackupPhase};
use keel_common::{Error, ReleaseInfo};

use crate::backup::{BackupFacts, InstanceBackupType, ReplicatedBackup};

/// What a candidate backup is checked against
#[derive(Clone, Copy, Debug)]
pub struct RestoreTarget<'a> {
    /// Release of the running binary
    pub release: &'a ReleaseInfo,
    /// Whether the restore runs airgapped
    pub airgap: bool,
    /// Network configured on this host; empty CIDRs are not compared
    pub network: &'a NetworkSpec,
    /// Configured data directory
    pub data_dir: &'a str,
}

impl<'a> RestoreTarget<'a> {
    /// Check a replicated backup; `Err` carries the operator-facing reason
    pub fn check_replicated(&self, backup: &ReplicatedBackup) -> Result<(), String> {
        if backup.expected_count() != backup.len() {
            return Err(format!(
                "has a different number of backups ({}) than the expected number ({})",
                backup.len(),
                backup.expected_count()
            ));
        }

        let improved_dr = self.release.improved_dr();
        let app_backup = backup
            .app_backup()
            .ok_or_else(|| "missing app backup".to_string())?;
        match InstanceBackupType::of(app_backup) {
            InstanceBackupType::App if !improved_dr => {
                return Err("app backup found but improved dr is not enabled".to_string())
            }
            InstanceBackupType::Legacy if improved_dr => {
                return Err("legacy backup found but improved dr is enabled".to_string())
            }
            _ => {}
        }

        backup
            .backups()
            .iter()
            .try_for_each(|b| self.check_backup(b))
    }

    /// Check a single Velero backup; `Err` carries the operator-facing reason
    pub fn check_backup(&self, backup: &Backup) -> Result<(), String> {
        let facts = BackupFacts::from_backup(backup);

        if !facts.is_embedded_cluster {
            return Err("is not an embedded cluster backup".to_string());
        }

        let current = self.release.trimmed_version();
        if facts.version != current {
            return Err(format!(
                "has a different embedded cluster version ({:?}) than the current version ({:?})",
                facts.version, current
            ));
        }

        if backup.phase() != BackupPhase::Completed {
            return Err(format!("has a status of {:?}", backup.phase().to_string()));
        }

        self.check_application(&facts)?;
        self.check_airgap(&facts)?;
        self.check_network(&facts)?;

        if let Some(dir) = &facts.data_dir {
            if dir != self.data_dir {
                return Err(format!(
                    "has a different data directory than the current cluster. Please rerun with '--data-dir {}'.",
                    dir
                ));
            }
        }

        Ok(())
    }

    fn check_application(&self, facts: &BackupFacts) -> Result<(), String> {
        let apps = match facts.parse_app_versions() {
            None => return Err("is missing the kots.io/apps-versions annotation".to_string()),
            Some(Err(_)) => {
                return Err("unable to json parse kots.io/apps-versions annotation".to_string())
            }
            Some(Ok(apps)) => apps,
        };

        match apps.len() {
            0 => return Err("has no applications".to_string()),
            1 => {}
            _ => return Err("has more than one application".to_string()),
        }

        let slug = &self.release.app_slug;
        let Some(label) = apps.get(slug) else {
            return Err(format!("does not contain the {:?} application", slug));
        };
        if label != &self.release.version_label {
            return Err(format!(
                "has a different app version ({:?}) than the current version ({:?})",
                label, self.release.version_label
            ));
        }
        Ok(())
    }

    fn check_airgap(&self, facts: &BackupFacts) -> Result<(), String> {
        let Some(value) = facts.airgap.as_deref() else {
            return Err("is missing the kots.io/is-airgap annotation".to_string());
        };
        match (self.airgap, value) {
            (true, "true") | (false, "false") => Ok(()),
            (true, _) => {
                Err("is not an airgap backup, but the restore is configured to be airgap".to_string())
            }
            (false, _) => {
                Err("is an airgap backup, but the restore is configured to be online".to_string())
            }
        }
    }

    fn check_network(&self, facts: &BackupFacts) -> Result<(), String> {
        let Some(pod_cidr) = facts.pod_cidr.as_deref() else {
            return Ok(());
        };
        let service_cidr = facts.service_cidr.as_str();

        if self.network.pod_cidr.is_empty() && self.network.service_cidr.is_empty() {
            return Ok(());
        }
        if pod_cidr == self.network.pod_cidr && service_cidr == self.network.service_cidr {
            return Ok(());
        }

        let flags = match adjacent_supernet(pod_cidr, service_cidr) {
            Some(supernet) => format!("--cidr {}", supernet),
            None => format!("--pod-cidr {} --service-cidr {}", pod_cidr, service_cidr),
        };
        Err(format!(
            "has a different network configuration than the current cluster. Please rerun with '{}'.",
            flags
        ))
    }
}

/// The network `--cidr` must be given to rebuild exactly `pod` and
/// `service`: pod is its lower half and service the upper half
pub fn adjacent_supernet(pod: &str, service: &str) -> Option<IpNet> {
    let pod: IpNet = pod.parse().ok()?;
    let service: IpNet = service.parse().ok()?;
    if pod.prefix_len() != service.prefix_len() || pod.trunc() != pod || service.trunc() != service
    {
        return None;
    }
    let supernet = pod.supernet()?;
    let mut halves = supernet.subnets(pod.prefix_len()).ok()?;
    (halves.next() == Some(pod) && halves.next() == Some(service)).then_some(supernet)
}

/// Split candidates into restorable backups, failing with an aggregated
/// per-backup reason list when none pass.
pub fn filter_restorable(
    target: &RestoreTarget<'_>,
    candidates: Vec<ReplicatedBackup>,
) -> Result<Vec<ReplicatedBackup>, Error> {
    let mut valid = Vec::new();
    let mut rejected = Vec::new();

    for backup in candidates {
        match target.check_replicated(&backup) {
            Ok(()) => valid.push(backup),
            Err(reason) => rejected.push(format!("{:?} {}", backup.name(), reason)),
        }
    }

    if valid.is_empty() {
        let header = if rejected.len() == 1 {
            "Found 1 backup, but it is not restorable:".to_string()
        } else {
            format!("Found {} backups, but none are restorable:", rejected.len())
        };
        return Err(Error::NoRestorableBackups {
            summary: format!("{}\n{}", header, rejected.join("\n")),
        });
    }

    Ok(valid)
}
