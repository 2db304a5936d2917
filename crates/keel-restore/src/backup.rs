//! Replicated backups and the typed facts parsed from their annotations.
//!
//! A disaster-recovery run may produce several Velero backups (infra + app)
//! correlated by the instance backup-name label. [`ReplicatedBackup`] groups
//! them; [`BackupFacts`] turns the string-keyed annotations of one backup into
//! typed fields so validation and component restores never look keys up ad hoc.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use keel_common::crd::Backup;
use keel_common::{
    Error, Result, BACKUP_IS_EC_ANNOTATION, INSTANCE_BACKUP_COUNT_ANNOTATION,
    INSTANCE_BACKUP_NAME_LABEL, INSTANCE_BACKUP_TYPE_ANNOTATION,
};

/// Annotation keys written by the backup producer
pub mod annotations {
    /// Embedded cluster version the backup was taken with
    pub const VERSION: &str = "kots.io/embedded-cluster-version";
    /// JSON map of application slug to version label
    pub const APPS_VERSIONS: &str = "kots.io/apps-versions";
    /// "true" when the source cluster was airgapped
    pub const IS_AIRGAP: &str = "kots.io/is-airgap";
    /// "true" when the source cluster was highly available
    pub const IS_HA: &str = "kots.io/embedded-cluster-is-ha";
    /// Pod network CIDR of the source cluster
    pub const POD_CIDR: &str = "kots.io/embedded-cluster-pod-cidr";
    /// Service network CIDR of the source cluster
    pub const SERVICE_CIDR: &str = "kots.io/embedded-cluster-service-cidr";
    /// Data directory of the source cluster
    pub const DATA_DIR: &str = "kots.io/embedded-cluster-data-dir";
    /// Registry service address ("host:port")
    pub const REGISTRY: &str = "kots.io/embedded-registry";
    /// Object store S3 service address
    pub const OBJECT_STORE_S3_IP: &str = "kots.io/embedded-cluster-seaweedfs-s3-ip";
    /// Local artifact mirror port of the source cluster
    pub const LOCAL_ARTIFACT_MIRROR_PORT: &str =
        "kots.io/embedded-cluster-local-artifact-mirror-port";
}

/// Value of the instance backup-type annotation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceBackupType {
    /// Cluster infrastructure only
    Infra,
    /// Application only (improved disaster recovery)
    App,
    /// Single backup carrying both
    Legacy,
}

impl InstanceBackupType {
    /// Type of a backup; a backup without the annotation is legacy
    pub fn of(backup: &Backup) -> Self {
        match backup.annotation(INSTANCE_BACKUP_TYPE_ANNOTATION) {
            Some("infra") => Self::Infra,
            Some("app") => Self::App,
            _ => Self::Legacy,
        }
    }
}

/// Typed view of one backup's annotations
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackupFacts {
    /// Carries the embedded-cluster marker
    pub is_embedded_cluster: bool,
    /// Version with any leading "v" removed
    pub version: String,
    /// Raw application versions annotation
    pub app_versions: Option<String>,
    /// Raw airgap annotation ("true"/"false"), `None` when absent
    pub airgap: Option<String>,
    /// High-availability flag, `None` when absent
    pub high_availability: Option<bool>,
    /// Pod CIDR, `None` when absent
    pub pod_cidr: Option<String>,
    /// Service CIDR (empty when only the pod CIDR was annotated)
    pub service_cidr: String,
    /// Data directory, `None` when absent or empty
    pub data_dir: Option<String>,
    /// Registry service address, `None` when absent
    pub registry_address: Option<String>,
    /// Object store S3 service address, `None` when absent
    pub object_store_address: Option<String>,
    /// Local artifact mirror port, `None` when absent or empty
    pub local_artifact_mirror_port: Option<String>,
}

impl BackupFacts {
    /// Parse the annotations of `backup`
    pub fn from_backup(backup: &Backup) -> Self {
        let get = |key: &str| backup.annotation(key).map(str::to_string);
        Self {
            is_embedded_cluster: backup.annotation(BACKUP_IS_EC_ANNOTATION) == Some("true"),
            version: backup
                .annotation(annotations::VERSION)
                .unwrap_or_default()
                .trim_start_matches('v')
                .to_string(),
            app_versions: get(annotations::APPS_VERSIONS),
            airgap: get(annotations::IS_AIRGAP),
            high_availability: backup.annotation(annotations::IS_HA).map(|v| v == "true"),
            pod_cidr: get(annotations::POD_CIDR),
            service_cidr: get(annotations::SERVICE_CIDR).unwrap_or_default(),
            data_dir: get(annotations::DATA_DIR).filter(|d| !d.is_empty()),
            registry_address: get(annotations::REGISTRY),
            object_store_address: get(annotations::OBJECT_STORE_S3_IP),
            local_artifact_mirror_port: get(annotations::LOCAL_ARTIFACT_MIRROR_PORT)
                .filter(|p| !p.is_empty()),
        }
    }

    /// Decoded application versions, `None` when unannotated
    pub fn parse_app_versions(
        &self,
    ) -> Option<std::result::Result<BTreeMap<String, String>, serde_json::Error>> {
        self.app_versions.as_deref().map(serde_json::from_str)
    }

    /// Whether the source cluster was airgapped; errors when unannotated
    pub fn is_airgap(&self) -> Result<bool> {
        self.airgap
            .as_deref()
            .map(|v| v == "true")
            .ok_or_else(|| Error::validation("unable to get airgap status from backup"))
    }

    /// Whether the source cluster was HA; errors when unannotated
    pub fn is_high_availability(&self) -> Result<bool> {
        self.high_availability
            .ok_or_else(|| Error::validation("high availability annotation not found in backup"))
    }

    /// Registry service host for resource modifiers, empty when not airgap
    pub fn registry_service_ip(&self) -> Result<String> {
        if !self.is_airgap()? {
            return Ok(String::new());
        }
        let address = self.registry_address.as_deref().ok_or_else(|| {
            Error::validation("embedded registry service IP annotation not found in backup")
        })?;
        Ok(address.split(':').next().unwrap_or_default().to_string())
    }

    /// Object store S3 address for resource modifiers, empty unless airgap HA
    pub fn object_store_service_ip(&self) -> Result<String> {
        if !self.is_airgap()? || !self.is_high_availability()? {
            return Ok(String::new());
        }
        self.object_store_address
            .clone()
            .ok_or_else(|| Error::validation("unable to get seaweedfs s3 service IP from backup"))
    }

    /// Local artifact mirror port recorded in the backup
    pub fn local_artifact_mirror_port(&self) -> Result<Option<u16>> {
        match self.local_artifact_mirror_port.as_deref() {
            None => Ok(None),
            Some(raw) => match raw.parse::<u16>() {
                Ok(0) | Err(_) => Err(Error::validation(format!(
                    "parse local artifact mirror port: invalid port {:?}",
                    raw
                ))),
                Ok(port) => Ok(Some(port)),
            },
        }
    }
}

/// One logical backup made of one or more Velero backups
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplicatedBackup(pub Vec<Backup>);

impl ReplicatedBackup {
    /// Group backups by the instance backup-name label, keeping the order in
    /// which each group was first seen. Unlabelled backups stand alone.
    pub fn group(backups: Vec<Backup>) -> Vec<ReplicatedBackup> {
        let mut groups: Vec<ReplicatedBackup> = Vec::new();
        let mut index: BTreeMap<String, usize> = BTreeMap::new();

        for backup in backups {
            match backup.label(INSTANCE_BACKUP_NAME_LABEL).map(str::to_string) {
                Some(key) => match index.get(&key) {
                    Some(&i) => groups[i].0.push(backup),
                    None => {
                        index.insert(key, groups.len());
                        groups.push(ReplicatedBackup(vec![backup]));
                    }
                },
                None => groups.push(ReplicatedBackup(vec![backup])),
            }
        }
        groups
    }

    /// Logical name: the shared label, or the single backup's name
    pub fn name(&self) -> &str {
        let Some(first) = self.0.first() else {
            return "";
        };
        first
            .label(INSTANCE_BACKUP_NAME_LABEL)
            .unwrap_or_else(|| first.name())
    }

    /// Number of member backups
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there are no member backups
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Member backups
    pub fn backups(&self) -> &[Backup] {
        &self.0
    }

    /// Backup carrying the cluster infrastructure
    pub fn infra_backup(&self) -> Option<&Backup> {
        self.find(|t| matches!(t, InstanceBackupType::Infra | InstanceBackupType::Legacy))
    }

    /// Backup carrying the application
    pub fn app_backup(&self) -> Option<&Backup> {
        self.find(|t| matches!(t, InstanceBackupType::App | InstanceBackupType::Legacy))
    }

    fn find(&self, pred: impl Fn(InstanceBackupType) -> bool) -> Option<&Backup> {
        self.0.iter().find(|b| pred(InstanceBackupType::of(b)))
    }

    /// Number of member backups the producer declared
    pub fn expected_count(&self) -> usize {
        self.annotation(INSTANCE_BACKUP_COUNT_ANNOTATION)
            .and_then(|c| c.parse().ok())
            .unwrap_or(1)
    }

    /// Latest completion time across members
    pub fn completion_timestamp(&self) -> Option<DateTime<Utc>> {
        self.0.iter().filter_map(Backup::completion_timestamp).max()
    }

    /// Annotation value, preferring the infra backup
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.infra_backup()
            .and_then(|b| b.annotation(key))
            .or_else(|| self.0.iter().find_map(|b| b.annotation(key)))
    }

    /// Facts of the infra backup (or first member)
    pub fn facts(&self) -> BackupFacts {
        self.infra_backup()
            .or_else(|| self.0.first())
            .map(BackupFacts::from_backup)
            .unwrap_or_default()
    }

    /// Human-readable completion time for prompts
    pub fn completion_display(&self) -> String {
        self.completion_timestamp()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Pick the most recently completed backup. Ties keep the earliest candidate.
pub fn pick_latest(backups: &[ReplicatedBackup]) -> Option<&ReplicatedBackup> {
    let mut latest: Option<&ReplicatedBackup> = None;
    for b in backups {
        match latest {
            None => latest = Some(b),
            Some(current) if b.completion_timestamp() > current.completion_timestamp() => {
                latest = Some(b)
            }
            Some(_) => {}
        }
    }
    latest
}
