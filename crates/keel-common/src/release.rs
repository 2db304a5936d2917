//! Facts about the release the running binary belongs to.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crd::k0s::HelmExtensions;
use crate::crd::velero::{Backup, Restore};
use crate::{Error, Result};

/// Key of the substrate version in release metadata
pub const KUBERNETES_VERSION_KEY: &str = "Kubernetes";
/// Key of the k0s binary URL in release metadata artifacts
pub const K0S_ARTIFACT_KEY: &str = "k0s";
/// Data key holding the serialized metadata
pub const METADATA_DATA_KEY: &str = "metadata.json";

/// The running binary's release identity
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfo {
    /// Binary version (e.g., "v1.3.0" or "1.3.0+k8s-1.30")
    pub version: String,
    /// Application slug
    pub app_slug: String,
    /// Application version label
    pub version_label: String,
    /// Vendor-declared backup; with `vendor_restore` enables improved DR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_backup: Option<Backup>,
    /// Vendor-declared restore used verbatim for the application
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_restore: Option<Restore>,
}

impl ReleaseInfo {
    /// Load from a YAML file shipped alongside the binary
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::validation_for_field(
                "--release",
                format!("failed to read {}: {}", path.display(), e),
            )
        })?;
        serde_yaml::from_str(&data)
            .map_err(|e| Error::serialization_for_kind("ReleaseInfo", e.to_string()))
    }

    /// Binary version with any leading "v" removed
    pub fn trimmed_version(&self) -> &str {
        self.version.trim_start_matches('v')
    }

    /// Improved disaster recovery is on when the vendor declared both a
    /// backup and a restore
    pub fn improved_dr(&self) -> bool {
        self.vendor_backup.is_some() && self.vendor_restore.is_some()
    }
}

/// Per-version metadata published into the cluster by the operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ReleaseMetadata {
    /// Component versions, keyed by component name
    #[serde(default)]
    pub versions: BTreeMap<String, String>,
    /// Artifact locations, keyed by artifact name
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    /// Checksum of the k0s binary
    #[serde(default, rename = "K0sSHA")]
    pub k0s_sha: String,
    /// Default chart set shipped with the release
    #[serde(default)]
    pub configs: HelmExtensions,
}

impl ReleaseMetadata {
    /// ConfigMap name holding the metadata for a version
    pub fn config_map_name(version: &str) -> String {
        let sanitized: String = version
            .trim_start_matches('v')
            .chars()
            .map(|c| match c {
                '+' | '_' => '-',
                c => c.to_ascii_lowercase(),
            })
            .collect();
        format!("version-metadata-{}", sanitized)
    }

    /// Parse from the JSON stored in the ConfigMap
    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|e| Error::serialization_for_kind("ReleaseMetadata", e.to_string()))
    }

    /// Desired substrate version
    pub fn k0s_version(&self) -> Result<&str> {
        self.versions
            .get(KUBERNETES_VERSION_KEY)
            .map(String::as_str)
            .ok_or_else(|| {
                Error::validation(format!(
                    "release metadata is missing the {} version",
                    KUBERNETES_VERSION_KEY
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trimmed_version() {
        let rel = ReleaseInfo {
            version: "v1.3.0".to_string(),
            ..Default::default()
        };
        assert_eq!(rel.trimmed_version(), "1.3.0");
    }

    #[test]
    fn test_improved_dr_requires_both_declarations() {
        let mut rel = ReleaseInfo::default();
        assert!(!rel.improved_dr());
        rel.vendor_backup = Some(Backup::default());
        assert!(!rel.improved_dr());
        rel.vendor_restore = Some(Restore::default());
        assert!(rel.improved_dr());
    }

    #[test]
    fn test_metadata_config_map_name() {
        assert_eq!(
            ReleaseMetadata::config_map_name("v1.4.0+k8s-1.30"),
            "version-metadata-1.4.0-k8s-1.30"
        );
    }

    #[test]
    fn test_metadata_parsing() {
        let md = ReleaseMetadata::from_json(
            r#"{
                "Versions": {"Kubernetes": "v1.30.4+k0s.0"},
                "Artifacts": {"k0s": "https://example.com/k0s"},
                "K0sSHA": "abc",
                "Configs": {"charts": [{"name": "openebs", "chartname": "openebs/openebs", "version": "4.0.1"}]}
            }"#,
        )
        .unwrap();
        assert_eq!(md.k0s_version().unwrap(), "v1.30.4+k0s.0");
        assert_eq!(md.configs.charts.len(), 1);
        assert_eq!(md.k0s_sha, "abc");

        assert!(ReleaseMetadata::default().k0s_version().is_err());
    }
}
