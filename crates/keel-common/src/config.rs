//! Runtime configuration for one keel invocation.
//!
//! A `RuntimeConfig` is built once at start-up and passed by reference to
//! every component that needs paths, ports or namespaces. It is also the
//! shape persisted in the Installation record, so a resumed restore can read
//! back what the previous invocation decided.
//!
//! Resolution order (later wins):
//! 1. Built-in defaults
//! 2. Optional YAML file (`--config`)
//! 3. Command line flags
//! 4. Values restored from a backup or read from the latest Installation

use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default data directory on every node
pub const DEFAULT_DATA_DIR: &str = "/var/lib/embedded-cluster";
/// Default admin console node port
pub const DEFAULT_ADMIN_CONSOLE_PORT: u16 = 30000;
/// Default local artifact mirror port
pub const DEFAULT_LOCAL_ARTIFACT_MIRROR_PORT: u16 = 50000;

/// Namespaces the lifecycle core reads and writes
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Namespaces {
    /// Namespace holding the restore state record and the operator
    pub embedded_cluster: String,
    /// Velero namespace (backups, restores, resource modifiers)
    pub velero: String,
    /// Admin console namespace
    pub kotsadm: String,
    /// Object store namespace (HA airgap only)
    pub seaweedfs: String,
    /// Registry namespace (airgap only)
    pub registry: String,
    /// Namespace of the installed chart objects and the cluster config
    pub kube_system: String,
}

impl Default for Namespaces {
    fn default() -> Self {
        Self {
            embedded_cluster: "embedded-cluster".to_string(),
            velero: "velero".to_string(),
            kotsadm: "kotsadm".to_string(),
            seaweedfs: "seaweedfs".to_string(),
            registry: "registry".to_string(),
            kube_system: "kube-system".to_string(),
        }
    }
}

/// Pod and service networks configured for the cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkSpec {
    /// Pod CIDR, empty when not yet configured
    pub pod_cidr: String,
    /// Service CIDR, empty when not yet configured
    pub service_cidr: String,
    /// Host interface used to reach the admin console
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_interface: Option<String>,
}

/// Configuration value shared by every step of an invocation
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Data directory on every node
    pub data_dir: PathBuf,
    /// Admin console node port
    pub admin_console_port: u16,
    /// Local artifact mirror port
    pub local_artifact_mirror_port: u16,
    /// Whether the cluster runs without external network access
    pub airgap: bool,
    /// Cluster networks
    pub network: NetworkSpec,
    /// Namespaces used by the lifecycle core
    pub namespaces: Namespaces,
    /// Explicit kubeconfig; defaults to the admin kubeconfig under the data dir
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            admin_console_port: DEFAULT_ADMIN_CONSOLE_PORT,
            local_artifact_mirror_port: DEFAULT_LOCAL_ARTIFACT_MIRROR_PORT,
            airgap: false,
            network: NetworkSpec::default(),
            namespaces: Namespaces::default(),
            kubeconfig: None,
        }
    }
}

impl RuntimeConfig {
    /// Load from a YAML file, returning defaults for any missing field.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::validation_for_field(
                "--config",
                format!("failed to read {}: {}", path.display(), e),
            )
        })?;
        Self::from_yaml(&data)
    }

    /// Parse from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        serde_yaml::from_str(data)
            .map_err(|e| Error::serialization_for_kind("RuntimeConfig", e.to_string()))
    }

    /// Kubeconfig used to reach the local cluster
    pub fn kubeconfig_path(&self) -> PathBuf {
        self.kubeconfig
            .clone()
            .unwrap_or_else(|| self.data_dir.join("k0s").join("pki").join("admin.conf"))
    }

    /// Directory holding airgap chart archives
    pub fn charts_dir(&self) -> PathBuf {
        self.data_dir.join("charts")
    }

    /// Data directory rendered as a string for annotation comparisons
    pub fn data_dir_str(&self) -> String {
        self.data_dir.to_string_lossy().into_owned()
    }

    /// URL the local artifact mirror serves binaries on
    pub fn local_artifact_mirror_url(&self, path: &str) -> String {
        format!(
            "http://127.0.0.1:{}/{}",
            self.local_artifact_mirror_port,
            path.trim_start_matches('/')
        )
    }
}
