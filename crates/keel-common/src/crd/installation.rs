//! Installation Custom Resource Definition
//!
//! The Installation is the cluster-scoped record of what should be running.
//! Installations are named by creation timestamp, so the most recent one is
//! the one with the greatest name.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::k0s::HelmExtensions;
use crate::config::RuntimeConfig;

/// Lifecycle state of an Installation
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum InstallationState {
    /// Created ahead of an upgrade; controllers must not act on it yet
    #[default]
    Waiting,
    /// Queued for the reconciling controller
    Enqueued,
    /// Addons being installed
    Installing,
    /// Substrate upgraded or restored, addons pending
    KubernetesInstalled,
    /// Fully converged
    Installed,
    /// Reconciliation failed
    Failed,
    /// Superseded by a newer installation
    Obsolete,
}

impl InstallationState {
    /// States after which the reconciling controller stops acting
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Installed | Self::Failed | Self::Obsolete)
    }
}

impl std::fmt::Display for InstallationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "Waiting"),
            Self::Enqueued => write!(f, "Enqueued"),
            Self::Installing => write!(f, "Installing"),
            Self::KubernetesInstalled => write!(f, "KubernetesInstalled"),
            Self::Installed => write!(f, "Installed"),
            Self::Failed => write!(f, "Failed"),
            Self::Obsolete => write!(f, "Obsolete"),
        }
    }
}

/// Status of an Installation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallationStatus {
    /// Current state
    #[serde(default)]
    pub state: InstallationState,

    /// Human-readable reason for the state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Charts not yet converged
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_charts: Vec<String>,
}

/// Per-chart values override
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuiltInExtension {
    /// Chart release name
    pub name: String,
    /// YAML values merged over the chart defaults
    #[serde(default)]
    pub values: String,
}

/// Overrides applied on top of generated charts
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnsupportedOverrides {
    /// Values overrides for built-in charts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub builtin_extensions: Vec<BuiltInExtension>,
}

/// Vendor extensions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Extensions {
    /// Vendor Helm charts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmExtensions>,
}

/// Release configuration carried by an Installation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpec {
    /// Release version
    #[serde(default)]
    pub version: String,
    /// Vendor extensions
    #[serde(default)]
    pub extensions: Extensions,
    /// Vendor overrides
    #[serde(default)]
    pub unsupported_overrides: UnsupportedOverrides,
}

/// Where airgap artifacts can be pulled from
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactsLocation {
    /// Image bundle reference
    pub images: String,
    /// Helm chart bundle reference
    pub helm_charts: String,
    /// Binary reference
    pub embedded_cluster_binary: String,
    /// Release metadata reference
    pub embedded_cluster_metadata: String,
}

/// Specification for an Installation
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "embeddedcluster.replicated.com",
    version = "v1beta1",
    kind = "Installation",
    plural = "installations",
    status = "InstallationStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.config.version"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstallationSpec {
    /// Cluster identity, stable across installations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    /// Whether the cluster runs without external network access
    #[serde(default)]
    pub air_gap: bool,

    /// Whether the cluster runs with three or more controllers
    #[serde(default)]
    pub high_availability: bool,

    /// Name of the installer binary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_name: Option<String>,

    /// Release configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigSpec>,

    /// Runtime paths, ports and networks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_config: Option<RuntimeConfig>,

    /// Airgap artifact locations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactsLocation>,
}

impl Installation {
    /// Object name, empty if unset
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Current state, `Waiting` when no status was recorded
    pub fn state(&self) -> InstallationState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Desired release version, empty if unset
    pub fn version(&self) -> &str {
        self.spec
            .config
            .as_ref()
            .map(|c| c.version.as_str())
            .unwrap_or_default()
    }

    /// Set the status state and reason, keeping pending charts
    pub fn set_state(&mut self, state: InstallationState, reason: impl Into<String>) {
        let status = self.status.get_or_insert_with(InstallationStatus::default);
        status.state = state;
        status.reason = Some(reason.into());
    }
}

/// Most recent installation (greatest name)
pub fn latest(installations: &[Installation]) -> Option<&Installation> {
    installations.iter().max_by(|a, b| a.name().cmp(b.name()))
}
