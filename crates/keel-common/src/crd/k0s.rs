//! k0s resource types: the cluster config holding the Helm extension set and
//! the per-release Chart objects the k0s helm controller maintains.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::kube_utils::{sha256_hex, HasApiResource};

/// Name of the single k0s ClusterConfig object
pub const CLUSTER_CONFIG_NAME: &str = "k0s";
/// Prefix of installed chart objects
pub const CHART_OBJECT_PREFIX: &str = "k0s-addon-chart-";

/// Helm repository definition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    /// Repository name
    pub name: String,
    /// Repository URL
    pub url: String,
    /// Whether TLS verification is skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,
}

/// One Helm chart in the k0s extension set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    /// Release name
    pub name: String,
    /// Chart reference (repo/name, oci:// URL or local archive path)
    pub chartname: String,
    /// Chart version
    #[serde(default)]
    pub version: String,
    /// Values as YAML text
    #[serde(default)]
    pub values: String,
    /// Target namespace
    #[serde(default, rename = "namespace")]
    pub target_ns: String,
    /// Helm operation timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Install order, lower first
    #[serde(default)]
    pub order: i32,
}

impl ChartSpec {
    /// Hash of the values text, as recorded in the installed chart status
    pub fn hash_values(&self) -> String {
        sha256_hex(&self.values)
    }
}

/// Helm extension set applied by k0s
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HelmExtensions {
    /// How many charts k0s installs in parallel
    #[serde(default)]
    pub concurrency_level: i32,
    /// Chart repositories
    #[serde(default)]
    pub repositories: Vec<Repository>,
    /// Charts to install
    #[serde(default)]
    pub charts: Vec<ChartSpec>,
}

/// Extensions section of the cluster config
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterExtensions {
    /// Helm extension set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmExtensions>,
    /// Other extension kinds, untouched
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Network section of the cluster config
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetwork {
    /// Pod CIDR
    #[serde(default, rename = "podCIDR")]
    pub pod_cidr: String,
    /// Service CIDR
    #[serde(default, rename = "serviceCIDR")]
    pub service_cidr: String,
    /// Other network settings, untouched
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// k0s ClusterConfig spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfigSpec {
    /// Extensions (Helm charts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<ClusterExtensions>,
    /// Network configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<ClusterNetwork>,
    /// Everything else, untouched
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// k0s ClusterConfig resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// API version
    #[serde(default = "ClusterConfig::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "ClusterConfig::default_kind")]
    pub kind: String,
    /// Resource metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Cluster configuration
    #[serde(default)]
    pub spec: ClusterConfigSpec,
}

impl HasApiResource for ClusterConfig {
    const API_VERSION: &'static str = "k0s.k0sproject.io/v1beta1";
    const KIND: &'static str = "ClusterConfig";
}

impl ClusterConfig {
    fn default_api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }
    fn default_kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Parse the on-disk k0s config (YAML)
    pub fn from_yaml(data: &str) -> Result<Self, crate::Error> {
        serde_yaml::from_str(data)
            .map_err(|e| crate::Error::serialization_for_kind(Self::KIND, e.to_string()))
    }

    /// Currently applied Helm extension set, empty if none
    pub fn helm(&self) -> HelmExtensions {
        self.spec
            .extensions
            .as_ref()
            .and_then(|e| e.helm.clone())
            .unwrap_or_default()
    }

    /// Replace the Helm extension set, keeping every other field
    pub fn set_helm(&mut self, helm: HelmExtensions) {
        self.spec
            .extensions
            .get_or_insert_with(ClusterExtensions::default)
            .helm = Some(helm);
    }

    /// Pod and service CIDRs, empty strings when unset
    pub fn cidrs(&self) -> (String, String) {
        self.spec
            .network
            .as_ref()
            .map(|n| (n.pod_cidr.clone(), n.service_cidr.clone()))
            .unwrap_or_default()
    }
}

/// Installed chart spec as maintained by the k0s helm controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartObjectSpec {
    /// Chart reference
    #[serde(default)]
    pub chart_name: String,
    /// Release name
    #[serde(default)]
    pub release_name: String,
    /// Values as YAML text
    #[serde(default)]
    pub values: String,
    /// Chart version
    #[serde(default)]
    pub version: String,
    /// Target namespace
    #[serde(default)]
    pub namespace: String,
}

/// Installed chart status
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartObjectStatus {
    /// Installed release name
    #[serde(default)]
    pub release_name: String,
    /// Installed chart version
    #[serde(default)]
    pub version: String,
    /// Hash of the values last applied
    #[serde(default)]
    pub values_hash: String,
    /// Last Helm error, empty on success
    #[serde(default)]
    pub error: String,
}

/// k0s helm Chart resource (`k0s-addon-chart-<name>` in kube-system)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chart {
    /// API version
    #[serde(default = "Chart::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "Chart::default_kind")]
    pub kind: String,
    /// Resource metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Desired release
    #[serde(default)]
    pub spec: ChartObjectSpec,
    /// Observed release
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ChartObjectStatus>,
}

impl HasApiResource for Chart {
    const API_VERSION: &'static str = "helm.k0sproject.io/v1beta1";
    const KIND: &'static str = "Chart";
}

impl Chart {
    fn default_api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }
    fn default_kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Object name for a release name
    pub fn object_name(release: &str) -> String {
        format!("{}{}", CHART_OBJECT_PREFIX, release)
    }

    /// Object name, empty if unset
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const K0S_YAML: &str = r#"
apiVersion: k0s.k0sproject.io/v1beta1
kind: ClusterConfig
metadata:
  name: k0s
  namespace: kube-system
spec:
  api:
    port: 6443
  network:
    podCIDR: 10.244.0.0/16
    serviceCIDR: 10.96.0.0/12
    provider: calico
  extensions:
    storage:
      type: openebs_local_storage
    helm:
      concurrencyLevel: 1
      charts:
        - name: openebs
          chartname: openebs/openebs
          version: 4.0.1
          namespace: openebs
          order: 101
"#;

    #[test]
    fn test_parse_on_disk_config() {
        let cfg = ClusterConfig::from_yaml(K0S_YAML).unwrap();
        let (pod, svc) = cfg.cidrs();
        assert_eq!(pod, "10.244.0.0/16");
        assert_eq!(svc, "10.96.0.0/12");
        let helm = cfg.helm();
        assert_eq!(helm.charts.len(), 1);
        assert_eq!(helm.charts[0].target_ns, "openebs");
        assert_eq!(helm.charts[0].order, 101);
    }

    #[test]
    fn test_set_helm_preserves_other_fields() {
        let mut cfg = ClusterConfig::from_yaml(K0S_YAML).unwrap();
        cfg.set_helm(HelmExtensions::default());

        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["spec"]["api"]["port"], 6443);
        assert_eq!(json["spec"]["network"]["provider"], "calico");
        assert_eq!(
            json["spec"]["extensions"]["storage"]["type"],
            "openebs_local_storage"
        );
        assert_eq!(json["spec"]["extensions"]["helm"]["charts"], serde_json::json!([]));
    }

    #[test]
    fn test_chart_object_name() {
        assert_eq!(Chart::object_name("openebs"), "k0s-addon-chart-openebs");
    }
}
