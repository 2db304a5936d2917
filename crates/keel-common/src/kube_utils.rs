//! Kubernetes helpers shared by the restore and upgrade crates
//!
//! Typed wrappers for foreign custom resources (Velero, k0s, autopilot) are
//! plain serde structs that implement [`HasApiResource`]; they travel over the
//! wire as `DynamicObject` and are converted at the client boundary.

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Node;
use kube::api::{ApiResource, DynamicObject};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Error;

/// The "Ready" condition type
pub const CONDITION_READY: &str = "Ready";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";
/// Label present on control-plane nodes
pub const LABEL_CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";

/// Trait for types that have a known API group, version, and kind.
///
/// Implement this for foreign CRD types to derive their `ApiResource` from
/// their constants, keeping serialization and API calls consistent.
pub trait HasApiResource {
    /// Full API version (e.g., "velero.io/v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "Restore")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from a known apiVersion and kind.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Split "group/version" into its parts; core types have an empty group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural of a kind, enough for the kinds this crate talks to.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Convert a DynamicObject into a typed foreign resource
pub fn from_dynamic<T>(obj: DynamicObject) -> Result<T, Error>
where
    T: DeserializeOwned + HasApiResource,
{
    let value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))?;
    serde_json::from_value(value).map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))
}

/// Convert a typed foreign resource into a DynamicObject
pub fn to_dynamic<T>(resource: &T) -> Result<DynamicObject, Error>
where
    T: Serialize + HasApiResource,
{
    let value = serde_json::to_value(resource)
        .map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))?;
    serde_json::from_value(value).map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))
}

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for k8s_openapi::api::core::v1::NodeCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Check whether a condition of the given type is "True"
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// True when the node reports Ready=True
pub fn is_node_ready(node: &Node) -> bool {
    let conditions = node.status.as_ref().and_then(|s| s.conditions.as_ref());
    has_condition(conditions.map(|c| c.as_slice()), CONDITION_READY)
}

/// True when the node carries the control-plane role label
pub fn is_control_plane_node(node: &Node) -> bool {
    node.metadata
        .labels
        .as_ref()
        .is_some_and(|l| l.contains_key(LABEL_CONTROL_PLANE))
}

/// Kubelet version reported by the node, empty if unknown
pub fn node_kubelet_version(node: &Node) -> &str {
    node.status
        .as_ref()
        .and_then(|s| s.node_info.as_ref())
        .map(|i| i.kubelet_version.as_str())
        .unwrap_or_default()
}

/// Ready replicas of a deployment match the desired count
pub fn is_deployment_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let status = match deployment.status.as_ref() {
        Some(s) => s,
        None => return false,
    };
    let observed = status.observed_generation.unwrap_or_default();
    let generation = deployment.metadata.generation.unwrap_or_default();
    observed >= generation && status.ready_replicas.unwrap_or_default() == desired
}

/// Ready replicas of a stateful set match the desired count
pub fn is_stateful_set_ready(sts: &StatefulSet) -> bool {
    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let status = match sts.status.as_ref() {
        Some(s) => s,
        None => return false,
    };
    let observed = status.observed_generation.unwrap_or_default();
    let generation = sts.metadata.generation.unwrap_or_default();
    observed >= generation && status.ready_replicas.unwrap_or_default() == desired
}

/// Full lowercase hex SHA-256 of the input.
pub fn sha256_hex(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus, NodeSystemInfo};
    use kube::core::ObjectMeta;

    fn node(name: &str, ready: bool, control_plane: bool) -> Node {
        let mut labels = std::collections::BTreeMap::new();
        if control_plane {
            labels.insert(LABEL_CONTROL_PLANE.to_string(), "true".to_string());
        }
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                node_info: Some(NodeSystemInfo {
                    kubelet_version: "v1.30.4+k0s".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_api_version() {
        assert_eq!(
            parse_api_version("velero.io/v1"),
            ("velero.io".to_string(), "v1".to_string())
        );
        assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
    }

    #[test]
    fn test_pluralize_kind() {
        assert_eq!(pluralize_kind("Restore"), "restores");
        assert_eq!(pluralize_kind("ClusterConfig"), "clusterconfigs");
        assert_eq!(pluralize_kind("Plan"), "plans");
    }

    #[test]
    fn test_node_helpers() {
        let n = node("a", true, true);
        assert!(is_node_ready(&n));
        assert!(is_control_plane_node(&n));
        assert_eq!(node_kubelet_version(&n), "v1.30.4+k0s");

        let w = node("b", false, false);
        assert!(!is_node_ready(&w));
        assert!(!is_control_plane_node(&w));
        assert_eq!(node_kubelet_version(&Node::default()), "");
    }

    #[test]
    fn test_deployment_readiness() {
        let mut d = Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                ready_replicas: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!is_deployment_ready(&d));
        d.status.as_mut().unwrap().ready_replicas = Some(2);
        assert!(is_deployment_ready(&d));
        assert!(!is_deployment_ready(&Deployment::default()));
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
