//! Helm chart reconciliation against the k0s cluster config.
//!
//! The desired chart set is generated from the release metadata, the vendor
//! charts on the Installation and the values overrides. It is compared with
//! both the applied set (cluster config) and what the k0s helm controller has
//! actually installed (Chart objects).

use std::collections::BTreeMap;

use serde_yaml::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_common::crd::installation::Installation;
use keel_common::crd::k0s::{Chart, ChartSpec, HelmExtensions};
use keel_common::wait::{wait_until, Backoff, PollError};
use keel_common::{ClusterClient, Error, ReleaseMetadata, Result, RuntimeConfig};

/// Release name of the operator chart
pub const OPERATOR_CHART_NAME: &str = "embedded-cluster-operator";
/// Order given to vendor charts that don't set one
pub const DEFAULT_VENDOR_CHART_ORDER: i32 = 10;
/// Added to every chart order so generated charts install after k0s' own
pub const ORDER_OFFSET: i32 = 100;

const CHARTS_RESOURCE: &str = "helm charts";

/// Installed chart state relative to the applied set
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChartCompletion {
    /// Charts not yet installed at the applied version and values
    pub pending: Vec<String>,
    /// Charts whose last Helm operation failed, with the error text
    pub errors: Vec<String>,
}

/// Generate the chart set the release should be running
pub fn desired_charts(
    installation: &Installation,
    meta: &ReleaseMetadata,
    config: &RuntimeConfig,
) -> Result<HelmExtensions> {
    let spec = installation.spec.config.clone().unwrap_or_default();
    let vendor = spec.extensions.helm.unwrap_or_default();

    let mut out = HelmExtensions {
        concurrency_level: 1,
        ..Default::default()
    };
    if vendor.concurrency_level > 0 {
        out.concurrency_level = vendor.concurrency_level.min(1);
    }

    for mut chart in vendor.charts {
        if chart.order == 0 {
            chart.order = DEFAULT_VENDOR_CHART_ORDER;
        }
        out.charts.push(chart);
    }
    out.repositories.extend(vendor.repositories);

    out.charts.extend(meta.configs.charts.iter().cloned());
    out.repositories.extend(meta.configs.repositories.iter().cloned());

    for chart in &mut out.charts {
        chart.order += ORDER_OFFSET;
    }

    if installation.spec.air_gap {
        out.repositories.clear();
        let dir = config.charts_dir();
        for chart in &mut out.charts {
            chart.chartname = dir
                .join(format!("{}-{}.tgz", chart.name, chart.version))
                .to_string_lossy()
                .into_owned();
        }
    }

    for patch in &spec.unsupported_overrides.builtin_extensions {
        for chart in out.charts.iter_mut().filter(|c| c.name == patch.name) {
            chart.values = merge_values(&chart.values, &patch.values)?;
        }
    }

    Ok(out)
}

/// Deep-merge YAML `patch` over `base`; mappings merge key by key, every
/// other value is replaced.
pub fn merge_values(base: &str, patch: &str) -> Result<String> {
    if patch.trim().is_empty() {
        return Ok(base.to_string());
    }
    let mut merged = parse_values(base)?;
    merge_into(&mut merged, parse_values(patch)?);
    serde_yaml::to_string(&merged)
        .map_err(|e| Error::serialization_for_kind("chart values", e.to_string()))
}

fn parse_values(data: &str) -> Result<Value> {
    if data.trim().is_empty() {
        return Ok(Value::Mapping(Default::default()));
    }
    serde_yaml::from_str(data)
        .map_err(|e| Error::serialization_for_kind("chart values", e.to_string()))
}

fn merge_into(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Mapping(base), Value::Mapping(patch)) => {
            for (k, v) in patch {
                match base.get_mut(&k) {
                    Some(existing) => merge_into(existing, v),
                    None => {
                        base.insert(k, v);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

/// Compare desired against applied; returns whether anything changed and the
/// names of charts added, removed or modified.
pub fn detect_drift(desired: &HelmExtensions, current: &HelmExtensions) -> (bool, Vec<String>) {
    let current_by_name: BTreeMap<&str, &ChartSpec> =
        current.charts.iter().map(|c| (c.name.as_str(), c)).collect();
    let desired_by_name: BTreeMap<&str, &ChartSpec> =
        desired.charts.iter().map(|c| (c.name.as_str(), c)).collect();

    let mut changed: Vec<String> = desired
        .charts
        .iter()
        .filter(|c| current_by_name.get(c.name.as_str()).copied() != Some(*c))
        .map(|c| c.name.clone())
        .collect();
    changed.extend(
        current
            .charts
            .iter()
            .filter(|c| !desired_by_name.contains_key(c.name.as_str()))
            .map(|c| c.name.clone()),
    );

    let drift = !changed.is_empty()
        || desired.repositories != current.repositories
        || desired.concurrency_level != current.concurrency_level;
    (drift, changed)
}

/// Check which applied charts the helm controller has not converged yet
pub fn detect_completion(current: &HelmExtensions, installed: &[Chart]) -> ChartCompletion {
    let by_name: BTreeMap<&str, &Chart> = installed.iter().map(|c| (c.name(), c)).collect();
    let mut completion = ChartCompletion::default();

    for chart in &current.charts {
        let object = Chart::object_name(&chart.name);
        let status = by_name.get(object.as_str()).and_then(|c| c.status.as_ref());

        let Some(status) = status else {
            completion.pending.push(chart.name.clone());
            continue;
        };
        if !status.error.is_empty() {
            completion
                .errors
                .push(format!("{}: {}", chart.name, status.error));
        }
        let converged = status.version.trim_start_matches('v')
            == chart.version.trim_start_matches('v')
            && status.values_hash == chart.hash_values()
            && status.release_name == chart.name;
        if !converged {
            completion.pending.push(chart.name.clone());
        }
    }
    completion
}

/// Bring the applied chart set in line with the release
pub async fn reconcile_charts(
    client: &dyn ClusterClient,
    config: &RuntimeConfig,
    installation: &Installation,
    meta: &ReleaseMetadata,
) -> Result<()> {
    let desired = desired_charts(installation, meta, config)?;
    let mut cluster_config = client
        .get_cluster_config(&config.namespaces.kube_system)
        .await?;
    let current = cluster_config.helm();

    let (drift, changed) = detect_drift(&desired, &current);
    let installed = client.list_charts(&config.namespaces.kube_system).await?;
    let completion = detect_completion(&current, &installed);

    if !completion.errors.is_empty() && !drift {
        warn!(errors = ?completion.errors, "Helm charts have errors");
        return Err(Error::failed(
            CHARTS_RESOURCE,
            "helm charts have errors and there is no update to be applied",
        ));
    }

    if !completion.pending.is_empty() {
        return Err(Error::in_progress(
            CHARTS_RESOURCE,
            format!("pending charts: [{}]", completion.pending.join(", ")),
        ));
    }

    if !drift {
        debug!("helm charts up to date");
        return Ok(());
    }

    info!(charts = ?changed, "Updating helm charts");
    cluster_config.set_helm(desired);
    client.update_cluster_config(&cluster_config).await
}

/// Wait until the operator chart reports the desired version without errors
pub async fn wait_for_operator_chart(
    client: &dyn ClusterClient,
    config: &RuntimeConfig,
    installation: &Installation,
    meta: &ReleaseMetadata,
    cancel: &CancellationToken,
    backoff: &Backoff,
) -> Result<()> {
    let desired = desired_charts(installation, meta, config)?;
    let Some(chart) = desired
        .charts
        .into_iter()
        .find(|c| c.name == OPERATOR_CHART_NAME)
    else {
        debug!("release has no operator chart");
        return Ok(());
    };

    let object = Chart::object_name(&chart.name);
    let values_hash = chart.hash_values();
    let namespace = config.namespaces.kube_system.as_str();

    info!(version = %chart.version, "Waiting for the operator chart");
    wait_until(cancel, backoff, "the embedded cluster operator chart", || {
        let object = object.as_str();
        let values_hash = values_hash.as_str();
        let version = chart.version.as_str();
        async move {
            let installed = client.list_charts(namespace).await.map_err(PollError::from)?;
            let Some(status) = installed
                .iter()
                .find(|c| c.name() == object)
                .and_then(|c| c.status.as_ref())
            else {
                return Ok(false);
            };
            if !status.error.is_empty() {
                return Err(PollError::Transient(Error::in_progress(
                    OPERATOR_CHART_NAME,
                    format!("operator chart has errors: {}", status.error),
                )));
            }
            Ok(status.version.trim_start_matches('v') == version.trim_start_matches('v')
                && status.values_hash == values_hash)
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use keel_common::crd::installation::{
        BuiltInExtension, ConfigSpec, Extensions, InstallationSpec, UnsupportedOverrides,
    };
    use keel_common::crd::k0s::{ChartObjectStatus, ClusterConfig, Repository};
    use keel_common::MockClusterClient;
    use std::time::Duration;

    fn chart(name: &str, version: &str, order: i32) -> ChartSpec {
        ChartSpec {
            name: name.to_string(),
            chartname: format!("repo/{}", name),
            version: version.to_string(),
            values: "replicas: 1\n".to_string(),
            target_ns: name.to_string(),
            order,
            ..Default::default()
        }
    }

    fn metadata() -> ReleaseMetadata {
        ReleaseMetadata {
            configs: HelmExtensions {
                concurrency_level: 1,
                repositories: vec![Repository {
                    name: "repo".to_string(),
                    url: "https://charts.example.com".to_string(),
                    insecure: None,
                }],
                charts: vec![
                    chart("openebs", "4.0.1", 1),
                    chart(OPERATOR_CHART_NAME, "1.4.0", 3),
                ],
            },
            ..Default::default()
        }
    }

    fn installation(
        air_gap: bool,
        vendor: Vec<ChartSpec>,
        overrides: Vec<BuiltInExtension>,
    ) -> Installation {
        Installation {
            metadata: ObjectMeta {
                name: Some("20240501000000".to_string()),
                ..Default::default()
            },
            spec: InstallationSpec {
                air_gap,
                config: Some(ConfigSpec {
                    version: "1.4.0".to_string(),
                    extensions: Extensions {
                        helm: Some(HelmExtensions {
                            concurrency_level: 0,
                            repositories: vec![],
                            charts: vendor,
                        }),
                    },
                    unsupported_overrides: UnsupportedOverrides {
                        builtin_extensions: overrides,
                    },
                }),
                ..Default::default()
            },
            status: None,
        }
    }

    fn installed(spec: &ChartSpec, error: &str) -> Chart {
        Chart {
            metadata: ObjectMeta {
                name: Some(Chart::object_name(&spec.name)),
                ..Default::default()
            },
            status: Some(ChartObjectStatus {
                release_name: spec.name.clone(),
                version: format!("v{}", spec.version),
                values_hash: spec.hash_values(),
                error: error.to_string(),
            }),
            ..Default::default()
        }
    }

    fn cluster_config(helm: HelmExtensions) -> ClusterConfig {
        let mut cfg = ClusterConfig::default();
        cfg.set_helm(helm);
        cfg
    }

    #[test]
    fn test_vendor_charts_first_with_offset_orders() {
        let inst = installation(false, vec![chart("vendor-app", "2.0.0", 0)], vec![]);
        let out = desired_charts(&inst, &metadata(), &RuntimeConfig::default()).unwrap();
        let names: Vec<_> = out.charts.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["vendor-app", "openebs", OPERATOR_CHART_NAME]);
        let orders: Vec<_> = out.charts.iter().map(|c| c.order).collect();
        assert_eq!(orders, vec![110, 101, 103]);
        assert_eq!(out.repositories.len(), 1);
        assert_eq!(out.concurrency_level, 1);
    }

    #[test]
    fn test_airgap_rewrites_chart_references() {
        let inst = installation(true, vec![], vec![]);
        let out = desired_charts(&inst, &metadata(), &RuntimeConfig::default()).unwrap();
        assert!(out.repositories.is_empty());
        assert_eq!(
            out.charts[0].chartname,
            "/var/lib/embedded-cluster/charts/openebs-4.0.1.tgz"
        );
    }

    #[test]
    fn test_overrides_merge_values() {
        let overrides = vec![BuiltInExtension {
            name: "openebs".to_string(),
            values: "replicas: 3\nextra:\n  enabled: true\n".to_string(),
        }];
        let inst = installation(false, vec![], overrides);
        let out = desired_charts(&inst, &metadata(), &RuntimeConfig::default()).unwrap();

        let values: Value = serde_yaml::from_str(&out.charts[0].values).unwrap();
        assert_eq!(values["replicas"], Value::from(3));
        assert_eq!(values["extra"]["enabled"], Value::from(true));
        assert_eq!(out.charts[1].values, "replicas: 1\n");
    }

    #[test]
    fn test_nested_merge_keeps_sibling_keys() {
        let merged = merge_values("a:\n  b: 1\n  c: 2\n", "a:\n  c: 3\n").unwrap();
        let v: Value = serde_yaml::from_str(&merged).unwrap();
        assert_eq!(v["a"]["b"], Value::from(1));
        assert_eq!(v["a"]["c"], Value::from(3));
    }

    #[test]
    fn test_drift_lists_changed_and_removed_charts() {
        let current = HelmExtensions {
            concurrency_level: 1,
            repositories: vec![],
            charts: vec![chart("a", "1.0.0", 101), chart("gone", "1.0.0", 102)],
        };
        let mut desired = current.clone();
        desired.charts = vec![chart("a", "1.1.0", 101)];

        let (drift, changed) = detect_drift(&desired, &current);
        assert!(drift);
        assert_eq!(changed, vec!["a", "gone"]);

        let (drift, changed) = detect_drift(&current, &current);
        assert!(!drift);
        assert!(changed.is_empty());
    }

    #[test]
    fn test_completion_pending_and_errors() {
        let a = chart("a", "1.0.0", 101);
        let b = chart("b", "1.0.0", 102);
        let c = chart("c", "1.0.0", 103);
        let current = HelmExtensions {
            charts: vec![a.clone(), b.clone(), c.clone()],
            ..Default::default()
        };
        let mut stale = installed(&b, "");
        stale.status.as_mut().unwrap().values_hash = "old".to_string();

        let result = detect_completion(&current, &[installed(&a, "boom"), stale]);
        assert_eq!(result.pending, vec!["b", "c"]);
        assert_eq!(result.errors, vec!["a: boom"]);
    }

    #[tokio::test]
    async fn test_errors_without_drift_are_fatal() {
        let inst = installation(false, vec![], vec![]);
        let desired = desired_charts(&inst, &metadata(), &RuntimeConfig::default()).unwrap();
        let failing = installed(&desired.charts[0], "helm install failed");
        let ok = installed(&desired.charts[1], "");

        let mut mock = MockClusterClient::new();
        let applied = desired.clone();
        mock.expect_get_cluster_config()
            .returning(move |_| Ok(cluster_config(applied.clone())));
        mock.expect_list_charts()
            .returning(move |_| Ok(vec![failing.clone(), ok.clone()]));
        mock.expect_update_cluster_config().never();

        let err = reconcile_charts(&mock, &RuntimeConfig::default(), &inst, &metadata())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "helm charts: helm charts have errors and there is no update to be applied"
        );
    }

    #[tokio::test]
    async fn test_pending_charts_are_retryable() {
        let inst = installation(false, vec![], vec![]);
        let desired = desired_charts(&inst, &metadata(), &RuntimeConfig::default()).unwrap();
        let ok = installed(&desired.charts[0], "");

        let mut mock = MockClusterClient::new();
        let applied = desired.clone();
        mock.expect_get_cluster_config()
            .returning(move |_| Ok(cluster_config(applied.clone())));
        mock.expect_list_charts()
            .returning(move |_| Ok(vec![ok.clone()]));
        mock.expect_update_cluster_config().never();

        let err = reconcile_charts(&mock, &RuntimeConfig::default(), &inst, &metadata())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), format!("pending charts: [{}]", OPERATOR_CHART_NAME));
    }

    #[tokio::test]
    async fn test_drift_replaces_applied_charts() {
        let inst = installation(false, vec![], vec![]);
        let old = HelmExtensions {
            concurrency_level: 1,
            repositories: vec![],
            charts: vec![chart("openebs", "3.0.0", 101)],
        };
        let old_installed = installed(&old.charts[0], "");

        let mut mock = MockClusterClient::new();
        mock.expect_get_cluster_config()
            .returning(move |_| Ok(cluster_config(old.clone())));
        mock.expect_list_charts()
            .returning(move |_| Ok(vec![old_installed.clone()]));
        mock.expect_update_cluster_config()
            .withf(|cfg| cfg.helm().charts.len() == 2 && cfg.helm().charts[0].version == "4.0.1")
            .times(1)
            .returning(|_| Ok(()));

        reconcile_charts(&mock, &RuntimeConfig::default(), &inst, &metadata())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_converged_charts_are_a_noop() {
        let inst = installation(false, vec![], vec![]);
        let desired = desired_charts(&inst, &metadata(), &RuntimeConfig::default()).unwrap();
        let all: Vec<Chart> = desired.charts.iter().map(|c| installed(c, "")).collect();

        let mut mock = MockClusterClient::new();
        let applied = desired.clone();
        mock.expect_get_cluster_config()
            .returning(move |_| Ok(cluster_config(applied.clone())));
        mock.expect_list_charts().returning(move |_| Ok(all.clone()));
        mock.expect_update_cluster_config().never();

        reconcile_charts(&mock, &RuntimeConfig::default(), &inst, &metadata())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_operator_chart_wait_polls_until_version_matches() {
        let inst = installation(false, vec![], vec![]);
        let desired = desired_charts(&inst, &metadata(), &RuntimeConfig::default()).unwrap();
        let operator = desired.charts[1].clone();
        let mut old = installed(&operator, "");
        old.status.as_mut().unwrap().version = "1.3.0".to_string();
        let new = installed(&operator, "");

        let mut mock = MockClusterClient::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_list_charts()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(vec![old.clone()]));
        mock.expect_list_charts()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(vec![new.clone()]));

        wait_for_operator_chart(
            &mock,
            &RuntimeConfig::default(),
            &inst,
            &metadata(),
            &CancellationToken::new(),
            &Backoff::fixed(5, Duration::from_millis(1)),
        )
        .await
        .unwrap();
    }
}
