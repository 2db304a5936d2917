//! Substrate (k0s) version upgrade through the autopilot plan.
//!
//! Each call advances the plan by one observation and returns. A plan that is
//! still running surfaces as a retryable `InProgress` error so the caller's
//! outer loop re-invokes later.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use tracing::{info, warn};

use keel_common::crd::autopilot::{
    Plan, PlanCommand, PlanCommandK0sUpdate, PlanCommandTarget, PlanCommandTargets, PlanPhase,
    PlanResourceUrl, PlanSpec, PLATFORM_LINUX_AMD64,
};
use keel_common::crd::installation::Installation;
use keel_common::kube_utils::node_kubelet_version;
use keel_common::release::K0S_ARTIFACT_KEY;
use keel_common::{ClusterClient, Error, ReleaseMetadata, Result, RuntimeConfig};

/// Path the local artifact mirror serves the upgrade binary on
pub const K0S_UPGRADE_BINARY_PATH: &str = "bin/k0s-upgrade";

const PLAN_RESOURCE: &str = "plan autopilot";

/// Bounds the delete-and-retry loop for stale plans
const MAX_PLAN_PASSES: usize = 2;

fn comparable(version: &str) -> &str {
    let v = version.trim_start_matches('v');
    v.split('+').next().unwrap_or(v)
}

/// True when every node runs the desired kubelet version
pub fn nodes_match_version(nodes: &[Node], desired: &str) -> bool {
    let want = comparable(desired);
    !nodes.is_empty()
        && nodes
            .iter()
            .all(|n| comparable(node_kubelet_version(n)) == want)
}

/// Plan that upgrades every node to the release's k0s version
pub fn k0s_upgrade_plan(
    installation: &Installation,
    config: &RuntimeConfig,
    meta: &ReleaseMetadata,
) -> Result<Plan> {
    let version = meta.k0s_version()?;

    let url = if installation.spec.air_gap {
        config.local_artifact_mirror_url(K0S_UPGRADE_BINARY_PATH)
    } else {
        meta.artifacts.get(K0S_ARTIFACT_KEY).cloned().ok_or_else(|| {
            Error::validation(format!(
                "release metadata has no {} artifact",
                K0S_ARTIFACT_KEY
            ))
        })?
    };
    let sha256 = (!meta.k0s_sha.is_empty()).then(|| meta.k0s_sha.clone());

    let command = PlanCommand {
        k0supdate: Some(PlanCommandK0sUpdate {
            version: version.to_string(),
            force_update: false,
            platforms: BTreeMap::from([(
                PLATFORM_LINUX_AMD64.to_string(),
                PlanResourceUrl { url, sha256 },
            )]),
            targets: PlanCommandTargets {
                controllers: PlanCommandTarget::all(),
                workers: PlanCommandTarget::all(),
            },
        }),
        airgapupdate: None,
    };

    Ok(Plan::new(
        installation.name(),
        PlanSpec {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: "now".to_string(),
            commands: vec![command],
        },
    ))
}

async fn delete_plan_if_present(client: &dyn ClusterClient) -> Result<()> {
    match client.delete_plan().await {
        Err(e) if !e.is_not_found() => Err(e),
        _ => Ok(()),
    }
}

/// Drive the cluster to the release's substrate version
pub async fn upgrade_substrate(
    client: &dyn ClusterClient,
    config: &RuntimeConfig,
    installation: &Installation,
    meta: &ReleaseMetadata,
) -> Result<()> {
    let desired = meta.k0s_version()?;
    if nodes_match_version(&client.list_nodes().await?, desired) {
        info!(version = %desired, "Cluster nodes already match the desired version");
        return Ok(());
    }

    for _ in 0..MAX_PLAN_PASSES {
        let Some(plan) = client.get_plan().await? else {
            let plan = k0s_upgrade_plan(installation, config, meta)?;
            info!(
                installation = %installation.name(),
                version = %desired,
                id = %plan.spec.id,
                "Creating autopilot upgrade plan"
            );
            match client.create_plan(&plan).await {
                Err(e) if !e.is_already_exists() => return Err(e),
                _ => {}
            }
            return Err(Error::in_progress(
                PLAN_RESOURCE,
                format!("an autopilot upgrade is in progress ({})", plan.spec.id),
            ));
        };

        if !plan.is_owned_by(installation.name()) {
            warn!(
                owner = ?plan.installation(),
                installation = %installation.name(),
                "Deleting autopilot plan from a different installation"
            );
            delete_plan_if_present(client).await?;
            continue;
        }

        if !plan.has_ended() {
            return Err(Error::in_progress(
                PLAN_RESOURCE,
                format!("an autopilot upgrade is in progress ({})", plan.spec.id),
            ));
        }

        if plan.phase() == PlanPhase::Failed {
            return Err(Error::failed(
                PLAN_RESOURCE,
                format!("autopilot plan failed: {}", plan.state()),
            ));
        }

        if !plan.is_k0s_upgrade() {
            info!(state = %plan.state(), "Deleting finished autopilot plan that is not an upgrade");
            delete_plan_if_present(client).await?;
            continue;
        }

        if !nodes_match_version(&client.list_nodes().await?, desired) {
            return Err(Error::failed(
                PLAN_RESOURCE,
                "cluster nodes did not match version after upgrade",
            ));
        }

        info!(version = %desired, "Upgrade to {} completed successfully", desired);
        delete_plan_if_present(client).await?;
        return Ok(());
    }

    Err(Error::internal_with_context(
        "upgrade_substrate",
        "autopilot plan kept changing while upgrading",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeStatus, NodeSystemInfo};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use keel_common::crd::autopilot::{state, PlanCommandAirgapUpdate, PlanStatus};
    use keel_common::crd::installation::InstallationSpec;
    use keel_common::MockClusterClient;

    const INSTALLATION: &str = "20240501000000";

    fn node(version: &str) -> Node {
        Node {
            status: Some(NodeStatus {
                node_info: Some(NodeSystemInfo {
                    kubelet_version: version.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn installation(air_gap: bool) -> Installation {
        Installation {
            metadata: ObjectMeta {
                name: Some(INSTALLATION.to_string()),
                ..Default::default()
            },
            spec: InstallationSpec {
                air_gap,
                ..Default::default()
            },
            status: None,
        }
    }

    fn metadata() -> ReleaseMetadata {
        ReleaseMetadata {
            versions: BTreeMap::from([("Kubernetes".to_string(), "v1.30.5+k0s.0".to_string())]),
            artifacts: BTreeMap::from([(
                "k0s".to_string(),
                "https://example.com/k0s-v1.30.5".to_string(),
            )]),
            k0s_sha: "abc123".to_string(),
            ..Default::default()
        }
    }

    fn upgrade_plan(owner: &str, plan_state: &str) -> Plan {
        let mut plan =
            k0s_upgrade_plan(&installation(false), &RuntimeConfig::default(), &metadata())
                .unwrap();
        plan = Plan::new(owner, plan.spec);
        plan.status = Some(PlanStatus {
            state: plan_state.to_string(),
        });
        plan
    }

    #[test]
    fn test_node_version_comparison_ignores_build_suffix() {
        let nodes = vec![node("v1.30.5+k0s"), node("v1.30.5+k0s")];
        assert!(nodes_match_version(&nodes, "v1.30.5+k0s.0"));
        assert!(!nodes_match_version(&[node("v1.29.9+k0s")], "v1.30.5+k0s.0"));
        assert!(!nodes_match_version(&[], "v1.30.5+k0s.0"));
    }

    #[test]
    fn test_plan_uses_release_artifact_online() {
        let plan =
            k0s_upgrade_plan(&installation(false), &RuntimeConfig::default(), &metadata())
                .unwrap();
        let update = plan.spec.commands[0].k0supdate.as_ref().unwrap();
        assert_eq!(update.version, "v1.30.5+k0s.0");
        let url = &update.platforms[PLATFORM_LINUX_AMD64];
        assert_eq!(url.url, "https://example.com/k0s-v1.30.5");
        assert_eq!(url.sha256.as_deref(), Some("abc123"));
        assert!(plan.is_owned_by(INSTALLATION));
        assert_eq!(plan.spec.timestamp, "now");
    }

    #[test]
    fn test_plan_uses_local_mirror_airgap() {
        let plan =
            k0s_upgrade_plan(&installation(true), &RuntimeConfig::default(), &metadata()).unwrap();
        let update = plan.spec.commands[0].k0supdate.as_ref().unwrap();
        assert_eq!(
            update.platforms[PLATFORM_LINUX_AMD64].url,
            "http://127.0.0.1:50000/bin/k0s-upgrade"
        );
    }

    #[tokio::test]
    async fn test_skips_when_nodes_match() {
        let mut mock = MockClusterClient::new();
        mock.expect_list_nodes()
            .returning(|| Ok(vec![node("v1.30.5+k0s")]));
        mock.expect_get_plan().never();

        upgrade_substrate(&mock, &RuntimeConfig::default(), &installation(false), &metadata())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_creates_plan_and_reports_in_progress() {
        let mut mock = MockClusterClient::new();
        mock.expect_list_nodes()
            .returning(|| Ok(vec![node("v1.29.9+k0s")]));
        mock.expect_get_plan().returning(|| Ok(None));
        mock.expect_create_plan()
            .withf(|p| p.is_owned_by(INSTALLATION) && p.is_k0s_upgrade())
            .times(1)
            .returning(|_| Ok(()));

        let err =
            upgrade_substrate(&mock, &RuntimeConfig::default(), &installation(false), &metadata())
                .await
                .unwrap_err();
        assert!(matches!(err, Error::InProgress { .. }));
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with("an autopilot upgrade is in progress"));
    }

    #[tokio::test]
    async fn test_running_plan_is_in_progress() {
        let mut mock = MockClusterClient::new();
        mock.expect_list_nodes()
            .returning(|| Ok(vec![node("v1.29.9+k0s")]));
        mock.expect_get_plan()
            .returning(|| Ok(Some(upgrade_plan(INSTALLATION, state::SCHEDULABLE_WAIT))));
        mock.expect_delete_plan().never();

        let err =
            upgrade_substrate(&mock, &RuntimeConfig::default(), &installation(false), &metadata())
                .await
                .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_foreign_plan_is_replaced() {
        let mut mock = MockClusterClient::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_list_nodes()
            .returning(|| Ok(vec![node("v1.29.9+k0s")]));
        mock.expect_get_plan()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(Some(upgrade_plan("19990101000000", state::SCHEDULABLE))));
        mock.expect_delete_plan()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        mock.expect_get_plan()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(None));
        mock.expect_create_plan()
            .withf(|p| p.is_owned_by(INSTALLATION))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let err =
            upgrade_substrate(&mock, &RuntimeConfig::default(), &installation(false), &metadata())
                .await
                .unwrap_err();
        assert!(matches!(err, Error::InProgress { .. }));
    }

    #[tokio::test]
    async fn test_finished_non_upgrade_plan_is_replaced() {
        let mut airgap = Plan::new(
            INSTALLATION,
            PlanSpec {
                commands: vec![PlanCommand {
                    k0supdate: None,
                    airgapupdate: Some(PlanCommandAirgapUpdate::default()),
                }],
                ..Default::default()
            },
        );
        airgap.status = Some(PlanStatus {
            state: state::COMPLETED.to_string(),
        });

        let mut mock = MockClusterClient::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_list_nodes()
            .returning(|| Ok(vec![node("v1.29.9+k0s")]));
        mock.expect_get_plan()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move || Ok(Some(airgap.clone())));
        mock.expect_delete_plan()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        mock.expect_get_plan()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(None));
        mock.expect_create_plan()
            .withf(|p| p.is_k0s_upgrade())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let err =
            upgrade_substrate(&mock, &RuntimeConfig::default(), &installation(false), &metadata())
                .await
                .unwrap_err();
        assert!(matches!(err, Error::InProgress { .. }));
    }

    #[tokio::test]
    async fn test_failed_plan_is_fatal() {
        let mut mock = MockClusterClient::new();
        mock.expect_list_nodes()
            .returning(|| Ok(vec![node("v1.29.9+k0s")]));
        mock.expect_get_plan()
            .returning(|| Ok(Some(upgrade_plan(INSTALLATION, state::APPLY_FAILED))));

        let err =
            upgrade_substrate(&mock, &RuntimeConfig::default(), &installation(false), &metadata())
                .await
                .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "plan autopilot: autopilot plan failed: ApplyFailed");
    }

    #[tokio::test]
    async fn test_completed_plan_is_verified_then_deleted() {
        let mut mock = MockClusterClient::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_list_nodes()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![node("v1.29.9+k0s")]));
        mock.expect_get_plan()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(Some(upgrade_plan(INSTALLATION, state::COMPLETED))));
        mock.expect_list_nodes()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![node("v1.30.5+k0s"), node("v1.30.5+k0s")]));
        mock.expect_delete_plan()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        upgrade_substrate(&mock, &RuntimeConfig::default(), &installation(false), &metadata())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mismatch_after_success_is_fatal() {
        let mut mock = MockClusterClient::new();
        mock.expect_list_nodes()
            .returning(|| Ok(vec![node("v1.30.5+k0s"), node("v1.29.9+k0s")]));
        mock.expect_get_plan()
            .returning(|| Ok(Some(upgrade_plan(INSTALLATION, state::COMPLETED))));
        mock.expect_delete_plan().never();

        let err =
            upgrade_substrate(&mock, &RuntimeConfig::default(), &installation(false), &metadata())
                .await
                .unwrap_err();
        assert!(matches!(err, Error::Failed { .. }));
        assert!(err.to_string().contains("did not match version after upgrade"));
    }
}
