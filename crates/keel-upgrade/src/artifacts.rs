//! Airgap artifact distribution.
//!
//! Airgap nodes cannot pull anything, so before the substrate and charts move
//! every node gets a Job that copies the new artifacts from the registry into
//! the data directory. Once all of them succeed, an autopilot plan loads the
//! placed image bundle into the container runtime.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobCondition, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, LocalObjectReference, PodSpec, PodTemplateSpec, Secret,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_common::crd::autopilot::{
    Plan, PlanCommand, PlanCommandAirgapUpdate, PlanCommandTarget, PlanPhase, PlanResourceUrl,
    PlanSpec, PLATFORM_LINUX_AMD64,
};
use keel_common::crd::installation::Installation;
use keel_common::wait::{wait_until, wait_until_all, Backoff, PollError, ProgressSink};
use keel_common::{ClusterClient, Error, Result, RuntimeConfig};

/// Secret holding the registry pull credentials
pub const REGISTRY_CREDS_SECRET: &str = "registry-creds";
/// Label tying an artifact job to the installation it copies for
pub const INSTALLATION_LABEL: &str = "embedded-cluster.replicated.com/installation";
/// Path the local artifact mirror serves the image bundle on
pub const IMAGE_BUNDLE_PATH: &str = "images/images-amd64.tar";

const DATA_VOLUME: &str = "host-data";
const JOB_CONDITION_COMPLETE: &str = "Complete";
const JOB_CONDITION_FAILED: &str = "Failed";

/// Name of the artifact copy job for a node
pub fn job_name(node: &str) -> String {
    format!("copy-artifacts-{}", node)
}

/// Copy the registry pull secret from the console namespace so the artifact
/// jobs can use it
pub async fn ensure_registry_secret(
    client: &dyn ClusterClient,
    config: &RuntimeConfig,
) -> Result<()> {
    let source = &config.namespaces.kotsadm;
    let existing = client
        .get_secret(source, REGISTRY_CREDS_SECRET)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: "Secret".to_string(),
            name: format!("{}/{}", source, REGISTRY_CREDS_SECRET),
        })?;

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(REGISTRY_CREDS_SECRET.to_string()),
            namespace: Some(config.namespaces.embedded_cluster.clone()),
            ..Default::default()
        },
        type_: existing.type_,
        data: existing.data,
        ..Default::default()
    };
    client.apply_secret(&secret).await?;
    debug!(namespace = %config.namespaces.embedded_cluster, "registry secret in place");
    Ok(())
}

/// Build the artifact copy job pinned to one node
pub fn build_copy_job(
    installation: &Installation,
    config: &RuntimeConfig,
    node: &str,
    image: &str,
) -> Job {
    let data_dir = config.data_dir_str();
    let labels = BTreeMap::from([
        (
            "app.kubernetes.io/managed-by".to_string(),
            "keel".to_string(),
        ),
        (INSTALLATION_LABEL.to_string(), installation.name().to_string()),
    ]);

    let container = Container {
        name: "embedded-cluster-updater".to_string(),
        image: Some(image.to_string()),
        command: Some(vec![
            "/usr/local/bin/local-artifact-mirror".to_string(),
            "pull".to_string(),
            "binaries".to_string(),
            format!("--data-dir={}", data_dir),
            installation.name().to_string(),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: data_dir.clone(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(job_name(node)),
            namespace: Some(config.namespaces.embedded_cluster.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(2),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    node_name: Some(node.to_string()),
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: DATA_VOLUME.to_string(),
                        host_path: Some(HostPathVolumeSource {
                            path: data_dir,
                            type_: Some("Directory".to_string()),
                        }),
                        ..Default::default()
                    }]),
                    image_pull_secrets: Some(vec![LocalObjectReference {
                        name: REGISTRY_CREDS_SECRET.to_string(),
                    }]),
                    restart_policy: Some("OnFailure".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn job_installation(job: &Job) -> Option<&str> {
    job.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(INSTALLATION_LABEL))
        .map(String::as_str)
}

fn job_condition<'a>(job: &'a Job, condition: &str) -> Option<&'a JobCondition> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == condition && c.status == "True"))
}

/// Create one copy job per node, replacing jobs left by another installation
pub async fn ensure_artifact_jobs(
    client: &dyn ClusterClient,
    config: &RuntimeConfig,
    installation: &Installation,
    nodes: &[String],
    image: &str,
) -> Result<()> {
    let namespace = &config.namespaces.embedded_cluster;
    for node in nodes {
        let name = job_name(node);
        if let Some(existing) = client.get_job(namespace, &name).await? {
            if job_installation(&existing) == Some(installation.name()) {
                continue;
            }
            info!(job = %name, "Replacing artifact job from a previous installation");
            match client.delete_job(namespace, &name).await {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
        }

        let job = build_copy_job(installation, config, node, image);
        match client.create_job(&job).await {
            Ok(()) => info!(job = %name, node = %node, "Created artifact job"),
            Err(e) if e.is_already_exists() => debug!(job = %name, "artifact job already exists"),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Wait until every node's copy job succeeded, failing on the first job that
/// reports failure
pub async fn wait_for_artifact_jobs(
    client: &dyn ClusterClient,
    config: &RuntimeConfig,
    nodes: &[String],
    cancel: &CancellationToken,
    backoff: &Backoff,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let namespace = config.namespaces.embedded_cluster.as_str();
    wait_until_all(
        cancel,
        backoff,
        "Copying artifacts to nodes",
        nodes,
        progress,
        |node| async move {
            let name = job_name(&node);
            let job = client
                .get_job(namespace, &name)
                .await?
                .ok_or_else(|| {
                    PollError::Fatal(Error::failed(
                        "artifact jobs",
                        format!("job for node {} not found", node),
                    ))
                })?;

            if let Some(failed) = job_condition(&job, JOB_CONDITION_FAILED) {
                return Err(PollError::Fatal(Error::failed(
                    "artifact jobs",
                    format!(
                        "job for node {} failed: {} - {}",
                        node,
                        failed.reason.as_deref().unwrap_or_default(),
                        failed.message.as_deref().unwrap_or_default()
                    ),
                )));
            }
            Ok(job_condition(&job, JOB_CONDITION_COMPLETE).is_some()
                || job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0) > 0)
        },
    )
    .await
}

/// Plan that loads the placed image bundle on every node
pub fn airgap_plan(installation: &Installation, config: &RuntimeConfig) -> Plan {
    let command = PlanCommand {
        k0supdate: None,
        airgapupdate: Some(PlanCommandAirgapUpdate {
            version: installation.version().to_string(),
            platforms: BTreeMap::from([(
                PLATFORM_LINUX_AMD64.to_string(),
                PlanResourceUrl {
                    url: config.local_artifact_mirror_url(IMAGE_BUNDLE_PATH),
                    sha256: None,
                },
            )]),
            workers: PlanCommandTarget::all(),
        }),
    };
    Plan::new(
        installation.name(),
        PlanSpec {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: "now".to_string(),
            commands: vec![command],
        },
    )
}

/// Create the image load plan, replacing any plan owned by another
/// installation
pub async fn ensure_airgap_plan(
    client: &dyn ClusterClient,
    config: &RuntimeConfig,
    installation: &Installation,
) -> Result<()> {
    if let Some(existing) = client.get_plan().await? {
        if existing.is_owned_by(installation.name()) {
            debug!(state = %existing.state(), "airgap plan already exists");
            return Ok(());
        }
        warn!(owner = ?existing.installation(), "Deleting autopilot plan from a different installation");
        match client.delete_plan().await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
    }

    let plan = airgap_plan(installation, config);
    info!(id = %plan.spec.id, "Creating airgap image load plan");
    match client.create_plan(&plan).await {
        Err(e) if !e.is_already_exists() => Err(e),
        _ => Ok(()),
    }
}

/// Wait for the image load plan to finish
pub async fn wait_for_airgap_plan(
    client: &dyn ClusterClient,
    installation: &Installation,
    cancel: &CancellationToken,
    backoff: &Backoff,
) -> Result<()> {
    wait_until(cancel, backoff, "the airgap image load plan", || async {
        let plan = client
            .get_plan()
            .await?
            .ok_or_else(|| {
                PollError::Transient(Error::in_progress("plan autopilot", "plan not found"))
            })?;
        if !plan.is_owned_by(installation.name()) {
            return Err(PollError::Fatal(Error::failed(
                "plan autopilot",
                "autopilot plan for different installation",
            )));
        }
        match plan.phase() {
            PlanPhase::Succeeded => Ok(true),
            PlanPhase::Failed => Err(PollError::Fatal(Error::failed(
                "plan autopilot",
                format!("autopilot plan failed: {}", plan.state()),
            ))),
            _ => Ok(false),
        }
    })
    .await
}

/// Place the release's artifacts on every node and load its images
pub async fn distribute_artifacts(
    client: &dyn ClusterClient,
    config: &RuntimeConfig,
    installation: &Installation,
    image: &str,
    cancel: &CancellationToken,
    backoff: &Backoff,
    progress: &dyn ProgressSink,
) -> Result<()> {
    ensure_registry_secret(client, config).await?;

    let nodes: Vec<String> = client
        .list_nodes()
        .await?
        .into_iter()
        .filter_map(|n| n.metadata.name)
        .collect();
    ensure_artifact_jobs(client, config, installation, &nodes, image).await?;
    wait_for_artifact_jobs(client, config, &nodes, cancel, backoff, progress).await?;
    info!(nodes = nodes.len(), "Artifacts copied to every node");

    ensure_airgap_plan(client, config, installation).await?;
    wait_for_airgap_plan(client, installation, cancel, backoff).await?;
    info!("Airgap images loaded");
    Ok(())
}
