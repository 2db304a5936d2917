//! Component Restore Driver
//!
//! Restores one disaster-recovery component from a replicated backup by
//! creating a Velero Restore with a deterministic name, then waiting for it
//! and for the component's own workloads. Running it again for the same
//! backup and component finds the existing restore and only waits.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use keel_common::config::Namespaces;
use keel_common::crd::velero::{
    Backup, Restore, RestorePhase, RestoreSpec, TypedLocalObjectReference,
};
use keel_common::kube_utils::{is_deployment_ready, is_stateful_set_ready};
use keel_common::wait::{wait_until, wait_until_all, Backoff, PollError, ProgressSink};
use keel_common::{
    ClusterClient, Error, ReleaseInfo, Result, RuntimeConfig, BACKUP_IS_EC_ANNOTATION,
    INSTANCE_BACKUP_COUNT_ANNOTATION, INSTANCE_BACKUP_NAME_LABEL, INSTANCE_BACKUP_TYPE_ANNOTATION,
};

use crate::backup::{BackupFacts, ReplicatedBackup};

/// ConfigMap holding the Velero resource modifiers
pub const RESOURCE_MODIFIERS_CONFIG_MAP: &str = "restore-resource-modifiers";
/// Data key of the modifiers document
pub const RESOURCE_MODIFIERS_KEY: &str = "resource-modifiers.yaml";

const RESOURCE_MODIFIERS_TEMPLATE: &str = include_str!("../assets/resource-modifiers.yaml");
const REGISTRY_PLACEHOLDER: &str = "__REGISTRY_SERVICE_IP__";
const OBJECT_STORE_PLACEHOLDER: &str = "__SEAWEEDFS_S3_SERVICE_IP__";

/// Components restored independently from a backup
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DrComponent {
    /// Installation record and cluster-level resources
    ClusterState,
    /// Admin console
    Console,
    /// Object store backing the HA registry
    ObjectStore,
    /// Image registry
    Registry,
    /// Embedded cluster operator
    Operator,
    /// Application
    Application,
}

impl DrComponent {
    /// Tag used in restore names and label selectors
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ClusterState => "ec-install",
            Self::Console => "admin-console",
            Self::ObjectStore => "seaweedfs",
            Self::Registry => "registry",
            Self::Operator => "embedded-cluster-operator",
            Self::Application => "app",
        }
    }

    /// Label selecting this component's resources in a backup
    pub fn selector(&self) -> (&'static str, &'static str) {
        match self {
            Self::Console | Self::Operator => ("replicated.com/disaster-recovery-chart", self.tag()),
            Self::ClusterState | Self::Application => {
                ("replicated.com/disaster-recovery", self.tag())
            }
            Self::ObjectStore => ("app.kubernetes.io/name", "seaweedfs"),
            Self::Registry => ("app", "docker-registry"),
        }
    }

    fn display_name(&self) -> &'static str {
        match self {
            Self::ClusterState => "cluster state",
            Self::Console => "the Admin Console",
            Self::ObjectStore => "registry data",
            Self::Registry => "registry",
            Self::Operator => "embedded cluster operator",
            Self::Application => "application",
        }
    }
}

impl std::fmt::Display for DrComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkloadKind {
    Deployment,
    StatefulSet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Workload {
    kind: WorkloadKind,
    namespace: String,
    name: String,
}

impl Workload {
    fn deployment(namespace: &str, name: &str) -> Self {
        Self {
            kind: WorkloadKind::Deployment,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn stateful_set(namespace: &str, name: &str) -> Self {
        Self {
            kind: WorkloadKind::StatefulSet,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn key(&self) -> String {
        match self.kind {
            WorkloadKind::Deployment => format!("deployment/{}", self.name),
            WorkloadKind::StatefulSet => format!("statefulset/{}", self.name),
        }
    }
}

/// Workloads that must be ready after a component's restore completes
fn component_workloads(component: DrComponent, ns: &Namespaces) -> Vec<Workload> {
    match component {
        DrComponent::Console => vec![
            Workload::deployment(&ns.kotsadm, "kotsadm"),
            Workload::stateful_set(&ns.kotsadm, "kotsadm-rqlite"),
        ],
        DrComponent::ObjectStore => vec![
            Workload::stateful_set(&ns.seaweedfs, "seaweedfs-filer"),
            Workload::stateful_set(&ns.seaweedfs, "seaweedfs-master"),
            Workload::stateful_set(&ns.seaweedfs, "seaweedfs-volume"),
        ],
        DrComponent::Registry => vec![Workload::deployment(&ns.registry, "registry")],
        DrComponent::Operator => vec![Workload::deployment(
            &ns.embedded_cluster,
            "embedded-cluster-operator",
        )],
        DrComponent::ClusterState | DrComponent::Application => vec![],
    }
}

/// Copy the instance backup metadata onto a restore
fn copy_instance_metadata(restore: &mut Restore, backup: &Backup) {
    if let Some(name) = backup.label(INSTANCE_BACKUP_NAME_LABEL) {
        restore.set_label(INSTANCE_BACKUP_NAME_LABEL, name);
    }
    for key in [INSTANCE_BACKUP_TYPE_ANNOTATION, INSTANCE_BACKUP_COUNT_ANNOTATION] {
        if let Some(value) = backup.annotation(key) {
            restore.set_annotation(key, value);
        }
    }
}

/// Render the resource modifiers from a backup's recorded service addresses
pub fn render_resource_modifiers(facts: &BackupFacts) -> Result<String> {
    let registry = facts.registry_service_ip()?;
    let object_store = facts.object_store_service_ip()?;
    Ok(RESOURCE_MODIFIERS_TEMPLATE
        .replacen(REGISTRY_PLACEHOLDER, &registry, 1)
        .replacen(OBJECT_STORE_PLACEHOLDER, &object_store, 1))
}

/// Creates component restores and waits for them
pub struct ComponentRestorer<'a> {
    client: &'a dyn ClusterClient,
    config: &'a RuntimeConfig,
    release: &'a ReleaseInfo,
    cancel: &'a CancellationToken,
    progress: &'a dyn ProgressSink,
    restore_backoff: Backoff,
    workload_backoff: Backoff,
}

impl<'a> ComponentRestorer<'a> {
    /// Create a restorer using the default polling budgets
    pub fn new(
        client: &'a dyn ClusterClient,
        config: &'a RuntimeConfig,
        release: &'a ReleaseInfo,
        cancel: &'a CancellationToken,
        progress: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            client,
            config,
            release,
            cancel,
            progress,
            restore_backoff: Backoff::long_running(),
            workload_backoff: Backoff::default(),
        }
    }

    /// Override the polling schedules
    pub fn with_backoff(mut self, restore: Backoff, workloads: Backoff) -> Self {
        self.restore_backoff = restore;
        self.workload_backoff = workloads;
        self
    }

    /// Restore `component` from `backup` and wait until it is ready
    pub async fn restore(&self, backup: &ReplicatedBackup, component: DrComponent) -> Result<()> {
        let velero_ns = &self.config.namespaces.velero;
        let vendor_restore = match component {
            DrComponent::Application if self.release.improved_dr() => {
                self.release.vendor_restore.as_ref()
            }
            _ => None,
        };

        let (source, restore_name) = match vendor_restore {
            Some(_) => {
                let app = backup
                    .app_backup()
                    .ok_or_else(|| Error::validation("unable to find app backup"))?;
                (app, format!("{}.restore", app.name()))
            }
            None => {
                let infra = backup
                    .infra_backup()
                    .ok_or_else(|| Error::validation("unable to find infra backup"))?;
                (infra, format!("{}.{}", infra.name(), component.tag()))
            }
        };

        info!(restore = %restore_name, component = %component, "Restoring {}", component.display_name());

        if self.client.get_restore(velero_ns, &restore_name).await?.is_none() {
            let restore = match vendor_restore {
                Some(template) => self.vendor_restore(template, source, &restore_name),
                None => {
                    self.ensure_resource_modifiers(source).await?;
                    self.component_restore(source, component, &restore_name)
                }
            };

            debug!(restore = %restore_name, "creating restore");
            match self.client.create_restore(&restore).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {
                    debug!(restore = %restore_name, "restore already created");
                }
                Err(e) => return Err(e),
            }
        } else {
            debug!(restore = %restore_name, "restore exists, waiting for it");
        }

        self.wait_for_restore(&restore_name).await?;
        self.wait_for_workloads(component).await?;

        info!(restore = %restore_name, component = %component, "Restored {}", component.display_name());
        Ok(())
    }

    fn vendor_restore(&self, template: &Restore, backup: &Backup, name: &str) -> Restore {
        let mut restore = template.clone();
        restore.metadata.name = Some(name.to_string());
        restore.metadata.namespace = Some(self.config.namespaces.velero.clone());
        restore.metadata.resource_version = None;
        restore.metadata.uid = None;
        restore.status = None;
        restore.set_annotation(BACKUP_IS_EC_ANNOTATION, "true");
        copy_instance_metadata(&mut restore, backup);
        restore.spec.backup_name = backup.name().to_string();
        restore
    }

    fn component_restore(&self, backup: &Backup, component: DrComponent, name: &str) -> Restore {
        let (key, value) = component.selector();
        let mut restore = Restore::new(
            name,
            self.config.namespaces.velero.clone(),
            RestoreSpec {
                backup_name: backup.name().to_string(),
                label_selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
                    ..Default::default()
                }),
                restore_pvs: Some(true),
                include_cluster_resources: Some(true),
                resource_modifier: Some(TypedLocalObjectReference {
                    kind: "ConfigMap".to_string(),
                    name: RESOURCE_MODIFIERS_CONFIG_MAP.to_string(),
                }),
                ..Default::default()
            },
        );
        restore.set_annotation(BACKUP_IS_EC_ANNOTATION, "true");
        copy_instance_metadata(&mut restore, backup);
        restore
    }

    async fn ensure_resource_modifiers(&self, backup: &Backup) -> Result<()> {
        let rendered = render_resource_modifiers(&BackupFacts::from_backup(backup))?;
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(RESOURCE_MODIFIERS_CONFIG_MAP.to_string()),
                namespace: Some(self.config.namespaces.velero.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(RESOURCE_MODIFIERS_KEY.to_string(), rendered)])),
            ..Default::default()
        };
        match self.client.create_config_map(&cm).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn wait_for_restore(&self, name: &str) -> Result<()> {
        let client = self.client;
        let namespace = self.config.namespaces.velero.as_str();
        let resource = format!("restore {}", name);

        let result = wait_until(self.cancel, &self.restore_backoff, &resource, || {
            let resource = resource.clone();
            async move {
                let Some(restore) = client.get_restore(namespace, name).await? else {
                    return Err(PollError::Transient(Error::NotFound {
                        kind: "Restore".to_string(),
                        name: format!("{}/{}", namespace, name),
                    }));
                };
                let outcome = match restore.phase() {
                    RestorePhase::Completed => return Ok(true),
                    RestorePhase::Failed => "restore failed",
                    RestorePhase::PartiallyFailed => "restore partially failed",
                    _ => return Ok(false),
                };
                let (errors, warnings) = restore
                    .status
                    .as_ref()
                    .map(|s| (s.errors, s.warnings))
                    .unwrap_or_default();
                Err(PollError::Fatal(Error::failed(
                    resource,
                    format!(
                        "restore failed with {} errors and {} warnings: {}",
                        errors, warnings, outcome
                    ),
                )))
            }
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e @ (Error::Failed { .. } | Error::Cancelled { .. })) => Err(e),
            Err(e) => Err(Error::failed(
                format!("restore {}", name),
                format!("unable to wait for restore: {}", e),
            )),
        }
    }

    async fn wait_for_workloads(&self, component: DrComponent) -> Result<()> {
        let workloads = component_workloads(component, &self.config.namespaces);
        if workloads.is_empty() {
            return Ok(());
        }

        let client = self.client;
        let names: Vec<String> = workloads.iter().map(Workload::key).collect();
        let label = format!("Waiting for {}", component.display_name());

        wait_until_all(
            self.cancel,
            &self.workload_backoff,
            &label,
            &names,
            self.progress,
            |key| {
                let workload = workloads.iter().find(|w| w.key() == key).cloned();
                async move {
                    let Some(w) = workload else {
                        return Ok(false);
                    };
                    let ready = match w.kind {
                        WorkloadKind::Deployment => client
                            .get_deployment(&w.namespace, &w.name)
                            .await?
                            .is_some_and(|d| is_deployment_ready(&d)),
                        WorkloadKind::StatefulSet => client
                            .get_stateful_set(&w.namespace, &w.name)
                            .await?
                            .is_some_and(|s| is_stateful_set_ready(&s)),
                    };
                    Ok(ready)
                }
            },
        )
        .await
        .map_err(|e| match e {
            Error::Cancelled { .. } => e,
            e => Error::failed(
                format!("{} workloads", component.tag()),
                format!("unable to wait for {}: {}", component.display_name(), e),
            ),
        })
    }
}
