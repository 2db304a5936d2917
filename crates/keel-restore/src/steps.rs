//! The actions run for each restore state.
//!
//! [`RestoreSteps`] has one method per state so the orchestrator can be
//! driven against a mock. [`ClusterRestoreSteps`] is the real implementation
//! built on the cluster client, the component restorer and the host
//! collaborators.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use keel_common::crd::installation::{self, InstallationState};
use keel_common::kube_utils::{is_control_plane_node, is_node_ready};
use keel_common::wait::{wait_until, Backoff, PollError, ProgressSink};
use keel_common::{ClusterClient, Error, ReleaseInfo, Result, RuntimeConfig};

use crate::backup::{annotations, pick_latest, ReplicatedBackup};
use crate::component::{ComponentRestorer, DrComponent};
use crate::host::{BackupStore, HostOps, Prompt};
use crate::validate::{filter_restorable, RestoreTarget};

/// Control-plane nodes an HA cluster needs before restore continues
pub const MIN_HA_CONTROLLERS: usize = 3;

/// One action per restore state
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait RestoreSteps: Send + Sync {
    /// Install the cluster and point it at the backup store
    async fn prepare_host(&self) -> Result<()>;

    /// Select the backup to restore; `None` when the operator declined
    async fn confirm_backup(&self) -> Result<Option<ReplicatedBackup>>;

    /// Re-derive a previously selected backup and check it is still restorable
    async fn resume_backup(&self, name: &str) -> Result<ReplicatedBackup>;

    /// Restore the installation record and cluster-level resources
    async fn restore_cluster_state(&self, backup: &ReplicatedBackup) -> Result<()>;

    /// Restore the admin console
    async fn restore_console(&self, backup: &ReplicatedBackup) -> Result<()>;

    /// Wait for the operator to add the remaining nodes
    async fn wait_for_nodes(&self, backup: &ReplicatedBackup) -> Result<()>;

    /// Restore the object store (airgap HA only)
    async fn restore_object_store(&self, backup: &ReplicatedBackup) -> Result<()>;

    /// Restore the registry (airgap only)
    async fn restore_registry(&self, backup: &ReplicatedBackup) -> Result<()>;

    /// Restore the embedded cluster operator
    async fn restore_operator(&self, backup: &ReplicatedBackup) -> Result<()>;

    /// Install vendor extensions
    async fn restore_extensions(&self) -> Result<()>;

    /// Restore the application
    async fn restore_application(&self, backup: &ReplicatedBackup) -> Result<()>;
}

/// Operator-supplied restore options
#[derive(Clone, Debug, Default)]
pub struct RestoreOptions {
    /// Backup store coordinates; missing fields are prompted for
    pub backup_store: BackupStore,
    /// Skip the remote backup store check
    pub skip_store_validation: bool,
    /// Local artifact mirror port given on the command line
    pub local_artifact_mirror_port: Option<u16>,
}

/// Polling schedules used by the steps
#[derive(Clone, Debug)]
pub struct StepBackoffs {
    /// Waiting for backups to sync from the store
    pub backup_listing: Backoff,
    /// Waiting for a restore to complete
    pub restore: Backoff,
    /// Waiting for workloads and nodes
    pub readiness: Backoff,
}

impl Default for StepBackoffs {
    fn default() -> Self {
        Self {
            backup_listing: Backoff::backup_listing(),
            restore: Backoff::long_running(),
            readiness: Backoff::default(),
        }
    }
}

fn backup_list_poisoned() -> Error {
    Error::internal_with_context("restore", "backup list lock poisoned")
}

fn take_backups(found: Mutex<Vec<ReplicatedBackup>>) -> Result<Vec<ReplicatedBackup>> {
    found.into_inner().map_err(|_| backup_list_poisoned())
}

/// Restore steps against a live cluster
pub struct ClusterRestoreSteps<'a> {
    client: &'a dyn ClusterClient,
    config: &'a RuntimeConfig,
    release: &'a ReleaseInfo,
    host: &'a dyn HostOps,
    prompt: &'a dyn Prompt,
    progress: &'a dyn ProgressSink,
    cancel: &'a CancellationToken,
    options: RestoreOptions,
    backoffs: StepBackoffs,
    data_dir: String,
}

impl<'a> ClusterRestoreSteps<'a> {
    /// Wire the steps to their collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: &'a dyn ClusterClient,
        config: &'a RuntimeConfig,
        release: &'a ReleaseInfo,
        host: &'a dyn HostOps,
        prompt: &'a dyn Prompt,
        progress: &'a dyn ProgressSink,
        cancel: &'a CancellationToken,
        options: RestoreOptions,
    ) -> Self {
        Self {
            client,
            config,
            release,
            host,
            prompt,
            progress,
            cancel,
            options,
            backoffs: StepBackoffs::default(),
            data_dir: config.data_dir_str(),
        }
    }

    /// Override the polling schedules
    pub fn with_backoffs(mut self, backoffs: StepBackoffs) -> Self {
        self.backoffs = backoffs;
        self
    }

    fn target(&self) -> RestoreTarget<'_> {
        RestoreTarget {
            release: self.release,
            airgap: self.config.airgap,
            network: &self.config.network,
            data_dir: &self.data_dir,
        }
    }

    fn restorer(&self) -> ComponentRestorer<'_> {
        ComponentRestorer::new(
            self.client,
            self.config,
            self.release,
            self.cancel,
            self.progress,
        )
        .with_backoff(self.backoffs.restore.clone(), self.backoffs.readiness.clone())
    }

    async fn list_replicated_backups(&self) -> Result<Vec<ReplicatedBackup>> {
        let backups = self.client.list_backups(&self.config.namespaces.velero).await?;
        Ok(ReplicatedBackup::group(backups))
    }

    /// Poll until at least one replicated backup is visible
    async fn wait_for_backups(&self) -> Result<Vec<ReplicatedBackup>> {
        info!("Waiting for backups to become available");
        let found: Mutex<Vec<ReplicatedBackup>> = Mutex::new(Vec::new());

        let result = wait_until(
            self.cancel,
            &self.backoffs.backup_listing,
            "backups to become available",
            || {
                let found = &found;
                async move {
                    let groups = self.list_replicated_backups().await.map_err(|e| {
                        PollError::Fatal(Error::internal_with_context(
                            "restore",
                            format!("unable to list backups: {}", e),
                        ))
                    })?;
                    if groups.is_empty() {
                        debug!("No backups found yet...");
                        return Ok(false);
                    }
                    debug!(count = groups.len(), "Found backups");
                    *found.lock().map_err(|_| PollError::Fatal(backup_list_poisoned()))? = groups;
                    Ok(true)
                }
            },
        )
        .await;

        match result {
            Ok(()) => take_backups(found),
            Err(Error::Timeout { operation, .. }) => Err(Error::timeout(
                operation,
                format!("no backups found after {} checks", self.backoffs.backup_listing.steps),
            )),
            Err(e) => Err(e),
        }
    }

    async fn reconcile_installation(&self, backup: &ReplicatedBackup) -> Result<u16> {
        let port = match self.options.local_artifact_mirror_port {
            Some(port) => port,
            None => backup
                .facts()
                .local_artifact_mirror_port()?
                .unwrap_or(self.config.local_artifact_mirror_port),
        };

        let installations = self.client.list_installations().await?;
        let mut latest = installation::latest(&installations)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "Installation".to_string(),
                name: "latest".to_string(),
            })?;

        debug!(installation = %latest.name(), port, "updating installation from backup");
        latest
            .spec
            .runtime_config
            .get_or_insert_with(|| self.config.clone())
            .local_artifact_mirror_port = port;
        let mut updated = self.client.update_installation(&latest).await?;

        updated.set_state(
            InstallationState::KubernetesInstalled,
            "restored from backup",
        );
        self.client.update_installation_status(&updated).await?;
        Ok(port)
    }

    async fn control_plane_count(&self) -> Result<usize> {
        let nodes = self.client.list_nodes().await?;
        Ok(nodes.iter().filter(|n| is_control_plane_node(n)).count())
    }

    async fn wait_for_ready_nodes(&self) -> Result<()> {
        let client = self.client;
        let progress = self.progress;
        wait_until(
            self.cancel,
            &self.backoffs.readiness,
            "all nodes to be ready",
            || async move {
                let nodes = client.list_nodes().await?;
                let ready = nodes.iter().filter(|n| is_node_ready(n)).count();
                progress.report(&format!(
                    "Waiting for all nodes to be ready: {}/{} ready",
                    ready,
                    nodes.len()
                ));
                Ok(!nodes.is_empty() && ready == nodes.len())
            },
        )
        .await
    }
}

#[async_trait]
impl<'a> RestoreSteps for ClusterRestoreSteps<'a> {
    async fn prepare_host(&self) -> Result<()> {
        debug!("checking if a cluster is already installed");
        self.host.verify_no_installation().await?;

        let mut store = self.options.backup_store.clone();
        store.resolve(self.prompt)?;

        if !self.options.skip_store_validation {
            debug!("validating backup store configuration");
            self.host.validate_backup_store(&store).await?;
        }

        debug!("configuring network manager");
        self.host.configure_network_manager().await?;
        debug!("materializing binaries");
        self.host.materialize_binaries().await?;
        debug!("running host preflights");
        self.host.run_host_preflights().await?;
        self.host.install_cluster().await?;
        debug!("configuring velero backup storage location");
        self.host.configure_backup_store(&store).await
    }

    async fn confirm_backup(&self) -> Result<Option<ReplicatedBackup>> {
        let candidates = self.wait_for_backups().await?;
        let restorable = filter_restorable(&self.target(), candidates)?;
        if restorable.len() == 1 {
            info!("Found 1 restorable backup!");
        } else {
            info!("Found {} restorable backups!", restorable.len());
        }

        let Some(chosen) = pick_latest(&restorable) else {
            return Ok(None);
        };
        debug!(backup = %chosen.name(), "backup to restore");

        let question = format!(
            "Restore from backup {:?} ({})?",
            chosen.name(),
            chosen.completion_display()
        );
        if !self.prompt.confirm(&question, true)? {
            info!("Aborting restore...");
            return Ok(None);
        }
        Ok(Some(chosen.clone()))
    }

    async fn resume_backup(&self, name: &str) -> Result<ReplicatedBackup> {
        let backup = self
            .list_replicated_backups()
            .await?
            .into_iter()
            .find(|b| b.name() == name)
            .ok_or_else(|| Error::NotFound {
                kind: "Backup".to_string(),
                name: name.to_string(),
            })?;

        self.target()
            .check_replicated(&backup)
            .map_err(|reason| Error::incompatible(name, reason))?;

        info!(
            "Resuming restore from backup {:?} ({})",
            backup.name(),
            backup.completion_display()
        );
        Ok(backup)
    }

    async fn restore_cluster_state(&self, backup: &ReplicatedBackup) -> Result<()> {
        self.restorer().restore(backup, DrComponent::ClusterState).await?;
        let port = self.reconcile_installation(backup).await?;
        debug!(backup = %backup.name(), port, "updating local artifact mirror service");
        self.host.refresh_local_artifact_mirror(port).await
    }

    async fn restore_console(&self, backup: &ReplicatedBackup) -> Result<()> {
        self.restorer().restore(backup, DrComponent::Console).await?;
        debug!("installing manager");
        self.host.install_manager().await
    }

    async fn wait_for_nodes(&self, backup: &ReplicatedBackup) -> Result<()> {
        let high_availability = backup.facts().is_high_availability()?;

        info!(
            port = self.config.admin_console_port,
            "Visit the Admin Console if you need to add nodes to the cluster"
        );
        loop {
            let answer = self
                .prompt
                .input("Type 'continue' when you are done adding nodes:", "", false)?;
            if answer.trim() != "continue" {
                info!("Please type 'continue' to proceed");
                continue;
            }
            if high_availability {
                let controllers = self.control_plane_count().await?;
                if controllers < MIN_HA_CONTROLLERS {
                    info!(
                        "You are restoring a high-availability cluster, which requires at least {} controller nodes. You currently have {}. Please add more controller nodes.",
                        MIN_HA_CONTROLLERS, controllers
                    );
                    continue;
                }
            }
            break;
        }

        self.wait_for_ready_nodes().await?;
        info!("All nodes are ready!");
        Ok(())
    }

    async fn restore_object_store(&self, backup: &ReplicatedBackup) -> Result<()> {
        let high_availability = backup.facts().is_high_availability()?;
        if !self.config.airgap || !high_availability {
            return Ok(());
        }
        self.restorer().restore(backup, DrComponent::ObjectStore).await
    }

    async fn restore_registry(&self, backup: &ReplicatedBackup) -> Result<()> {
        if !self.config.airgap {
            return Ok(());
        }
        self.restorer().restore(backup, DrComponent::Registry).await?;

        let address = backup
            .annotation(annotations::REGISTRY)
            .ok_or_else(|| Error::validation("unable to read registry address from backup"))?;
        self.host.add_insecure_registry(address).await
    }

    async fn restore_operator(&self, backup: &ReplicatedBackup) -> Result<()> {
        self.restorer().restore(backup, DrComponent::Operator).await
    }

    async fn restore_extensions(&self) -> Result<()> {
        debug!("installing extensions");
        self.host.install_extensions().await
    }

    async fn restore_application(&self, backup: &ReplicatedBackup) -> Result<()> {
        self.restorer().restore(backup, DrComponent::Application).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::tests::backup;
    use crate::host::{MockHostOps, MockPrompt};
    use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus};
    use keel_common::config::NetworkSpec;
    use keel_common::crd::installation::{Installation, InstallationSpec};
    use keel_common::crd::velero::{Restore, RestorePhase, RestoreSpec, RestoreStatus};
    use keel_common::kube_utils::LABEL_CONTROL_PLANE;
    use keel_common::wait::LogProgress;
    use keel_common::{MockClusterClient, BACKUP_IS_EC_ANNOTATION};
    use kube::core::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn quick() -> StepBackoffs {
        let b = Backoff::fixed(3, Duration::from_millis(1));
        StepBackoffs {
            backup_listing: b.clone(),
            restore: b.clone(),
            readiness: b,
        }
    }

    fn release() -> ReleaseInfo {
        ReleaseInfo {
            version: "v1.2.3".to_string(),
            app_slug: "app".to_string(),
            version_label: "1.0.0".to_string(),
            ..Default::default()
        }
    }

    fn good(name: &str, minute: u32, extra: &[(&'static str, &'static str)]) -> ReplicatedBackup {
        let mut ann = vec![
            (BACKUP_IS_EC_ANNOTATION, "true"),
            (annotations::VERSION, "v1.2.3"),
            (annotations::APPS_VERSIONS, r#"{"app":"1.0.0"}"#),
            (annotations::IS_AIRGAP, "false"),
            (annotations::IS_HA, "false"),
        ];
        for &(k, v) in extra {
            ann.retain(|(key, _)| *key != k);
            ann.push((k, v));
        }
        ReplicatedBackup(vec![backup(name, minute, &ann)])
    }

    struct Harness {
        client: MockClusterClient,
        host: MockHostOps,
        prompt: MockPrompt,
        config: RuntimeConfig,
        options: RestoreOptions,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                client: MockClusterClient::new(),
                host: MockHostOps::new(),
                prompt: MockPrompt::new(),
                config: RuntimeConfig::default(),
                options: RestoreOptions::default(),
            }
        }
    }

    macro_rules! steps {
        ($h:expr, $rel:expr, $cancel:expr) => {
            ClusterRestoreSteps::new(
                &$h.client,
                &$h.config,
                $rel,
                &$h.host,
                &$h.prompt,
                &LogProgress,
                $cancel,
                $h.options.clone(),
            )
            .with_backoffs(quick())
        };
    }

    fn node(name: &str, control_plane: bool, ready: bool) -> Node {
        let mut labels = BTreeMap::new();
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
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_confirm_picks_latest_restorable_backup() {
        let mut h = Harness::new();
        let listed = vec![
            good("older", 1, &[]),
            good("newer", 9, &[]),
            good("wrong-version", 30, &[(annotations::VERSION, "v0.9.0")]),
        ];
        let backups: Vec<_> = listed.into_iter().flat_map(|g| g.0).collect();
        h.client
            .expect_list_backups()
            .withf(|ns| ns == "velero")
            .returning(move |_| Ok(backups.clone()));
        h.prompt
            .expect_confirm()
            .withf(|m, d| m.starts_with("Restore from backup \"newer\"") && *d)
            .times(1)
            .returning(|_, _| Ok(true));

        let rel = release();
        let cancel = CancellationToken::new();
        let chosen = steps!(h, &rel, &cancel).confirm_backup().await.unwrap();
        assert_eq!(chosen.unwrap().name(), "newer");
    }

    #[tokio::test]
    async fn test_confirm_declined_returns_none() {
        let mut h = Harness::new();
        let backups = good("b1", 1, &[]).0;
        h.client
            .expect_list_backups()
            .returning(move |_| Ok(backups.clone()));
        h.prompt.expect_confirm().returning(|_, _| Ok(false));

        let rel = release();
        let cancel = CancellationToken::new();
        assert!(steps!(h, &rel, &cancel)
            .confirm_backup()
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_backups_appear_after_retries() {
        let mut h = Harness::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let backups = good("b1", 1, &[]).0;
        h.client.expect_list_backups().returning(move |_| {
            if c.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(vec![])
            } else {
                Ok(backups.clone())
            }
        });
        h.prompt.expect_confirm().returning(|_, _| Ok(true));

        let rel = release();
        let cancel = CancellationToken::new();
        let chosen = steps!(h, &rel, &cancel).confirm_backup().await.unwrap();
        assert_eq!(chosen.unwrap().name(), "b1");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_data_dir_matches_backup_annotation() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let mut h = Harness::new();
        h.config.data_dir = OsStr::from_bytes(b"/var/lib/\xffkeel").into();
        let backups = good("b1", 1, &[(annotations::DATA_DIR, "/var/lib/\u{FFFD}keel")]).0;
        h.client
            .expect_list_backups()
            .returning(move |_| Ok(backups.clone()));
        h.prompt.expect_confirm().returning(|_, _| Ok(true));

        let rel = release();
        let cancel = CancellationToken::new();
        let chosen = steps!(h, &rel, &cancel).confirm_backup().await.unwrap();
        assert_eq!(chosen.unwrap().name(), "b1");
    }

    #[test]
    fn test_poisoned_backup_list_is_internal_error() {
        let found: Mutex<Vec<ReplicatedBackup>> = Mutex::new(Vec::new());
        let _ = std::panic::catch_unwind(|| {
            let _guard = found.lock().unwrap();
            panic!("listing task panicked");
        });
        assert!(found.is_poisoned());

        let err = take_backups(found).unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
        assert!(err.to_string().contains("backup list lock poisoned"));
    }

    #[tokio::test]
    async fn test_no_backups_times_out() {
        let mut h = Harness::new();
        h.client.expect_list_backups().returning(|_| Ok(vec![]));

        let rel = release();
        let cancel = CancellationToken::new();
        let err = steps!(h, &rel, &cancel).confirm_backup().await.unwrap_err();
        assert!(err
            .to_string()
            .starts_with("timed out waiting for backups to become available"));
    }

    #[tokio::test]
    async fn test_all_rejected_reports_each_backup() {
        let mut h = Harness::new();
        let backups = good("b1", 1, &[(annotations::IS_AIRGAP, "true")]).0;
        h.client
            .expect_list_backups()
            .returning(move |_| Ok(backups.clone()));
        h.prompt.expect_confirm().never();

        let rel = release();
        let cancel = CancellationToken::new();
        let err = steps!(h, &rel, &cancel).confirm_backup().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Found 1 backup, but it is not restorable:\n\"b1\" is an airgap backup, but the restore is configured to be online"
        );
    }

    #[tokio::test]
    async fn test_resume_rejects_backup_that_became_incompatible() {
        let mut h = Harness::new();
        h.config.network = NetworkSpec {
            pod_cidr: "10.244.0.0/16".to_string(),
            service_cidr: "10.96.0.0/12".to_string(),
            ..Default::default()
        };
        let backups = good(
            "b1",
            1,
            &[
                (annotations::POD_CIDR, "10.0.0.0/17"),
                (annotations::SERVICE_CIDR, "10.0.128.0/17"),
            ],
        )
        .0;
        h.client
            .expect_list_backups()
            .returning(move |_| Ok(backups.clone()));

        let rel = release();
        let cancel = CancellationToken::new();
        let steps = steps!(h, &rel, &cancel);
        let err = steps.resume_backup("b1").await.unwrap_err();
        assert!(matches!(err, Error::Incompatible { ref backup, .. } if backup == "b1"));
        assert!(err.to_string().contains("--cidr 10.0.0.0/16"));

        let err = steps.resume_backup("gone").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cluster_state_reconciles_installation() {
        let mut h = Harness::new();
        h.client.expect_get_restore().returning(|_, name| {
            let mut r = Restore::new(name, "velero", RestoreSpec::default());
            r.status = Some(RestoreStatus {
                phase: Some(RestorePhase::Completed),
                ..Default::default()
            });
            Ok(Some(r))
        });
        h.client.expect_list_installations().returning(|| {
            Ok(["20240101000000", "20240301000000"]
                .iter()
                .map(|n| Installation {
                    metadata: ObjectMeta {
                        name: Some(n.to_string()),
                        ..Default::default()
                    },
                    spec: InstallationSpec::default(),
                    status: None,
                })
                .collect())
        });
        h.client
            .expect_update_installation()
            .withf(|i| {
                i.name() == "20240301000000"
                    && i.spec.runtime_config.as_ref().unwrap().local_artifact_mirror_port == 50001
            })
            .times(1)
            .returning(|i| Ok(i.clone()));
        h.client
            .expect_update_installation_status()
            .withf(|i| i.state() == InstallationState::KubernetesInstalled)
            .times(1)
            .returning(|i| Ok(i.clone()));
        h.host
            .expect_refresh_local_artifact_mirror()
            .withf(|p| *p == 50001)
            .times(1)
            .returning(|_| Ok(()));

        let rel = release();
        let cancel = CancellationToken::new();
        let backup = good(
            "b1",
            1,
            &[(annotations::LOCAL_ARTIFACT_MIRROR_PORT, "50001")],
        );
        steps!(h, &rel, &cancel)
            .restore_cluster_state(&backup)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ha_wait_requires_three_controllers() {
        let mut h = Harness::new();
        h.prompt
            .expect_input()
            .returning(|_, _, _| Ok("continue".to_string()));
        let lists = Arc::new(AtomicU32::new(0));
        let l = lists.clone();
        h.client.expect_list_nodes().returning(move || {
            let n = l.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(vec![node("a", true, true), node("b", true, true)])
            } else {
                Ok(vec![
                    node("a", true, true),
                    node("b", true, true),
                    node("c", true, true),
                ])
            }
        });

        let rel = release();
        let cancel = CancellationToken::new();
        let backup = good("b1", 1, &[(annotations::IS_HA, "true")]);
        steps!(h, &rel, &cancel)
            .wait_for_nodes(&backup)
            .await
            .unwrap();
        // Two controller checks, then one readiness poll
        assert_eq!(lists.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_for_nodes_needs_continue() {
        let mut h = Harness::new();
        let mut seq = mockall::Sequence::new();
        h.prompt
            .expect_input()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok("done".to_string()));
        h.prompt
            .expect_input()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok("continue".to_string()));
        h.client
            .expect_list_nodes()
            .returning(|| Ok(vec![node("a", true, true), node("w", false, true)]));

        let rel = release();
        let cancel = CancellationToken::new();
        steps!(h, &rel, &cancel)
            .wait_for_nodes(&good("b1", 1, &[]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_online_restore_skips_registry_and_object_store() {
        let mut h = Harness::new();
        h.client.expect_get_restore().never();
        h.host.expect_add_insecure_registry().never();

        let rel = release();
        let cancel = CancellationToken::new();
        let steps = steps!(h, &rel, &cancel);
        let backup = good("b1", 1, &[(annotations::IS_HA, "true")]);
        steps.restore_object_store(&backup).await.unwrap();
        steps.restore_registry(&backup).await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_host_runs_collaborators_in_order() {
        let mut h = Harness::new();
        h.options.backup_store = BackupStore {
            endpoint: "https://s3.amazonaws.com".to_string(),
            region: "us-east-1".to_string(),
            bucket: "b".to_string(),
            prefix: "/p".to_string(),
            access_key_id: "k".to_string(),
            secret_access_key: "s".to_string(),
        };
        h.options.skip_store_validation = true;

        let mut seq = mockall::Sequence::new();
        h.host
            .expect_verify_no_installation()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        h.host.expect_validate_backup_store().never();
        h.host
            .expect_configure_network_manager()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        h.host
            .expect_materialize_binaries()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        h.host
            .expect_run_host_preflights()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        h.host
            .expect_install_cluster()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        h.host
            .expect_configure_backup_store()
            .withf(|s| s.prefix == "p")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let rel = release();
        let cancel = CancellationToken::new();
        steps!(h, &rel, &cancel).prepare_host().await.unwrap();
    }
}
