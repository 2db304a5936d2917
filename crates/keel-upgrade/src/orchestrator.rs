//! Upgrade orchestration.
//!
//! [`Upgrader::prepare`] stages everything the new version needs before any
//! component moves (airgap artifacts, the locked Installation). Then
//! [`Upgrader::upgrade`] upgrades the substrate, reconciles the charts and
//! unlocks the Installation. `upgrade` is meant to be re-invoked while it
//! returns retryable errors.

use tokio_util::sync::CancellationToken;
use tracing::info;

use keel_common::crd::installation::Installation;
use keel_common::wait::{Backoff, ProgressSink};
use keel_common::{ClusterClient, Error, Result, RuntimeConfig};

use crate::artifacts::distribute_artifacts;
use crate::charts::{reconcile_charts, wait_for_operator_chart};
use crate::installation::{create_installation, disable_old_installations, unlock_installation};
use crate::metadata::load_release_metadata;
use crate::substrate::upgrade_substrate;
use crate::upgrade_job_name;

/// Operator-supplied upgrade options
#[derive(Clone, Debug, Default)]
pub struct UpgradeOptions {
    /// Image of the local artifact mirror, required for airgap installations
    pub local_artifact_mirror_image: Option<String>,
}

/// Polling schedules used while upgrading
#[derive(Clone, Debug)]
pub struct UpgradeBackoffs {
    /// Artifact jobs and the image load plan
    pub artifacts: Backoff,
    /// Operator chart rollout
    pub operator_chart: Backoff,
}

impl Default for UpgradeBackoffs {
    fn default() -> Self {
        Self {
            artifacts: Backoff::long_running(),
            operator_chart: Backoff::default(),
        }
    }
}

/// Drives one Installation to its desired version
pub struct Upgrader<'a> {
    client: &'a dyn ClusterClient,
    config: &'a RuntimeConfig,
    cancel: &'a CancellationToken,
    progress: &'a dyn ProgressSink,
    options: UpgradeOptions,
    backoffs: UpgradeBackoffs,
}

impl<'a> Upgrader<'a> {
    /// Wire the upgrader to its collaborators
    pub fn new(
        client: &'a dyn ClusterClient,
        config: &'a RuntimeConfig,
        cancel: &'a CancellationToken,
        progress: &'a dyn ProgressSink,
        options: UpgradeOptions,
    ) -> Self {
        Self {
            client,
            config,
            cancel,
            progress,
            options,
            backoffs: UpgradeBackoffs::default(),
        }
    }

    /// Override the polling schedules
    pub fn with_backoffs(mut self, backoffs: UpgradeBackoffs) -> Self {
        self.backoffs = backoffs;
        self
    }

    /// Stage the new version: place airgap artifacts on every node, then
    /// create the target Installation locked in `Waiting`
    pub async fn prepare(&self, installation: &Installation) -> Result<()> {
        let job = upgrade_job_name(installation.name());
        if installation.spec.air_gap {
            let image = self
                .options
                .local_artifact_mirror_image
                .as_deref()
                .filter(|i| !i.is_empty())
                .ok_or_else(|| {
                    Error::validation_for_field(
                        "--local-artifact-mirror-image",
                        "local artifact mirror image is required for airgap installations",
                    )
                })?;

            info!(job = %job, "Placing artifacts on nodes");
            distribute_artifacts(
                self.client,
                self.config,
                installation,
                image,
                self.cancel,
                &self.backoffs.artifacts,
                self.progress,
            )
            .await?;
        }

        create_installation(self.client, installation).await
    }

    /// Upgrade the substrate and charts, then unlock the Installation
    pub async fn upgrade(&self, installation: &Installation) -> Result<()> {
        let job = upgrade_job_name(installation.name());
        let version = installation.version();
        info!(job = %job, version = %version, "Upgrading installation");

        let meta =
            load_release_metadata(self.client, &self.config.namespaces.embedded_cluster, version)
                .await?;

        upgrade_substrate(self.client, self.config, installation, &meta).await?;
        reconcile_charts(self.client, self.config, installation, &meta).await?;
        wait_for_operator_chart(
            self.client,
            self.config,
            installation,
            &meta,
            self.cancel,
            &self.backoffs.operator_chart,
        )
        .await?;

        unlock_installation(self.client, installation).await?;
        disable_old_installations(self.client).await?;
        info!(job = %job, version = %version, "Upgrade complete");
        Ok(())
    }
}
