//! `keel upgrade`: move the cluster to the version an Installation asks for

use std::path::{Path, PathBuf};

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use keel_common::crd::installation::Installation;
use keel_common::retry::{retry_with_backoff, RetryConfig};
use keel_common::RuntimeConfig;
use keel_upgrade::{upgrade_job_name, UpgradeOptions, Upgrader};

use super::{load_config, StdoutProgress};
use crate::client::LazyClusterClient;
use crate::{Error, Result};

/// Upgrade the cluster to a new Installation
#[derive(Args, Debug)]
pub struct UpgradeArgs {
    /// Installation to upgrade to, as YAML
    #[arg(long)]
    pub installation: PathBuf,

    /// Image used to copy airgap artifacts onto every node
    #[arg(long, env = "KEEL_LOCAL_ARTIFACT_MIRROR_IMAGE")]
    pub local_artifact_mirror_image: Option<String>,

    /// Kubeconfig; the in-cluster configuration is used when omitted
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Give up after this many attempts (0 retries until cancelled)
    #[arg(long, default_value_t = 0)]
    pub max_attempts: u32,
}

/// Read the target Installation, dropping server-assigned identity so it
/// can be created
pub fn load_installation(path: &Path) -> Result<Installation> {
    let data = std::fs::read_to_string(path)?;
    let mut installation: Installation = serde_yaml::from_str(&data)?;
    if installation.name().is_empty() {
        return Err(Error::validation(format!(
            "installation in {} has no name",
            path.display()
        )));
    }
    installation.metadata.resource_version = None;
    installation.metadata.uid = None;
    Ok(installation)
}

/// The runtime configuration recorded on the Installation, or the
/// `--config` layering when it carries none
pub fn runtime_config(
    installation: &Installation,
    config_path: Option<&Path>,
) -> Result<RuntimeConfig> {
    match &installation.spec.runtime_config {
        Some(recorded) => Ok(recorded.clone()),
        None => load_config(config_path),
    }
}

/// Stage the new version, then upgrade until done or a terminal error
pub async fn run(
    args: UpgradeArgs,
    config_path: Option<&Path>,
    cancel: CancellationToken,
) -> Result<()> {
    let installation = load_installation(&args.installation)?;
    let config = runtime_config(&installation, config_path)?;
    let kubeconfig = args.kubeconfig.clone().or_else(|| config.kubeconfig.clone());
    let client = LazyClusterClient::new(kubeconfig);

    let options = UpgradeOptions {
        local_artifact_mirror_image: args.local_artifact_mirror_image.clone(),
    };
    let upgrader = Upgrader::new(&client, &config, &cancel, &StdoutProgress, options);
    upgrader.prepare(&installation).await?;

    let retry = RetryConfig::with_max_attempts(args.max_attempts);
    let job = upgrade_job_name(installation.name());
    let (upgrader, installation, cancel) = (&upgrader, &installation, &cancel);
    retry_with_backoff(
        &retry,
        &job,
        |e: &keel_common::Error| e.is_retryable() && !cancel.is_cancelled(),
        move || upgrader.upgrade(installation),
    )
    .await?;

    info!(job = %job, "Upgrade finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSTALLATION_YAML: &str = r#"
apiVersion: embeddedcluster.replicated.com/v1beta1
kind: Installation
metadata:
  name: "20240501000000"
  resourceVersion: "4711"
  uid: 6d1a8c4e-0000-0000-0000-000000000000
spec:
  airGap: true
  config:
    version: 1.4.0
  runtimeConfig:
    dataDir: /opt/keel
    localArtifactMirrorPort: 50001
"#;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_load_installation_drops_server_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "installation.yaml", INSTALLATION_YAML);

        let installation = load_installation(&path).unwrap();
        assert_eq!(installation.name(), "20240501000000");
        assert_eq!(installation.version(), "1.4.0");
        assert!(installation.spec.air_gap);
        assert!(installation.metadata.resource_version.is_none());
        assert!(installation.metadata.uid.is_none());
    }

    #[test]
    fn test_unnamed_installation_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "installation.yaml",
            "apiVersion: embeddedcluster.replicated.com/v1beta1\nkind: Installation\nmetadata: {}\nspec: {}\n",
        );

        let err = load_installation(&path).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_recorded_runtime_config_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let installation =
            load_installation(&write(dir.path(), "i.yaml", INSTALLATION_YAML)).unwrap();
        let file = write(dir.path(), "keel.yaml", "dataDir: /srv/other\n");

        let config = runtime_config(&installation, Some(&file)).unwrap();
        assert_eq!(config.data_dir, Path::new("/opt/keel"));
        assert_eq!(config.local_artifact_mirror_port, 50001);
    }

    #[test]
    fn test_file_config_used_without_recorded_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut installation =
            load_installation(&write(dir.path(), "i.yaml", INSTALLATION_YAML)).unwrap();
        installation.spec.runtime_config = None;
        let file = write(dir.path(), "keel.yaml", "dataDir: /srv/other\n");

        let config = runtime_config(&installation, Some(&file)).unwrap();
        assert_eq!(config.data_dir, Path::new("/srv/other"));
    }

    #[tokio::test]
    async fn test_airgap_upgrade_without_image_fails_before_touching_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let args = UpgradeArgs {
            installation: write(dir.path(), "i.yaml", INSTALLATION_YAML),
            local_artifact_mirror_image: None,
            kubeconfig: Some(dir.path().join("missing.conf")),
            max_attempts: 1,
        };

        let err = run(args, None, CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("local artifact mirror image is required"));
    }
}
