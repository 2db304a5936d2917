//! Host operations delegated to an external hook executable.
//!
//! Every [`HostOps`] call runs `<hook> [hook args] <operation> [operands]`.
//! The runtime configuration and backup store coordinates travel in the
//! environment so secrets never show up in the process list. The hook's
//! stdout and stdin stay attached to the terminal; stderr is captured and
//! reported when the hook fails.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use keel_common::{Error, Result, RuntimeConfig};
use keel_restore::{BackupStore, HostOps};

/// Exit code a hook uses to say the operator chose to stop
pub const STOP_EXIT_CODE: i32 = 3;

/// [`HostOps`] backed by an external executable
pub struct HookHostOps {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl HookHostOps {
    /// Run `program` with `args` placed before each operation name
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, config: &RuntimeConfig) -> Self {
        let mut env = vec![
            ("KEEL_DATA_DIR".to_string(), config.data_dir_str()),
            (
                "KEEL_ADMIN_CONSOLE_PORT".to_string(),
                config.admin_console_port.to_string(),
            ),
            (
                "KEEL_LOCAL_ARTIFACT_MIRROR_PORT".to_string(),
                config.local_artifact_mirror_port.to_string(),
            ),
            ("KEEL_AIRGAP".to_string(), config.airgap.to_string()),
            ("KEEL_POD_CIDR".to_string(), config.network.pod_cidr.clone()),
            (
                "KEEL_SERVICE_CIDR".to_string(),
                config.network.service_cidr.clone(),
            ),
        ];
        if let Some(iface) = &config.network.network_interface {
            env.push(("KEEL_NETWORK_INTERFACE".to_string(), iface.clone()));
        }
        Self {
            program: program.into(),
            args,
            env,
        }
    }

    async fn run(
        &self,
        operation: &str,
        operands: &[&str],
        store: Option<&BackupStore>,
    ) -> Result<()> {
        debug!(hook = %self.program.display(), operation, "running host hook");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(operation)
            .args(operands)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped());
        if let Some(store) = store {
            cmd.envs(store_env(store));
        }

        let output = cmd.output().await.map_err(|e| {
            Error::failed(
                "host hook",
                format!("failed to run {} {}: {}", self.program.display(), operation, e),
            )
        })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.code() == Some(STOP_EXIT_CODE) {
            info!(operation, "Host hook stopped the restore");
            return Err(Error::stopped(format!("{} stopped: {}", operation, stderr)));
        }
        Err(Error::failed(
            "host hook",
            format!("{} failed ({}): {}", operation, output.status, stderr),
        ))
    }
}

fn store_env(store: &BackupStore) -> [(&'static str, &str); 6] {
    [
        ("KEEL_S3_ENDPOINT", store.endpoint.as_str()),
        ("KEEL_S3_REGION", store.region.as_str()),
        ("KEEL_S3_BUCKET", store.bucket.as_str()),
        ("KEEL_S3_PREFIX", store.prefix.as_str()),
        ("KEEL_S3_ACCESS_KEY_ID", store.access_key_id.as_str()),
        ("KEEL_S3_SECRET_ACCESS_KEY", store.secret_access_key.as_str()),
    ]
}

#[async_trait]
impl HostOps for HookHostOps {
    async fn verify_no_installation(&self) -> Result<()> {
        self.run("verify-no-installation", &[], None).await
    }

    async fn validate_backup_store(&self, store: &BackupStore) -> Result<()> {
        self.run("validate-backup-store", &[], Some(store)).await
    }

    async fn configure_network_manager(&self) -> Result<()> {
        self.run("configure-network-manager", &[], None).await
    }

    async fn materialize_binaries(&self) -> Result<()> {
        self.run("materialize-binaries", &[], None).await
    }

    async fn run_host_preflights(&self) -> Result<()> {
        self.run("run-host-preflights", &[], None).await
    }

    async fn install_cluster(&self) -> Result<()> {
        self.run("install-cluster", &[], None).await
    }

    async fn configure_backup_store(&self, store: &BackupStore) -> Result<()> {
        self.run("configure-backup-store", &[], Some(store)).await
    }

    async fn refresh_local_artifact_mirror(&self, port: u16) -> Result<()> {
        let port = port.to_string();
        self.run("refresh-local-artifact-mirror", &[&port], None).await
    }

    async fn install_manager(&self) -> Result<()> {
        self.run("install-manager", &[], None).await
    }

    async fn add_insecure_registry(&self, address: &str) -> Result<()> {
        self.run("add-insecure-registry", &[address], None).await
    }

    async fn install_extensions(&self) -> Result<()> {
        self.run("install-extensions", &[], None).await
    }
}
