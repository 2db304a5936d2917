//! `keel restore`: rebuild a cluster from a disaster-recovery backup

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use ipnet::IpNet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use keel_common::{ReleaseInfo, RuntimeConfig};
use keel_restore::{
    runtime_config_from_installation, BackupStore, ClusterRestoreSteps, RestoreOptions,
    RestoreOrchestrator, RestoreState, StateStore,
};

use super::{load_config, StdoutProgress};
use crate::client::LazyClusterClient;
use crate::hooks::HookHostOps;
use crate::prompt::TerminalPrompt;
use crate::Result;

/// Network split into pod and service halves when no CIDR is configured
pub const DEFAULT_CIDR: &str = "10.244.0.0/16";

/// Restore a cluster from a backup
#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Release description shipped with the binary
    #[arg(long, env = "KEEL_RELEASE")]
    pub release: PathBuf,

    /// Data directory on this host
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Restore without external network access
    #[arg(long)]
    pub airgap: bool,

    /// Network split evenly into the pod and service CIDRs
    #[arg(long, conflicts_with_all = ["pod_cidr", "service_cidr"])]
    pub cidr: Option<String>,

    /// Pod CIDR
    #[arg(long)]
    pub pod_cidr: Option<String>,

    /// Service CIDR
    #[arg(long)]
    pub service_cidr: Option<String>,

    /// Host interface used to reach the admin console
    #[arg(long)]
    pub network_interface: Option<String>,

    /// Admin console node port
    #[arg(long)]
    pub admin_console_port: Option<u16>,

    /// Local artifact mirror port; defaults to the port recorded in the backup
    #[arg(long)]
    pub local_artifact_mirror_port: Option<u16>,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Skip checking that the backup store is reachable
    #[arg(long)]
    pub skip_store_validation: bool,

    /// Executable performing host operations (install, preflights, mirror)
    #[arg(long, env = "KEEL_HOST_HOOK")]
    pub host_hook: PathBuf,

    /// Argument placed before the operation name on every hook call
    #[arg(long = "host-hook-arg")]
    pub host_hook_args: Vec<String>,
}

/// S3 coordinates of the backup store; missing values are prompted for
#[derive(Args, Debug, Default)]
pub struct StoreArgs {
    /// S3 endpoint URL
    #[arg(long, env = "KEEL_S3_ENDPOINT", default_value = "")]
    pub s3_endpoint: String,

    /// S3 region
    #[arg(long, env = "KEEL_S3_REGION", default_value = "")]
    pub s3_region: String,

    /// S3 bucket
    #[arg(long, env = "KEEL_S3_BUCKET", default_value = "")]
    pub s3_bucket: String,

    /// Key prefix inside the bucket
    #[arg(long, env = "KEEL_S3_PREFIX", default_value = "")]
    pub s3_prefix: String,

    /// Access key ID
    #[arg(long, env = "KEEL_S3_ACCESS_KEY_ID", default_value = "")]
    pub s3_access_key_id: String,

    /// Secret access key
    #[arg(
        long,
        env = "KEEL_S3_SECRET_ACCESS_KEY",
        default_value = "",
        hide_env_values = true
    )]
    pub s3_secret_access_key: String,
}

impl From<StoreArgs> for BackupStore {
    fn from(args: StoreArgs) -> Self {
        BackupStore {
            endpoint: args.s3_endpoint,
            region: args.s3_region,
            bucket: args.s3_bucket,
            prefix: args.s3_prefix,
            access_key_id: args.s3_access_key_id,
            secret_access_key: args.s3_secret_access_key,
        }
    }
}

impl RestoreArgs {
    /// Overlay the flags on `config`
    pub fn apply(&self, config: &mut RuntimeConfig) -> Result<()> {
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if self.airgap {
            config.airgap = true;
        }
        if let Some(port) = self.admin_console_port {
            config.admin_console_port = port;
        }
        if let Some(port) = self.local_artifact_mirror_port {
            config.local_artifact_mirror_port = port;
        }
        if let Some(iface) = &self.network_interface {
            config.network.network_interface = Some(iface.clone());
        }

        if let Some(cidr) = &self.cidr {
            let (pod, service) = split_cidr(cidr)?;
            config.network.pod_cidr = pod;
            config.network.service_cidr = service;
        }
        if let Some(pod) = &self.pod_cidr {
            config.network.pod_cidr = pod.clone();
        }
        if let Some(service) = &self.service_cidr {
            config.network.service_cidr = service.clone();
        }
        let (default_pod, default_service) = split_cidr(DEFAULT_CIDR)?;
        if config.network.pod_cidr.is_empty() {
            config.network.pod_cidr = default_pod;
        }
        if config.network.service_cidr.is_empty() {
            config.network.service_cidr = default_service;
        }
        Ok(())
    }
}

/// Split `cidr` into its lower and upper halves (pod, service)
pub fn split_cidr(cidr: &str) -> Result<(String, String)> {
    let invalid = |msg: String| keel_common::Error::validation_for_field("--cidr", msg);

    let net: IpNet = cidr
        .parse()
        .map_err(|e| invalid(format!("invalid CIDR {:?}: {}", cidr, e)))?;
    let mut halves = net
        .subnets(net.prefix_len() + 1)
        .map_err(|_| invalid(format!("CIDR {} is too small to split", cidr)))?;
    match (halves.next(), halves.next()) {
        (Some(pod), Some(service)) => Ok((pod.to_string(), service.to_string())),
        _ => Err(invalid(format!("CIDR {} is too small to split", cidr)).into()),
    }
}

/// Run the restore, resuming a previous one when the operator agrees
pub async fn run(
    args: RestoreArgs,
    config_path: Option<&Path>,
    cancel: CancellationToken,
) -> Result<()> {
    let release = ReleaseInfo::load(&args.release)?;
    let mut config = load_config(config_path)?;
    args.apply(&mut config)?;

    let client = Arc::new(LazyClusterClient::new(Some(config.kubeconfig_path())));
    let store = StateStore::new(client.clone(), config.namespaces.embedded_cluster.clone());

    if store.load().await.state != RestoreState::New {
        if let Some(recorded) = runtime_config_from_installation(client.as_ref()).await {
            info!("Using the runtime configuration recorded on the installation");
            config = RuntimeConfig {
                kubeconfig: config.kubeconfig.clone(),
                ..recorded
            };
        }
    }

    let host = HookHostOps::new(&args.host_hook, args.host_hook_args.clone(), &config);
    let prompt = TerminalPrompt::stdio();
    let options = RestoreOptions {
        backup_store: args.store.into(),
        skip_store_validation: args.skip_store_validation,
        local_artifact_mirror_port: args.local_artifact_mirror_port,
    };
    let steps = ClusterRestoreSteps::new(
        client.as_ref(),
        &config,
        &release,
        &host,
        &prompt,
        &StdoutProgress,
        &cancel,
        options,
    );

    RestoreOrchestrator::new(store, &steps, &prompt).execute().await?;
    Ok(())
}
