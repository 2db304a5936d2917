//! Cluster client that connects on first use.
//!
//! A fresh restore starts before the cluster exists: the kubeconfig is only
//! written once the host install step has run. The client is therefore built
//! lazily, and a failed connection is retried on the next call instead of
//! being remembered.

use std::path::PathBuf;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Secret};
use tokio::sync::OnceCell;
use tracing::debug;

use keel_common::crd::autopilot::Plan;
use keel_common::crd::installation::Installation;
use keel_common::crd::k0s::{Chart, ClusterConfig};
use keel_common::crd::velero::{Backup, Restore};
use keel_common::kube_utils::create_client;
use keel_common::{ClusterClient, KubeClusterClient, Result};

/// [`ClusterClient`] that reads its kubeconfig the first time it is used
pub struct LazyClusterClient {
    kubeconfig: Option<PathBuf>,
    inner: OnceCell<KubeClusterClient>,
}

impl LazyClusterClient {
    /// Connect through `kubeconfig`, or the inferred in-cluster config when `None`
    pub fn new(kubeconfig: Option<PathBuf>) -> Self {
        Self {
            kubeconfig,
            inner: OnceCell::new(),
        }
    }

    async fn get(&self) -> Result<&KubeClusterClient> {
        self.inner
            .get_or_try_init(|| async {
                let client = create_client(self.kubeconfig.as_deref()).await?;
                debug!(kubeconfig = ?self.kubeconfig, "connected to cluster");
                Ok::<_, keel_common::Error>(KubeClusterClient::new(client))
            })
            .await
    }
}

#[async_trait]
impl ClusterClient for LazyClusterClient {
    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        self.get().await?.ensure_namespace(name).await
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        self.get().await?.get_config_map(namespace, name).await
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        self.get().await?.create_config_map(config_map).await
    }

    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        self.get().await?.update_config_map(config_map).await
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        self.get().await?.delete_config_map(namespace, name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.get().await?.get_secret(namespace, name).await
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        self.get().await?.apply_secret(secret).await
    }

    async fn list_backups(&self, namespace: &str) -> Result<Vec<Backup>> {
        self.get().await?.list_backups(namespace).await
    }

    async fn get_restore(&self, namespace: &str, name: &str) -> Result<Option<Restore>> {
        self.get().await?.get_restore(namespace, name).await
    }

    async fn create_restore(&self, restore: &Restore) -> Result<()> {
        self.get().await?.create_restore(restore).await
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        self.get().await?.get_deployment(namespace, name).await
    }

    async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>> {
        self.get().await?.get_stateful_set(namespace, name).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.get().await?.list_nodes().await
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        self.get().await?.get_job(namespace, name).await
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        self.get().await?.create_job(job).await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.get().await?.delete_job(namespace, name).await
    }

    async fn list_installations(&self) -> Result<Vec<Installation>> {
        self.get().await?.list_installations().await
    }

    async fn get_installation(&self, name: &str) -> Result<Option<Installation>> {
        self.get().await?.get_installation(name).await
    }

    async fn create_installation(&self, installation: &Installation) -> Result<Installation> {
        self.get().await?.create_installation(installation).await
    }

    async fn update_installation(&self, installation: &Installation) -> Result<Installation> {
        self.get().await?.update_installation(installation).await
    }

    async fn update_installation_status(
        &self,
        installation: &Installation,
    ) -> Result<Installation> {
        self.get().await?.update_installation_status(installation).await
    }

    async fn get_plan(&self) -> Result<Option<Plan>> {
        self.get().await?.get_plan().await
    }

    async fn create_plan(&self, plan: &Plan) -> Result<()> {
        self.get().await?.create_plan(plan).await
    }

    async fn delete_plan(&self) -> Result<()> {
        self.get().await?.delete_plan().await
    }

    async fn get_cluster_config(&self, namespace: &str) -> Result<ClusterConfig> {
        self.get().await?.get_cluster_config(namespace).await
    }

    async fn update_cluster_config(&self, config: &ClusterConfig) -> Result<()> {
        self.get().await?.update_cluster_config(config).await
    }

    async fn list_charts(&self, namespace: &str) -> Result<Vec<Chart>> {
        self.get().await?.list_charts(namespace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_kubeconfig_fails_every_call_until_written() {
        let dir = tempfile::tempdir().unwrap();
        let client = LazyClusterClient::new(Some(dir.path().join("admin.conf")));

        assert!(client.list_nodes().await.is_err());
        assert!(client.list_installations().await.is_err());
        assert!(client.inner.get().is_none());
    }
}
