//! Cluster API access
//!
//! Both orchestrators talk to the cluster only through [`ClusterClient`].
//! The trait is mocked in tests; [`KubeClusterClient`] is the kube-rs
//! implementation. Creation errors with 409 surface as
//! [`Error::AlreadyExists`] and update errors with 409 as [`Error::Conflict`],
//! so callers can tell a duplicate create from a stale write.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde::de::DeserializeOwned;

use crate::crd::autopilot::{Plan, PLAN_NAME};
use crate::crd::installation::Installation;
use crate::crd::k0s::{Chart, ClusterConfig, CLUSTER_CONFIG_NAME};
use crate::crd::velero::{Backup, Restore};
use crate::kube_utils::{from_dynamic, to_dynamic, HasApiResource};
use crate::{Error, Result};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "keel";

/// Trait abstracting the cluster operations used by the lifecycle core
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Ensure a namespace exists, creating it if it doesn't
    async fn ensure_namespace(&self, name: &str) -> Result<()>;

    /// Get a ConfigMap, `None` if absent
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Create a ConfigMap; fails with `AlreadyExists` on duplicates
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    /// Replace a ConfigMap
    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    /// Delete a ConfigMap; fails with `NotFound` when absent
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;

    /// Get a Secret, `None` if absent
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create or update a Secret with server-side apply
    async fn apply_secret(&self, secret: &Secret) -> Result<()>;

    /// List Velero backups in a namespace
    async fn list_backups(&self, namespace: &str) -> Result<Vec<Backup>>;

    /// Get a Velero restore, `None` if absent
    async fn get_restore(&self, namespace: &str, name: &str) -> Result<Option<Restore>>;

    /// Create a Velero restore; fails with `AlreadyExists` on duplicates
    async fn create_restore(&self, restore: &Restore) -> Result<()>;

    /// Get a Deployment, `None` if absent
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Get a StatefulSet, `None` if absent
    async fn get_stateful_set(&self, namespace: &str, name: &str)
        -> Result<Option<StatefulSet>>;

    /// List every node
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Get a Job, `None` if absent
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    /// Create a Job; fails with `AlreadyExists` on duplicates
    async fn create_job(&self, job: &Job) -> Result<()>;

    /// Delete a Job and its pods; fails with `NotFound` when absent
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    /// List every Installation
    async fn list_installations(&self) -> Result<Vec<Installation>>;

    /// Get an Installation, `None` if absent
    async fn get_installation(&self, name: &str) -> Result<Option<Installation>>;

    /// Create an Installation; fails with `AlreadyExists` on duplicates
    async fn create_installation(&self, installation: &Installation) -> Result<Installation>;

    /// Replace an Installation's spec; fails with `Conflict` when stale
    async fn update_installation(&self, installation: &Installation) -> Result<Installation>;

    /// Replace an Installation's status; fails with `Conflict` when stale
    async fn update_installation_status(&self, installation: &Installation)
        -> Result<Installation>;

    /// Get the autopilot plan, `None` if absent
    async fn get_plan(&self) -> Result<Option<Plan>>;

    /// Create the autopilot plan; fails with `AlreadyExists` on duplicates
    async fn create_plan(&self, plan: &Plan) -> Result<()>;

    /// Delete the autopilot plan; fails with `NotFound` when absent
    async fn delete_plan(&self) -> Result<()>;

    /// Get the k0s cluster config
    async fn get_cluster_config(&self, namespace: &str) -> Result<ClusterConfig>;

    /// Replace the k0s cluster config; fails with `Conflict` when stale
    async fn update_cluster_config(&self, config: &ClusterConfig) -> Result<()>;

    /// List installed chart objects
    async fn list_charts(&self, namespace: &str) -> Result<Vec<Chart>>;
}

/// Real Kubernetes client implementation
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic<T: HasApiResource>(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = T::api_resource();
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn object_name(meta: &kube::core::ObjectMeta) -> Result<&str> {
    meta.name
        .as_deref()
        .ok_or_else(|| Error::validation("object has no name"))
}

fn object_namespace(meta: &kube::core::ObjectMeta) -> Result<&str> {
    meta.namespace
        .as_deref()
        .ok_or_else(|| Error::validation("object has no namespace"))
}

async fn get_opt<K>(api: &Api<K>, kind: &str, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    api.get_opt(name)
        .await
        .map_err(|e| Error::from_kube(kind, name, e))
}

async fn get_typed<T>(api: &Api<DynamicObject>, name: &str) -> Result<Option<T>>
where
    T: DeserializeOwned + HasApiResource,
{
    match get_opt(api, T::KIND, name).await? {
        Some(obj) => Ok(Some(from_dynamic(obj)?)),
        None => Ok(None),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: kube::core::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(Error::from_kube("Namespace", name, e)),
        }
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        get_opt(&api, "ConfigMap", name).await
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let name = object_name(&config_map.metadata)?;
        let api: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), object_namespace(&config_map.metadata)?);
        api.create(&PostParams::default(), config_map)
            .await
            .map_err(|e| Error::from_kube("ConfigMap", name, e))?;
        Ok(())
    }

    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let name = object_name(&config_map.metadata)?;
        let api: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), object_namespace(&config_map.metadata)?);
        api.replace(name, &PostParams::default(), config_map)
            .await
            .map_err(|e| Error::from_kube("ConfigMap", name, e))?;
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube("ConfigMap", name, e))?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        get_opt(&api, "Secret", name).await
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        let name = object_name(&secret.metadata)?;
        let api: Api<Secret> =
            Api::namespaced(self.client.clone(), object_namespace(&secret.metadata)?);
        let mut body = secret.clone();
        body.metadata.resource_version = None;
        body.metadata.uid = None;
        let value = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": body.metadata,
            "type": body.type_,
            "data": body.data,
        });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&value),
        )
        .await
        .map_err(|e| Error::from_kube("Secret", name, e))?;
        Ok(())
    }

    async fn list_backups(&self, namespace: &str) -> Result<Vec<Backup>> {
        let api = self.dynamic::<Backup>(Some(namespace));
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube("Backup", namespace, e))?;
        list.items.into_iter().map(from_dynamic).collect()
    }

    async fn get_restore(&self, namespace: &str, name: &str) -> Result<Option<Restore>> {
        let api = self.dynamic::<Restore>(Some(namespace));
        get_typed(&api, name).await
    }

    async fn create_restore(&self, restore: &Restore) -> Result<()> {
        let name = object_name(&restore.metadata)?;
        let api = self.dynamic::<Restore>(Some(object_namespace(&restore.metadata)?));
        api.create(&PostParams::default(), &to_dynamic(restore)?)
            .await
            .map_err(|e| Error::from_kube(Restore::KIND, name, e))?;
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        get_opt(&api, "Deployment", name).await
    }

    async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        get_opt(&api, "StatefulSet", name).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        get_opt(&api, "Job", name).await
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        let name = object_name(&job.metadata)?;
        let api: Api<Job> = Api::namespaced(self.client.clone(), object_namespace(&job.metadata)?);
        api.create(&PostParams::default(), job)
            .await
            .map_err(|e| Error::from_kube("Job", name, e))?;
        Ok(())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::background())
            .await
            .map_err(|e| Error::from_kube("Job", name, e))?;
        Ok(())
    }

    async fn list_installations(&self) -> Result<Vec<Installation>> {
        let api: Api<Installation> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_installation(&self, name: &str) -> Result<Option<Installation>> {
        let api: Api<Installation> = Api::all(self.client.clone());
        get_opt(&api, "Installation", name).await
    }

    async fn create_installation(&self, installation: &Installation) -> Result<Installation> {
        let name = object_name(&installation.metadata)?;
        let api: Api<Installation> = Api::all(self.client.clone());
        api.create(&PostParams::default(), installation)
            .await
            .map_err(|e| Error::from_kube("Installation", name, e))
    }

    async fn update_installation(&self, installation: &Installation) -> Result<Installation> {
        let name = object_name(&installation.metadata)?;
        let api: Api<Installation> = Api::all(self.client.clone());
        api.replace(name, &PostParams::default(), installation)
            .await
            .map_err(|e| Error::from_kube("Installation", name, e))
    }

    async fn update_installation_status(
        &self,
        installation: &Installation,
    ) -> Result<Installation> {
        let name = object_name(&installation.metadata)?;
        let api: Api<Installation> = Api::all(self.client.clone());
        let data = serde_json::to_vec(installation)
            .map_err(|e| Error::serialization_for_kind("Installation", e.to_string()))?;
        api.replace_status(name, &PostParams::default(), data)
            .await
            .map_err(|e| Error::from_kube("Installation", name, e))
    }

    async fn get_plan(&self) -> Result<Option<Plan>> {
        let api = self.dynamic::<Plan>(None);
        get_typed(&api, PLAN_NAME).await
    }

    async fn create_plan(&self, plan: &Plan) -> Result<()> {
        let api = self.dynamic::<Plan>(None);
        api.create(&PostParams::default(), &to_dynamic(plan)?)
            .await
            .map_err(|e| Error::from_kube(Plan::KIND, PLAN_NAME, e))?;
        Ok(())
    }

    async fn delete_plan(&self) -> Result<()> {
        let api = self.dynamic::<Plan>(None);
        api.delete(PLAN_NAME, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube(Plan::KIND, PLAN_NAME, e))?;
        Ok(())
    }

    async fn get_cluster_config(&self, namespace: &str) -> Result<ClusterConfig> {
        let api = self.dynamic::<ClusterConfig>(Some(namespace));
        get_typed(&api, CLUSTER_CONFIG_NAME)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: ClusterConfig::KIND.to_string(),
                name: format!("{}/{}", namespace, CLUSTER_CONFIG_NAME),
            })
    }

    async fn update_cluster_config(&self, config: &ClusterConfig) -> Result<()> {
        let name = object_name(&config.metadata)?;
        let api = self.dynamic::<ClusterConfig>(Some(object_namespace(&config.metadata)?));
        api.replace(name, &PostParams::default(), &to_dynamic(config)?)
            .await
            .map_err(|e| Error::from_kube(ClusterConfig::KIND, name, e))?;
        Ok(())
    }

    async fn list_charts(&self, namespace: &str) -> Result<Vec<Chart>> {
        let api = self.dynamic::<Chart>(Some(namespace));
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube(Chart::KIND, namespace, e))?;
        list.items.into_iter().map(from_dynamic).collect()
    }
}
