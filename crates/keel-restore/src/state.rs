//! Restore states and the persisted record that makes a restore resumable.
//!
//! The record is a ConfigMap holding the last state the orchestrator entered
//! and the backup it chose. Reads never fail: anything missing or
//! unrecognised means "start from the beginning".

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::ObjectMeta;
use tracing::{debug, warn};

use keel_common::{ClusterClient, Result};

/// Name of the ConfigMap persisting restore progress
pub const RESTORE_STATE_CONFIG_MAP: &str = "embedded-cluster-restore-state";
/// Data key holding the state tag
pub const STATE_KEY: &str = "state";
/// Data key holding the selected backup name
pub const BACKUP_NAME_KEY: &str = "backup-name";

/// Restore workflow states, in execution order
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RestoreState {
    /// Host preparation
    #[default]
    New,
    /// Backup selection and confirmation
    ConfirmBackup,
    /// Cluster-state component restore
    RestoreClusterState,
    /// Admin console restore
    RestoreConsole,
    /// Operator adds the remaining nodes
    WaitForNodes,
    /// Object store restore (airgap HA only)
    RestoreObjectStore,
    /// Registry restore (airgap only)
    RestoreRegistry,
    /// Operator restore
    RestoreOperator,
    /// Vendor extensions install
    RestoreExtensions,
    /// Application restore
    RestoreApplication,
}

impl RestoreState {
    /// Every state in execution order
    pub const ALL: [RestoreState; 10] = [
        RestoreState::New,
        RestoreState::ConfirmBackup,
        RestoreState::RestoreClusterState,
        RestoreState::RestoreConsole,
        RestoreState::WaitForNodes,
        RestoreState::RestoreObjectStore,
        RestoreState::RestoreRegistry,
        RestoreState::RestoreOperator,
        RestoreState::RestoreExtensions,
        RestoreState::RestoreApplication,
    ];

    /// Tag stored in the persisted record
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::ConfirmBackup => "confirm-backup",
            Self::RestoreClusterState => "restore-ec-install",
            Self::RestoreConsole => "restore-admin-console",
            Self::WaitForNodes => "wait-for-nodes",
            Self::RestoreObjectStore => "restore-seaweedfs",
            Self::RestoreRegistry => "restore-registry",
            Self::RestoreOperator => "restore-embedded-cluster-operator",
            Self::RestoreExtensions => "restore-extensions",
            Self::RestoreApplication => "restore-app",
        }
    }

    /// Parse a persisted tag, `None` when unrecognised
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == tag)
    }

    /// Position in [`RestoreState::ALL`]
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// States from this one through the terminal state
    pub fn remaining(&self) -> &'static [RestoreState] {
        &Self::ALL[self.index()..]
    }

    /// Whether a backup must already be selected to run this state
    pub fn requires_backup(&self) -> bool {
        *self >= RestoreState::RestoreClusterState
    }
}

impl std::fmt::Display for RestoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted restore progress
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistedState {
    /// Last state entered
    pub state: RestoreState,
    /// Selected backup, empty until chosen
    pub backup_name: String,
}

/// Reads and writes the restore progress record
pub struct StateStore {
    client: Arc<dyn ClusterClient>,
    namespace: String,
}

impl StateStore {
    /// Create a store writing into `namespace`
    pub fn new(client: Arc<dyn ClusterClient>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Load progress, falling back to `New` on any problem
    pub async fn load(&self) -> PersistedState {
        let cm = match self
            .client
            .get_config_map(&self.namespace, RESTORE_STATE_CONFIG_MAP)
            .await
        {
            Ok(Some(cm)) => cm,
            Ok(None) => return PersistedState::default(),
            Err(e) => {
                warn!(error = %e, "unable to read restore state, starting from the beginning");
                return PersistedState::default();
            }
        };

        let data = cm.data.unwrap_or_default();
        let tag = data.get(STATE_KEY).map(String::as_str).unwrap_or_default();
        match RestoreState::from_tag(tag) {
            Some(state) => PersistedState {
                state,
                backup_name: data.get(BACKUP_NAME_KEY).cloned().unwrap_or_default(),
            },
            None => {
                warn!(state = %tag, "unrecognised restore state, starting from the beginning");
                PersistedState::default()
            }
        }
    }

    /// Record that `state` was entered. A blank `backup_name` keeps the
    /// previously stored one.
    pub async fn save(&self, state: RestoreState, backup_name: &str) -> Result<()> {
        self.client.ensure_namespace(&self.namespace).await?;

        let mut data = BTreeMap::new();
        data.insert(STATE_KEY.to_string(), state.as_str().to_string());
        if !backup_name.is_empty() {
            data.insert(BACKUP_NAME_KEY.to_string(), backup_name.to_string());
        }

        let existing = self
            .client
            .get_config_map(&self.namespace, RESTORE_STATE_CONFIG_MAP)
            .await?;

        match existing {
            None => {
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(RESTORE_STATE_CONFIG_MAP.to_string()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    data: Some(data.clone()),
                    ..Default::default()
                };
                match self.client.create_config_map(&cm).await {
                    Ok(()) => {}
                    Err(e) if e.is_already_exists() => {
                        let current = self
                            .client
                            .get_config_map(&self.namespace, RESTORE_STATE_CONFIG_MAP)
                            .await?
                            .unwrap_or(cm);
                        self.update(current, data).await?;
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(cm) => self.update(cm, data).await?,
        }

        debug!(state = %state, backup = %backup_name, "restore state saved");
        Ok(())
    }

    async fn update(&self, mut cm: ConfigMap, data: BTreeMap<String, String>) -> Result<()> {
        let merged = cm.data.get_or_insert_with(BTreeMap::new);
        merged.extend(data);
        self.client.update_config_map(&cm).await
    }

    /// Delete the record, tolerating its absence
    pub async fn reset(&self) -> Result<()> {
        match self
            .client
            .delete_config_map(&self.namespace, RESTORE_STATE_CONFIG_MAP)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_common::{Error, MockClusterClient};

    fn record(state: &str, backup: Option<&str>) -> ConfigMap {
        let mut data = BTreeMap::new();
        data.insert(STATE_KEY.to_string(), state.to_string());
        if let Some(b) = backup {
            data.insert(BACKUP_NAME_KEY.to_string(), b.to_string());
        }
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(RESTORE_STATE_CONFIG_MAP.to_string()),
                namespace: Some("embedded-cluster".to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    fn store(mock: MockClusterClient) -> StateStore {
        StateStore::new(Arc::new(mock), "embedded-cluster")
    }

    #[test]
    fn test_states_are_totally_ordered() {
        for (i, state) in RestoreState::ALL.iter().enumerate() {
            assert_eq!(state.index(), i);
            assert_eq!(RestoreState::from_tag(state.as_str()), Some(*state));
        }
        assert!(RestoreState::New < RestoreState::RestoreApplication);
        assert_eq!(RestoreState::RestoreApplication.remaining().len(), 1);
        assert_eq!(RestoreState::New.remaining().len(), 10);
        assert!(!RestoreState::ConfirmBackup.requires_backup());
        assert!(RestoreState::RestoreClusterState.requires_backup());
        assert_eq!(RestoreState::from_tag("restore-everything"), None);
    }

    #[tokio::test]
    async fn test_load_absent_record_is_new() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_config_map().returning(|_, _| Ok(None));
        assert_eq!(store(mock).load().await, PersistedState::default());
    }

    #[tokio::test]
    async fn test_load_read_error_is_new() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_config_map()
            .returning(|_, _| Err(Error::internal("connection refused")));
        assert_eq!(store(mock).load().await.state, RestoreState::New);
    }

    #[tokio::test]
    async fn test_load_unrecognised_tag_is_new() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_config_map()
            .returning(|_, _| Ok(Some(record("restore-everything", Some("b1")))));
        assert_eq!(store(mock).load().await, PersistedState::default());
    }

    #[tokio::test]
    async fn test_load_known_state() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_config_map()
            .withf(|ns, name| ns == "embedded-cluster" && name == RESTORE_STATE_CONFIG_MAP)
            .returning(|_, _| Ok(Some(record("restore-admin-console", Some("b1")))));
        let loaded = store(mock).load().await;
        assert_eq!(loaded.state, RestoreState::RestoreConsole);
        assert_eq!(loaded.backup_name, "b1");
    }

    #[tokio::test]
    async fn test_save_creates_when_absent() {
        let mut mock = MockClusterClient::new();
        mock.expect_ensure_namespace()
            .withf(|ns| ns == "embedded-cluster")
            .returning(|_| Ok(()));
        mock.expect_get_config_map().returning(|_, _| Ok(None));
        mock.expect_create_config_map()
            .withf(|cm| {
                let data = cm.data.as_ref().unwrap();
                data.get(STATE_KEY).map(String::as_str) == Some("confirm-backup")
                    && !data.contains_key(BACKUP_NAME_KEY)
            })
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_update_config_map().never();

        store(mock)
            .save(RestoreState::ConfirmBackup, "")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_save_blank_backup_keeps_previous() {
        let mut mock = MockClusterClient::new();
        mock.expect_ensure_namespace().returning(|_| Ok(()));
        mock.expect_get_config_map()
            .returning(|_, _| Ok(Some(record("restore-ec-install", Some("b1")))));
        mock.expect_update_config_map()
            .withf(|cm| {
                let data = cm.data.as_ref().unwrap();
                data.get(STATE_KEY).map(String::as_str) == Some("restore-admin-console")
                    && data.get(BACKUP_NAME_KEY).map(String::as_str) == Some("b1")
            })
            .times(1)
            .returning(|_| Ok(()));

        store(mock)
            .save(RestoreState::RestoreConsole, "")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_save_falls_back_to_update_on_create_race() {
        let mut mock = MockClusterClient::new();
        mock.expect_ensure_namespace().returning(|_| Ok(()));
        let mut seq = mockall::Sequence::new();
        mock.expect_get_config_map()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        mock.expect_get_config_map()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Some(record("confirm-backup", None))));
        mock.expect_create_config_map().returning(|_| {
            Err(Error::AlreadyExists {
                kind: "ConfigMap".to_string(),
                name: RESTORE_STATE_CONFIG_MAP.to_string(),
            })
        });
        mock.expect_update_config_map()
            .withf(|cm| {
                cm.data.as_ref().unwrap().get(BACKUP_NAME_KEY).map(String::as_str) == Some("b2")
            })
            .times(1)
            .returning(|_| Ok(()));

        store(mock)
            .save(RestoreState::RestoreClusterState, "b2")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reset_tolerates_not_found() {
        let mut mock = MockClusterClient::new();
        mock.expect_delete_config_map().returning(|_, _| {
            Err(Error::NotFound {
                kind: "ConfigMap".to_string(),
                name: RESTORE_STATE_CONFIG_MAP.to_string(),
            })
        });
        assert!(store(mock).reset().await.is_ok());

        let mut mock = MockClusterClient::new();
        mock.expect_delete_config_map()
            .returning(|_, _| Err(Error::internal("boom")));
        assert!(store(mock).reset().await.is_err());
    }
}
