//! Resumable restore orchestration
//!
//! The workflow is the ordered list [`RestoreState::ALL`]. The executor starts
//! at the persisted state and runs every state from there to the end, saving
//! each state before its step runs. A crash or a failed step therefore leaves
//! the record at the step that has to be retried, and a later invocation
//! re-enters exactly there.

use tracing::{debug, info};

use keel_common::crd::installation;
use keel_common::{ClusterClient, Error, Result, RuntimeConfig};

use crate::backup::ReplicatedBackup;
use crate::host::Prompt;
use crate::state::{RestoreState, StateStore};
use crate::steps::RestoreSteps;

const RESUME_QUESTION: &str = "A previous restore operation was detected. Would you like to resume?";

/// Drives the restore steps from the persisted state to completion
pub struct RestoreOrchestrator<'a> {
    store: StateStore,
    steps: &'a dyn RestoreSteps,
    prompt: &'a dyn Prompt,
}

impl<'a> RestoreOrchestrator<'a> {
    /// Create an orchestrator persisting progress through `store`
    pub fn new(store: StateStore, steps: &'a dyn RestoreSteps, prompt: &'a dyn Prompt) -> Self {
        Self {
            store,
            steps,
            prompt,
        }
    }

    /// Run the restore, resuming a previous invocation when the operator
    /// agrees.
    ///
    /// Returns [`Error::Stopped`] when the operator declines the selected
    /// backup.
    pub async fn execute(&self) -> Result<()> {
        let persisted = self.store.load().await;
        let mut start = persisted.state;
        let mut backup = None;

        if start != RestoreState::New {
            debug!(state = %start, backup = %persisted.backup_name, "found previous restore");
            if self.prompt.confirm(RESUME_QUESTION, true)? {
                if !persisted.backup_name.is_empty() {
                    backup = Some(self.steps.resume_backup(&persisted.backup_name).await?);
                }
            } else {
                self.store.reset().await?;
                start = RestoreState::New;
            }
        }

        if start.requires_backup() && backup.is_none() {
            return Err(Error::internal_with_context(
                "restore",
                format!("no backup recorded for restore state {}", start),
            ));
        }

        self.run(start, backup).await
    }

    /// Execute every state from `start` through the terminal state
    async fn run(&self, start: RestoreState, mut backup: Option<ReplicatedBackup>) -> Result<()> {
        for &state in start.remaining() {
            if state != RestoreState::New {
                let name = backup.as_ref().map(ReplicatedBackup::name).unwrap_or_default();
                self.store.save(state, name).await?;
            }
            debug!(state = %state, "entering restore state");

            match state {
                RestoreState::New => self.steps.prepare_host().await?,
                RestoreState::ConfirmBackup => match self.steps.confirm_backup().await? {
                    Some(chosen) => backup = Some(chosen),
                    None => return Err(Error::stopped("restore aborted by operator")),
                },
                RestoreState::RestoreClusterState => {
                    self.steps.restore_cluster_state(selected(&backup, state)?).await?
                }
                RestoreState::RestoreConsole => {
                    self.steps.restore_console(selected(&backup, state)?).await?
                }
                RestoreState::WaitForNodes => {
                    self.steps.wait_for_nodes(selected(&backup, state)?).await?
                }
                RestoreState::RestoreObjectStore => {
                    self.steps.restore_object_store(selected(&backup, state)?).await?
                }
                RestoreState::RestoreRegistry => {
                    self.steps.restore_registry(selected(&backup, state)?).await?
                }
                RestoreState::RestoreOperator => {
                    self.steps.restore_operator(selected(&backup, state)?).await?
                }
                RestoreState::RestoreExtensions => self.steps.restore_extensions().await?,
                RestoreState::RestoreApplication => {
                    self.steps.restore_application(selected(&backup, state)?).await?
                }
            }
        }

        self.store.reset().await?;
        info!("Restore complete");
        Ok(())
    }
}

fn selected(backup: &Option<ReplicatedBackup>, state: RestoreState) -> Result<&ReplicatedBackup> {
    backup.as_ref().ok_or_else(|| {
        Error::internal_with_context("restore", format!("no backup selected before {}", state))
    })
}

/// Runtime configuration recorded on the latest Installation, used to resume
/// with the values the cluster was actually installed with
pub async fn runtime_config_from_installation(client: &dyn ClusterClient) -> Option<RuntimeConfig> {
    match client.list_installations().await {
        Ok(items) => installation::latest(&items).and_then(|i| i.spec.runtime_config.clone()),
        Err(e) => {
            debug!(error = %e, "no installation to read runtime config from");
            None
        }
    }
}
