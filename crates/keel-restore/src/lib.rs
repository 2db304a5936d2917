//! Restore-from-backup orchestration for keel
//!
//! - **state**: the persisted restore progress record
//! - **backup**: replicated backups and their typed annotation facts
//! - **validate**: compatibility checks between a backup and the running binary
//! - **component**: per-component Velero restores and workload readiness
//! - **host**: host-side collaborators (cluster install, prompts, backup store)
//! - **steps**: the action run for each restore state
//! - **orchestrator**: the resumable executor over the ordered states

#![deny(missing_docs)]

pub mod backup;
pub mod component;
pub mod host;
pub mod orchestrator;
pub mod state;
pub mod steps;
pub mod validate;

pub use backup::{BackupFacts, ReplicatedBackup};
pub use component::{ComponentRestorer, DrComponent};
pub use host::{BackupStore, HostOps, Prompt};
pub use orchestrator::{runtime_config_from_installation, RestoreOrchestrator};
pub use state::{RestoreState, StateStore};
pub use steps::{ClusterRestoreSteps, RestoreOptions, RestoreSteps};
pub use validate::{filter_restorable, RestoreTarget};

#[cfg(any(test, feature = "mock"))]
pub use host::{MockHostOps, MockPrompt};
#[cfg(any(test, feature = "mock"))]
pub use steps::MockRestoreSteps;
