//! Upgrade orchestration for keel
//!
//! - **metadata**: per-version release metadata published into the cluster
//! - **substrate**: k0s version upgrade through the autopilot plan
//! - **charts**: Helm chart generation, drift and completion checks
//! - **artifacts**: airgap artifact jobs and the image load plan
//! - **installation**: Installation record lock, unlock and coalescing
//! - **orchestrator**: [`Upgrader`], composing the above

#![deny(missing_docs)]

pub mod artifacts;
pub mod charts;
pub mod installation;
pub mod metadata;
pub mod orchestrator;
pub mod substrate;

pub use installation::needs_upgrade;
pub use orchestrator::{UpgradeBackoffs, UpgradeOptions, Upgrader};

/// Identity of the upgrade run for an installation, used in logs
pub fn upgrade_job_name(installation: &str) -> String {
    format!("embedded-cluster-upgrade-{}", installation)
}
