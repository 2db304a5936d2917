//! Custom resource types
//!
//! `installation` is the CRD owned by this project; the other modules are
//! typed views of resources owned by Velero and k0s.

pub mod autopilot;
pub mod installation;
pub mod k0s;
pub mod velero;

pub use autopilot::{Plan, PlanPhase};
pub use installation::{Installation, InstallationSpec, InstallationState, InstallationStatus};
pub use k0s::{Chart, ChartSpec, ClusterConfig, HelmExtensions};
pub use velero::{Backup, BackupPhase, Restore, RestorePhase, RestoreSpec};
