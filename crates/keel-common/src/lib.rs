//! Common types for keel: CRDs, errors, configuration, cluster access and
//! readiness polling shared by the restore and upgrade orchestrators.

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod release;
pub mod retry;
pub mod telemetry;
pub mod wait;

pub use client::{ClusterClient, KubeClusterClient};
pub use config::RuntimeConfig;
pub use error::Error;
pub use release::{ReleaseInfo, ReleaseMetadata};

#[cfg(any(test, feature = "mock"))]
pub use client::MockClusterClient;
#[cfg(any(test, feature = "mock"))]
pub use wait::MockProgressSink;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation marking Velero objects produced by the embedded cluster
pub const BACKUP_IS_EC_ANNOTATION: &str = "kots.io/embedded-cluster";
/// Label correlating the sub-backups of one disaster-recovery backup
pub const INSTANCE_BACKUP_NAME_LABEL: &str = "replicated.com/backup-name";
/// Annotation with the sub-backup type (infra, app, legacy)
pub const INSTANCE_BACKUP_TYPE_ANNOTATION: &str = "replicated.com/backup-type";
/// Annotation with the expected number of sub-backups
pub const INSTANCE_BACKUP_COUNT_ANNOTATION: &str = "replicated.com/backup-count";
