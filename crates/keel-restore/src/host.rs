//! Host-side collaborators of the restore workflow.
//!
//! Installing the cluster, preflights, the local artifact mirror and the
//! operator prompts live outside this crate. The restore steps reach them
//! only through [`HostOps`] and [`Prompt`] so they can be mocked.

use async_trait::async_trait;
use tracing::info;

use keel_common::{Error, Result};

/// Host operations the restore steps delegate to
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait HostOps: Send + Sync {
    /// Fail if a cluster is already installed on this host
    async fn verify_no_installation(&self) -> Result<()>;

    /// Check that the backup store is reachable and holds backups
    async fn validate_backup_store(&self, store: &BackupStore) -> Result<()>;

    /// Re-run host network configuration
    async fn configure_network_manager(&self) -> Result<()>;

    /// Stage the binaries and images shipped with this release
    async fn materialize_binaries(&self) -> Result<()>;

    /// Run host preflights; `Error::Stopped` when they fail and the operator
    /// chose not to continue
    async fn run_host_preflights(&self) -> Result<()>;

    /// Install and start the cluster with its core addons
    async fn install_cluster(&self) -> Result<()>;

    /// Point Velero at the backup store
    async fn configure_backup_store(&self, store: &BackupStore) -> Result<()>;

    /// Restart the local artifact mirror on `port`
    async fn refresh_local_artifact_mirror(&self, port: u16) -> Result<()>;

    /// Install and enable the management service
    async fn install_manager(&self) -> Result<()>;

    /// Trust `address` as an insecure registry
    async fn add_insecure_registry(&self, address: &str) -> Result<()>;

    /// Install additional vendor extensions
    async fn install_extensions(&self) -> Result<()>;
}

/// Operator interaction
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait Prompt: Send + Sync {
    /// Yes/no question
    fn confirm(&self, message: &str, default: bool) -> Result<bool>;

    /// Free-text answer, `default` when left blank
    fn input(&self, message: &str, default: &str, required: bool) -> Result<String>;

    /// Hidden answer
    fn password(&self, message: &str) -> Result<String>;
}

/// S3 coordinates of the backup store
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupStore {
    /// Endpoint URL, http or https
    pub endpoint: String,
    /// Region
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Optional key prefix
    pub prefix: String,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
}

impl BackupStore {
    /// Every required field is set (the prefix is optional)
    pub fn is_complete(&self) -> bool {
        !self.endpoint.is_empty()
            && !self.region.is_empty()
            && !self.bucket.is_empty()
            && !self.access_key_id.is_empty()
            && !self.secret_access_key.is_empty()
    }

    /// The endpoint carries an http or https scheme
    pub fn has_valid_endpoint(&self) -> bool {
        self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")
    }

    /// Ask the operator for every coordinate, re-asking for the endpoint
    /// until it is an http(s) URL
    pub fn prompt_missing(&mut self, prompt: &dyn Prompt) -> Result<()> {
        loop {
            self.endpoint = prompt.input("S3 endpoint:", &self.endpoint, true)?.trim().to_string();
            if self.has_valid_endpoint() {
                break;
            }
            info!("Endpoint must start with http:// or https://");
        }
        self.region = prompt.input("Region:", &self.region, true)?.trim().to_string();
        self.bucket = prompt.input("Bucket:", &self.bucket, true)?.trim().to_string();
        self.prefix = prompt
            .input("Prefix (press Enter to skip):", &self.prefix, false)?
            .trim()
            .to_string();
        self.access_key_id = prompt
            .input("Access key ID:", &self.access_key_id, true)?
            .trim()
            .to_string();
        self.secret_access_key = prompt.password("Secret access key:")?.trim().to_string();
        Ok(())
    }

    /// Fill in missing coordinates interactively and validate them
    pub fn resolve(&mut self, prompt: &dyn Prompt) -> Result<()> {
        if !self.is_complete() {
            info!("Enter information to configure access to your backup storage location.");
            self.prompt_missing(prompt)?;
        }
        self.prefix = self.prefix.trim_start_matches('/').to_string();
        if !self.has_valid_endpoint() {
            return Err(Error::validation_for_field(
                "--s3-endpoint",
                "endpoint must start with http:// or https://",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;

    fn complete() -> BackupStore {
        BackupStore {
            endpoint: "https://s3.us-east-1.amazonaws.com".to_string(),
            region: "us-east-1".to_string(),
            bucket: "backups".to_string(),
            prefix: "/cluster-a".to_string(),
            access_key_id: "AKIA".to_string(),
            secret_access_key: "secret".to_string(),
        }
    }

    #[test]
    fn test_complete_store_skips_prompts() {
        let mut prompt = MockPrompt::new();
        prompt.expect_input().never();
        prompt.expect_password().never();

        let mut store = complete();
        store.resolve(&prompt).unwrap();
        assert_eq!(store.prefix, "cluster-a");
    }

    #[test]
    fn test_flag_endpoint_without_scheme_is_rejected() {
        let mut store = complete();
        store.endpoint = "s3.example.com".to_string();
        let err = store.resolve(&MockPrompt::new()).unwrap_err();
        assert!(matches!(err, Error::Validation { field: Some(ref f), .. } if f == "--s3-endpoint"));
    }

    #[test]
    fn test_prompt_reasks_invalid_endpoint() {
        let mut prompt = MockPrompt::new();
        let mut seq = Sequence::new();
        prompt
            .expect_input()
            .withf(|m, _, _| m == "S3 endpoint:")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok("minio.local:9000".to_string()));
        prompt
            .expect_input()
            .withf(|m, _, _| m == "S3 endpoint:")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(" http://minio.local:9000 ".to_string()));
        prompt
            .expect_input()
            .returning(|m, _, _| Ok(format!("{}-answer", m.trim_end_matches(':'))));
        prompt
            .expect_password()
            .returning(|_| Ok("secret".to_string()));

        let mut store = BackupStore::default();
        store.resolve(&prompt).unwrap();
        assert_eq!(store.endpoint, "http://minio.local:9000");
        assert_eq!(store.region, "Region-answer");
        assert_eq!(store.secret_access_key, "secret");
        assert!(store.is_complete());
    }
}
