//! Release metadata lookup.

use tracing::debug;

use keel_common::release::METADATA_DATA_KEY;
use keel_common::{ClusterClient, Error, ReleaseMetadata, Result};

/// Read the metadata published for `version` into `namespace`
pub async fn load_release_metadata(
    client: &dyn ClusterClient,
    namespace: &str,
    version: &str,
) -> Result<ReleaseMetadata> {
    let name = ReleaseMetadata::config_map_name(version);
    debug!(config_map = %name, "reading release metadata");

    let cm = client
        .get_config_map(namespace, &name)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: "ConfigMap".to_string(),
            name: format!("{}/{}", namespace, name),
        })?;

    let data = cm
        .data
        .as_ref()
        .and_then(|d| d.get(METADATA_DATA_KEY))
        .ok_or_else(|| {
            Error::validation(format!("{} has no {} key", name, METADATA_DATA_KEY))
        })?;
    ReleaseMetadata::from_json(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use keel_common::MockClusterClient;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_reads_versioned_config_map() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_config_map()
            .withf(|ns, name| ns == "embedded-cluster" && name == "version-metadata-1.4.0-k8s-1.30")
            .returning(|_, _| {
                Ok(Some(ConfigMap {
                    data: Some(BTreeMap::from([(
                        METADATA_DATA_KEY.to_string(),
                        r#"{"Versions":{"Kubernetes":"v1.30.5+k0s.0"}}"#.to_string(),
                    )])),
                    ..Default::default()
                }))
            });

        let meta = load_release_metadata(&mock, "embedded-cluster", "v1.4.0+k8s-1.30")
            .await
            .unwrap();
        assert_eq!(meta.k0s_version().unwrap(), "v1.30.5+k0s.0");
    }

    #[tokio::test]
    async fn test_missing_metadata_is_not_found() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_config_map().returning(|_, _| Ok(None));
        let err = load_release_metadata(&mock, "embedded-cluster", "1.4.0")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
