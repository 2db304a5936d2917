//! Installation record lifecycle during an upgrade.
//!
//! The target installation is created in `Waiting` before anything changes so
//! other components can see an upgrade is pending. Once the substrate and the
//! charts have converged it is unlocked, and older records are marked
//! `Obsolete`.

use tracing::{debug, info, warn};

use keel_common::crd::installation::{Installation, InstallationState};
use keel_common::{ClusterClient, Error, Result};

/// Reason recorded on superseded installations
pub const OBSOLETE_REASON: &str = "This is not the most recent installation object";

/// Create the target installation locked in `Waiting`. A record that
/// already exists is left as is.
pub async fn create_installation(client: &dyn ClusterClient, desired: &Installation) -> Result<()> {
    let name = desired.name();
    if client.get_installation(name).await?.is_some() {
        info!(installation = %name, "Installation already exists");
        return Ok(());
    }

    info!(installation = %name, "Creating installation");
    let mut created = match client.create_installation(desired).await {
        Ok(created) => created,
        Err(e) if e.is_already_exists() => {
            debug!(installation = %name, "installation created concurrently");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    created.set_state(InstallationState::Waiting, "waiting for the upgrade to complete");
    client.update_installation_status(&created).await?;
    info!(installation = %name, "Installation created");
    Ok(())
}

/// Copy the desired spec onto the stored installation and move it out of
/// `Waiting`
pub async fn unlock_installation(client: &dyn ClusterClient, desired: &Installation) -> Result<()> {
    let name = desired.name();
    let mut existing = client
        .get_installation(name)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: "Installation".to_string(),
            name: name.to_string(),
        })?;

    // Fields introduced by the new version only exist on the desired spec
    existing.spec = desired.spec.clone();
    let mut updated = client.update_installation(&existing).await?;

    if updated.state() == InstallationState::Waiting {
        updated.set_state(InstallationState::KubernetesInstalled, "upgrade completed");
        client.update_installation_status(&updated).await?;
        debug!(installation = %name, "installation unlocked");
    }
    Ok(())
}

/// Mark every installation but the newest as `Obsolete`. Failures are logged
/// and retried on the next invocation.
pub async fn disable_old_installations(client: &dyn ClusterClient) -> Result<()> {
    let mut items = client.list_installations().await?;
    items.sort_by(|a, b| b.name().cmp(a.name()));

    for mut old in items.into_iter().skip(1) {
        if old.state() == InstallationState::Obsolete {
            continue;
        }
        old.set_state(InstallationState::Obsolete, OBSOLETE_REASON);
        if let Err(e) = client.update_installation_status(&old).await {
            warn!(installation = %old.name(), error = %e, "unable to mark installation obsolete");
        }
    }
    Ok(())
}

/// True when the installation asks for a version other than `running`
pub fn needs_upgrade(installation: &Installation, running: &str) -> bool {
    let desired = installation.version();
    !desired.is_empty() && desired.trim_start_matches('v') != running.trim_start_matches('v')
}
