//! k0s autopilot Plan resource
//!
//! A single cluster-scoped plan named `autopilot` drives substrate-level
//! operations (binary upgrade, airgap image load). The plan carries an
//! annotation naming the Installation it belongs to.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::kube_utils::HasApiResource;

/// Fixed name of the autopilot plan
pub const PLAN_NAME: &str = "autopilot";
/// Annotation tying a plan to the Installation that created it
pub const INSTALLATION_ANNOTATION: &str = "embedded-cluster.replicated.com/installation-name";
/// Platform key used in plan commands
pub const PLATFORM_LINUX_AMD64: &str = "linux-amd64";

/// Autopilot plan states as reported in `status.state`
pub mod state {
    /// Plan accepted, waiting to run
    pub const SCHEDULABLE: &str = "Schedulable";
    /// Plan waiting for a previous step
    pub const SCHEDULABLE_WAIT: &str = "SchedulableWait";
    /// Plan finished successfully
    pub const COMPLETED: &str = "Completed";
    /// Plan failed to apply
    pub const APPLY_FAILED: &str = "ApplyFailed";
    /// Targets missing or unreachable
    pub const INCOMPLETE_TARGETS: &str = "IncompleteTargets";
    /// Targets disagree with each other
    pub const INCONSISTENT_TARGETS: &str = "InconsistentTargets";
    /// Plan blocked by restrictions
    pub const RESTRICTED: &str = "Restricted";
    /// Signal node missing
    pub const MISSING_SIGNAL_NODE: &str = "MissingSignalNode";
}

/// Coarse plan phase used by the upgrade orchestrator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanPhase {
    /// Accepted but not started
    Scheduled,
    /// Running
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished with a failure
    Failed,
}

impl std::fmt::Display for PlanPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "Scheduled"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Download location of a platform artifact
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanResourceUrl {
    /// Artifact URL
    pub url: String,
    /// Optional checksum
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Static node list
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PlanCommandTargetStatic {
    /// Node names
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Node selector; an empty selector addresses every node of the role
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PlanCommandTargetSelector {
    /// Label selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<String>,
    /// Field selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<String>,
}

/// How plan targets are discovered
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PlanCommandTargetDiscovery {
    /// Explicit node list
    #[serde(default, rename = "static", skip_serializing_if = "Option::is_none")]
    pub static_nodes: Option<PlanCommandTargetStatic>,
    /// Selector-based discovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<PlanCommandTargetSelector>,
}

/// Target set for one node role
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PlanCommandTarget {
    /// Discovery mechanism
    pub discovery: PlanCommandTargetDiscovery,
}

impl PlanCommandTarget {
    /// Address every node of the role
    pub fn all() -> Self {
        Self {
            discovery: PlanCommandTargetDiscovery {
                static_nodes: None,
                selector: Some(PlanCommandTargetSelector::default()),
            },
        }
    }
}

/// Controller and worker targets
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PlanCommandTargets {
    /// Controller nodes
    pub controllers: PlanCommandTarget,
    /// Worker nodes
    pub workers: PlanCommandTarget,
}

/// Upgrade the k0s binary on every node
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanCommandK0sUpdate {
    /// Target k0s version
    pub version: String,
    /// Update even when versions already match
    #[serde(default, rename = "forceupdate")]
    pub force_update: bool,
    /// Binary location per platform
    #[serde(default)]
    pub platforms: BTreeMap<String, PlanResourceUrl>,
    /// Nodes to update
    pub targets: PlanCommandTargets,
}

/// Load an airgap image bundle into the container runtime on every node
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanCommandAirgapUpdate {
    /// Bundle version
    pub version: String,
    /// Bundle location per platform
    #[serde(default)]
    pub platforms: BTreeMap<String, PlanResourceUrl>,
    /// Nodes to update
    pub workers: PlanCommandTarget,
}

/// One plan command; exactly one field is set
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanCommand {
    /// Binary upgrade
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k0supdate: Option<PlanCommandK0sUpdate>,
    /// Airgap bundle load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub airgapupdate: Option<PlanCommandAirgapUpdate>,
}

/// Plan spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanSpec {
    /// Unique plan id
    #[serde(default)]
    pub id: String,
    /// Creation marker, "now" to run immediately
    #[serde(default)]
    pub timestamp: String,
    /// Commands run in order
    #[serde(default)]
    pub commands: Vec<PlanCommand>,
}

/// Plan status
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatus {
    /// Overall plan state
    #[serde(default)]
    pub state: String,
}

/// Autopilot Plan resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// API version
    #[serde(default = "Plan::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "Plan::default_kind")]
    pub kind: String,
    /// Resource metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Plan commands
    #[serde(default)]
    pub spec: PlanSpec,
    /// Plan progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PlanStatus>,
}

impl HasApiResource for Plan {
    const API_VERSION: &'static str = "autopilot.k0sproject.io/v1beta2";
    const KIND: &'static str = "Plan";
}

impl Plan {
    fn default_api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }
    fn default_kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Create the fixed-name plan owned by an installation
    pub fn new(installation: &str, spec: PlanSpec) -> Self {
        let mut annotations = BTreeMap::new();
        annotations.insert(INSTALLATION_ANNOTATION.to_string(), installation.to_string());
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata: ObjectMeta {
                name: Some(PLAN_NAME.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    /// Installation this plan belongs to, if annotated
    pub fn installation(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(INSTALLATION_ANNOTATION))
            .map(String::as_str)
    }

    /// True when the plan is annotated for the given installation
    pub fn is_owned_by(&self, installation: &str) -> bool {
        self.installation() == Some(installation)
    }

    /// Raw autopilot state, empty before the controller picks the plan up
    pub fn state(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.state.as_str())
            .unwrap_or_default()
    }

    /// Coarse phase derived from the autopilot state
    pub fn phase(&self) -> PlanPhase {
        match self.state() {
            state::COMPLETED => PlanPhase::Succeeded,
            state::APPLY_FAILED
            | state::INCOMPLETE_TARGETS
            | state::INCONSISTENT_TARGETS
            | state::RESTRICTED
            | state::MISSING_SIGNAL_NODE => PlanPhase::Failed,
            state::SCHEDULABLE_WAIT => PlanPhase::Running,
            _ => PlanPhase::Scheduled,
        }
    }

    /// True once the plan can no longer make progress
    pub fn has_ended(&self) -> bool {
        matches!(self.phase(), PlanPhase::Succeeded | PlanPhase::Failed)
    }

    /// True when every command is a binary upgrade
    pub fn is_k0s_upgrade(&self) -> bool {
        !self.spec.commands.is_empty() && self.spec.commands.iter().all(|c| c.k0supdate.is_some())
    }

    /// True when every command is an airgap bundle load
    pub fn is_airgap_update(&self) -> bool {
        !self.spec.commands.is_empty()
            && self.spec.commands.iter().all(|c| c.airgapupdate.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with_state(state: &str) -> Plan {
        let mut plan = Plan::new("20240101000000", PlanSpec::default());
        plan.status = Some(PlanStatus {
            state: state.to_string(),
        });
        plan
    }

    #[test]
    fn test_phase_mapping() {
        assert_eq!(plan_with_state("").phase(), PlanPhase::Scheduled);
        assert_eq!(plan_with_state(state::SCHEDULABLE).phase(), PlanPhase::Scheduled);
        assert_eq!(plan_with_state(state::SCHEDULABLE_WAIT).phase(), PlanPhase::Running);
        assert_eq!(plan_with_state(state::COMPLETED).phase(), PlanPhase::Succeeded);
        assert_eq!(plan_with_state(state::APPLY_FAILED).phase(), PlanPhase::Failed);
        assert_eq!(plan_with_state(state::RESTRICTED).phase(), PlanPhase::Failed);
        assert!(plan_with_state(state::COMPLETED).has_ended());
        assert!(!plan_with_state(state::SCHEDULABLE).has_ended());
    }

    #[test]
    fn test_ownership() {
        let plan = Plan::new("inst-a", PlanSpec::default());
        assert!(plan.is_owned_by("inst-a"));
        assert!(!plan.is_owned_by("inst-b"));
        assert_eq!(plan.metadata.name.as_deref(), Some(PLAN_NAME));
    }

    #[test]
    fn test_command_kind() {
        let mut plan = Plan::new("i", PlanSpec::default());
        assert!(!plan.is_k0s_upgrade());
        plan.spec.commands.push(PlanCommand {
            k0supdate: Some(PlanCommandK0sUpdate::default()),
            airgapupdate: None,
        });
        assert!(plan.is_k0s_upgrade());
        assert!(!plan.is_airgap_update());

        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["apiVersion"], "autopilot.k0sproject.io/v1beta2");
        assert!(json["spec"]["commands"][0].get("k0supdate").is_some());
    }
}
