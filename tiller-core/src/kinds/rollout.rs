//! The `RolloutSpec` kind: migrates between replica-group generations.
use super::{replica_group::WorkloadTemplate, resource_impl};
use crate::{labels::Selector, metadata::ObjectMeta};
use serde::{Deserialize, Serialize};

/// Owns a versioned sequence of ReplicaGroups keyed by template hash and
/// drives old-to-new migration under a bounded-unavailability constraint.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
pub struct RolloutSpec {
    /// Object metadata
    pub metadata: ObjectMeta,
    /// Desired state
    pub spec: RolloutSpecSpec,
    /// Observed state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RolloutSpecStatus>,
}

/// Desired state of a rollout
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutSpecSpec {
    /// Total desired replicas across all generations
    #[serde(default)]
    pub replicas: u32,
    /// Selects units of every generation; immutable once set
    #[serde(default)]
    pub selector: Selector,
    /// Template of the current generation; changing it starts a migration
    #[serde(default)]
    pub template: WorkloadTemplate,
    /// How many of `replicas` may be unavailable during a migration
    #[serde(default = "default_max_unavailable")]
    pub max_unavailable: u32,
}

fn default_max_unavailable() -> u32 {
    1
}

impl Default for RolloutSpecSpec {
    fn default() -> Self {
        Self {
            replicas: 0,
            selector: Selector::default(),
            template: WorkloadTemplate::default(),
            max_unavailable: default_max_unavailable(),
        }
    }
}

/// Observed state of a rollout
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutSpecStatus {
    /// Units belonging to the current-generation ReplicaGroup
    #[serde(default)]
    pub updated_replicas: u32,
    /// Ready units across all generations
    #[serde(default)]
    pub ready_replicas: u32,
    /// Template hash of the current generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_hash: Option<String>,
}

resource_impl!(RolloutSpec, group: "apps", version: "v1", scope: Namespaced);
