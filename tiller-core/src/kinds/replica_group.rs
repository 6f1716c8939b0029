//! The `ReplicaGroup` kind: keeps N workload units alive from a template.
use super::{resource_impl, workload::WorkloadUnitSpec};
use crate::{labels::Selector, metadata::ObjectMeta};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declares a template workload unit and a desired replica count.
///
/// Its controller converges the set of owned, non-terminal matching units to
/// size `spec.replicas`.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
pub struct ReplicaGroup {
    /// Object metadata
    pub metadata: ObjectMeta,
    /// Desired state
    pub spec: ReplicaGroupSpec,
    /// Observed state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReplicaGroupStatus>,
}

/// Desired state of a replica group
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaGroupSpec {
    /// How many matching units to keep alive
    #[serde(default)]
    pub replicas: u32,
    /// Selects the units this group owns; immutable once set
    #[serde(default)]
    pub selector: Selector,
    /// Template new units are stamped from
    #[serde(default)]
    pub template: WorkloadTemplate,
}

/// Template for units created by a [`ReplicaGroup`] or rollout
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadTemplate {
    /// Labels stamped onto created units; must satisfy the owner's selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Spec stamped onto created units
    #[serde(default)]
    pub spec: WorkloadUnitSpec,
}

/// Observed state of a replica group
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaGroupStatus {
    /// Owned, non-terminal matching units
    #[serde(default)]
    pub replicas: u32,
    /// Of those, how many are Ready
    #[serde(default)]
    pub ready_replicas: u32,
}

resource_impl!(ReplicaGroup, group: "apps", version: "v1", scope: Namespaced);
