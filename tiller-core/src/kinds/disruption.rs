//! The `DisruptionBudget` kind: bounds voluntary evictions.
use super::resource_impl;
use crate::{labels::Selector, metadata::ObjectMeta};
use serde::{Deserialize, Serialize};

/// References a selector and a floor of available units; consulted by
/// voluntary evictions, with no effect on involuntary failures.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
pub struct DisruptionBudget {
    /// Object metadata
    pub metadata: ObjectMeta,
    /// Desired state
    pub spec: DisruptionBudgetSpec,
    /// Observed state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DisruptionBudgetStatus>,
}

/// Desired state of a disruption budget; exactly one bound must be set
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionBudgetSpec {
    /// Units protected by this budget
    #[serde(default)]
    pub selector: Selector,
    /// Minimum count of healthy matching units that must remain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<u32>,
    /// Maximum count of matching units that may be unavailable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<u32>,
}

/// Controller-maintained accounting
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionBudgetStatus {
    /// Matching units currently Ready
    #[serde(default)]
    pub current_healthy: u32,
    /// The floor implied by the spec and the current matching set
    #[serde(default)]
    pub desired_healthy: u32,
    /// Evictions that may proceed right now; decremented atomically by each
    /// voluntary eviction
    #[serde(default)]
    pub disruptions_allowed: u32,
}

resource_impl!(DisruptionBudget, group: "policy", version: "v1", scope: Namespaced);
