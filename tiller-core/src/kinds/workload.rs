//! The `WorkloadUnit` kind: the smallest schedulable group of co-located
//! processes.
use super::{node::Taint, resource_impl, Condition, Resources};
use crate::metadata::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A schedulable group of co-located processes.
///
/// Owned by exactly one higher-level controller object via an owner
/// reference; bound to at most one node for its lifetime.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
pub struct WorkloadUnit {
    /// Object metadata
    pub metadata: ObjectMeta,
    /// Desired state
    pub spec: WorkloadUnitSpec,
    /// Observed state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkloadUnitStatus>,
}

/// Client-declared shape of a workload unit
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadUnitSpec {
    /// The processes that run together on one node
    #[serde(default)]
    pub processes: Vec<ProcessSpec>,
    /// The node this unit is bound to; empty until the scheduler binds it,
    /// immutable afterwards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Restricts feasible nodes to those carrying these labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    /// Taints this unit accepts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    /// Restart the unit's processes when this probe fails repeatedly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<ProbeSpec>,
    /// Gate endpoint membership on this probe, without restarting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<ProbeSpec>,
    /// How long a graceful stop may take before force-termination
    #[serde(default = "default_grace_seconds")]
    pub termination_grace_seconds: u64,
}

fn default_grace_seconds() -> u64 {
    30
}

impl Default for WorkloadUnitSpec {
    fn default() -> Self {
        Self {
            processes: Vec::new(),
            node_name: None,
            node_selector: BTreeMap::new(),
            tolerations: Vec::new(),
            liveness_probe: None,
            readiness_probe: None,
            termination_grace_seconds: default_grace_seconds(),
        }
    }
}

/// One process within a unit
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    /// Process name, unique within the unit
    pub name: String,
    /// Artifact reference resolved by the external fetch collaborator
    pub artifact: String,
    /// Command line; empty defers to the artifact's default
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Resources reserved on the node for this process
    #[serde(default)]
    pub requests: Resources,
}

/// A health probe executed by the node agent's runtime
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSpec {
    /// Runtime-interpreted probe action
    pub action: String,
    /// Per-attempt timeout
    #[serde(default)]
    pub timeout_seconds: u64,
}

/// Acceptance of a node taint
#[derive(Deserialize, Serialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    /// Taint key to tolerate
    pub key: String,
    /// If set, only taints with this exact value are tolerated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Coarse lifecycle state of a unit
#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Accepted but not yet bound to a node
    #[default]
    Pending,
    /// Bound to a node, not yet running
    Scheduled,
    /// Processes are running
    Running,
    /// All processes exited successfully
    Succeeded,
    /// A process failed terminally, or startup gave up
    Failed,
}

impl Phase {
    /// Terminal phases no longer consume node capacity and no longer count
    /// toward replica totals
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }
}

/// Agent-reported unit state
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadUnitStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: Phase,
    /// Conditions; `Ready` gates endpoint membership
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Address the unit's processes are reachable at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_ip: Option<String>,
    /// Total liveness-triggered restarts
    #[serde(default)]
    pub restart_count: u32,
    /// Machine-readable reason for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable detail for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WorkloadUnit {
    /// The unit's total resource request: the sum over its processes
    pub fn requests(&self) -> Resources {
        self.spec
            .processes
            .iter()
            .fold(Resources::default(), |acc, p| acc + p.requests)
    }

    /// Whether every taint on a node is tolerated by this unit
    pub fn tolerates_all(&self, taints: &[Taint]) -> bool {
        taints.iter().all(|taint| {
            self.spec
                .tolerations
                .iter()
                .any(|tol| tol.key == taint.key && (tol.value.is_none() || tol.value == taint.value))
        })
    }

    /// Current phase, `Pending` if status was never reported
    pub fn phase(&self) -> Phase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Whether the unit's Ready condition is currently true
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| super::condition_is_true(&s.conditions, super::CONDITION_READY))
    }
}

resource_impl!(WorkloadUnit, group: "", version: "v1", scope: Namespaced);
