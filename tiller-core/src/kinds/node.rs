//! The `Node` kind: one execution host.
use super::{resource_impl, Condition, Resources};
use crate::metadata::ObjectMeta;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An execution host registered by its node agent.
///
/// Cluster-scoped. Created at agent registration; marked NotReady by the
/// node lifecycle controller when the heartbeat times out.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
pub struct Node {
    /// Object metadata
    pub metadata: ObjectMeta,
    /// Desired state (operator-controlled scheduling gates)
    pub spec: NodeSpec,
    /// Observed state (agent-reported)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
}

/// Scheduling gates an operator may place on a node
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Excludes the node from all placement decisions
    #[serde(default)]
    pub unschedulable: bool,
    /// Taints repel units that do not tolerate them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
}

/// Agent-reported node state
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Capacity available for workload requests
    #[serde(default)]
    pub allocatable: Resources,
    /// Conditions; `Ready` gates feasibility
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Last time the agent reported in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_time: Option<DateTime<Utc>>,
}

/// A repelling marker on a node
#[derive(Deserialize, Serialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Taint {
    /// Taint key
    pub key: String,
    /// Optional taint value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// What the taint does to non-tolerating units
    pub effect: TaintEffect,
}

/// Effect of a [`Taint`]
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaintEffect {
    /// Non-tolerating units are never placed on the node
    NoSchedule,
}

impl Node {
    /// Whether the node's Ready condition is currently true
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| super::condition_is_true(&s.conditions, super::CONDITION_READY))
    }

    /// The node's allocatable capacity, zero if never reported
    pub fn allocatable(&self) -> Resources {
        self.status.as_ref().map(|s| s.allocatable).unwrap_or_default()
    }
}

resource_impl!(Node, group: "", version: "v1", scope: Cluster);
