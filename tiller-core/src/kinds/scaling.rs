//! The `ScalingPolicy` kind: horizontal autoscaling of a replica target.
use super::resource_impl;
use crate::metadata::ObjectMeta;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// References a ReplicaGroup or RolloutSpec and a target metric utilization;
/// its controller periodically adjusts the target's replica count within
/// `[min, max]`.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
pub struct ScalingPolicy {
    /// Object metadata
    pub metadata: ObjectMeta,
    /// Desired state
    pub spec: ScalingPolicySpec,
    /// Observed state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ScalingPolicyStatus>,
}

/// Desired state of a scaling policy
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScalingPolicySpec {
    /// The scalable object this policy drives
    #[serde(default)]
    pub target_ref: TargetRef,
    /// Lower replica bound
    #[serde(default)]
    pub min_replicas: u32,
    /// Upper replica bound
    #[serde(default)]
    pub max_replicas: u32,
    /// Metric utilization the controller steers toward, as a fraction
    /// (1.0 = exactly at target)
    #[serde(default)]
    pub target_utilization: f64,
}

/// Reference to a scalable object in the policy's namespace
#[derive(Deserialize, Serialize, Clone, Default, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    /// `ReplicaGroup` or `RolloutSpec`
    #[serde(default)]
    pub kind: String,
    /// Target object name
    #[serde(default)]
    pub name: String,
}

/// Observed state of a scaling policy
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScalingPolicyStatus {
    /// Replica count last written to the target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_replicas: Option<u32>,
    /// Utilization observed at the last evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_utilization: Option<f64>,
    /// When the controller last reduced the target; scale-down is throttled
    /// by a cooldown window, scale-up is not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_down: Option<DateTime<Utc>>,
}

resource_impl!(ScalingPolicy, group: "autoscaling", version: "v1", scope: Namespaced);
