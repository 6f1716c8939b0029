//! The built-in object kinds of the control plane.
//!
//! Every kind follows the same envelope: `metadata` + client-owned `spec` +
//! controller-owned `status`. The [`resource_impl!`] macro wires each kind
//! into the [`Resource`](crate::resource::Resource) trait so typed and
//! dynamic call sites share one dispatch mechanism.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api_resource::ApiResource;

pub mod access;
pub mod disruption;
pub mod network;
pub mod node;
pub mod replica_group;
pub mod rollout;
pub mod scaling;
pub mod service_endpoint;
pub mod workload;

pub use access::{AccessBinding, AccessPolicy, AccessRule, BindingScope, PolicyRef, Subject, SubjectKind};
pub use disruption::{DisruptionBudget, DisruptionBudgetSpec, DisruptionBudgetStatus};
pub use network::{NetworkIsolationPolicy, TrafficRule};
pub use node::{Node, NodeSpec, NodeStatus, Taint, TaintEffect};
pub use replica_group::{ReplicaGroup, ReplicaGroupSpec, ReplicaGroupStatus, WorkloadTemplate};
pub use rollout::{RolloutSpec, RolloutSpecSpec, RolloutSpecStatus};
pub use scaling::{ScalingPolicy, ScalingPolicySpec, ScalingPolicyStatus, TargetRef};
pub use service_endpoint::{EndpointMember, ServiceEndpoint, ServiceEndpointSpec, ServiceEndpointStatus};
pub use workload::{Phase, ProbeSpec, ProcessSpec, Toleration, WorkloadUnit, WorkloadUnitSpec, WorkloadUnitStatus};

/// Implements [`Resource`](crate::resource::Resource) for a kind whose type
/// information is known at compile time.
macro_rules! resource_impl {
    ($kind:ident, group: $group:literal, version: $version:literal, scope: $scope:ident) => {
        impl $crate::resource::Resource for $kind {
            type DynamicType = ();

            fn kind(_: &()) -> std::borrow::Cow<'_, str> {
                stringify!($kind).into()
            }

            fn group(_: &()) -> std::borrow::Cow<'_, str> {
                $group.into()
            }

            fn version(_: &()) -> std::borrow::Cow<'_, str> {
                $version.into()
            }

            fn scope(_: &()) -> $crate::api_resource::Scope {
                $crate::api_resource::Scope::$scope
            }

            fn meta(&self) -> &$crate::metadata::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut $crate::metadata::ObjectMeta {
                &mut self.metadata
            }
        }

        impl $kind {
            /// Construct a named, empty object of this kind
            pub fn new(name: &str) -> Self {
                Self {
                    metadata: $crate::metadata::ObjectMeta {
                        name: Some(name.to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                }
            }
        }
    };
}
pub(crate) use resource_impl;

/// Every built-in kind, for seeding the gateway's kind registry
pub fn builtin_resources() -> Vec<ApiResource> {
    vec![
        ApiResource::erase::<Node>(),
        ApiResource::erase::<WorkloadUnit>(),
        ApiResource::erase::<ServiceEndpoint>(),
        ApiResource::erase::<ReplicaGroup>(),
        ApiResource::erase::<RolloutSpec>(),
        ApiResource::erase::<ScalingPolicy>(),
        ApiResource::erase::<DisruptionBudget>(),
        ApiResource::erase::<AccessPolicy>(),
        ApiResource::erase::<AccessBinding>(),
        ApiResource::erase::<NetworkIsolationPolicy>(),
    ]
}

/// CPU and memory quantities, used both as node allocatable capacity and as
/// workload requests.
#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    /// Thousandths of a CPU core
    #[serde(default)]
    pub cpu_millis: u64,
    /// Bytes of memory
    #[serde(default)]
    pub memory_bytes: u64,
}

impl Resources {
    /// Construct from explicit quantities
    pub fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self { cpu_millis, memory_bytes }
    }

    /// Whether this request fits inside the given free capacity
    pub fn fits_within(&self, free: &Resources) -> bool {
        self.cpu_millis <= free.cpu_millis && self.memory_bytes <= free.memory_bytes
    }

    /// The dominant utilization fraction this quantity represents of a
    /// capacity; used by the scheduler's fragmentation scoring
    pub fn dominant_fraction_of(&self, capacity: &Resources) -> f64 {
        let cpu = if capacity.cpu_millis == 0 {
            1.0
        } else {
            self.cpu_millis as f64 / capacity.cpu_millis as f64
        };
        let mem = if capacity.memory_bytes == 0 {
            1.0
        } else {
            self.memory_bytes as f64 / capacity.memory_bytes as f64
        };
        cpu.max(mem)
    }
}

impl std::ops::Add for Resources {
    type Output = Resources;

    fn add(self, rhs: Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis + rhs.cpu_millis,
            memory_bytes: self.memory_bytes + rhs.memory_bytes,
        }
    }
}

impl std::ops::AddAssign for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        self.cpu_millis += rhs.cpu_millis;
        self.memory_bytes += rhs.memory_bytes;
    }
}

impl std::ops::Sub for Resources {
    type Output = Resources;

    /// Saturating: reservations can transiently exceed allocatable while
    /// terminal units are being reaped
    fn sub(self, rhs: Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_sub(rhs.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(rhs.memory_bytes),
        }
    }
}

/// The condition type gating endpoint membership and scheduling
pub const CONDITION_READY: &str = "Ready";

/// An observation about one aspect of an object's state
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. `Ready`
    #[serde(rename = "type")]
    pub type_: String,
    /// Whether the condition currently holds
    pub status: bool,
    /// Machine-readable reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the condition last changed status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// A fresh condition with the transition time set to now
    pub fn new(type_: &str, status: bool, reason: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: Some(reason.to_string()),
            message: None,
            last_transition_time: Some(Utc::now()),
        }
    }
}

/// Whether a condition of the given type is present and true
pub fn condition_is_true(conditions: &[Condition], type_: &str) -> bool {
    conditions.iter().any(|c| c.type_ == type_ && c.status)
}

/// Upserts a condition by type.
///
/// Returns `true` if the status changed (the transition time is only
/// rewritten on a real transition, so repeated upserts are idempotent).
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) if existing.status == condition.status => false,
        Some(existing) => {
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_fit_and_sum() {
        let free = Resources::new(1000, 2048);
        assert!(Resources::new(500, 1024).fits_within(&free));
        assert!(!Resources::new(1500, 8).fits_within(&free));
        assert_eq!(
            Resources::new(100, 200) + Resources::new(50, 100),
            Resources::new(150, 300)
        );
        assert_eq!(Resources::new(100, 200) - Resources::new(300, 50), Resources::new(0, 150));
    }

    #[test]
    fn dominant_fraction_picks_scarcer_dimension() {
        let capacity = Resources::new(1000, 1000);
        let used = Resources::new(200, 900);
        assert!((used.dominant_fraction_of(&capacity) - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn set_condition_is_idempotent_on_unchanged_status() {
        let mut conditions = vec![];
        assert!(set_condition(&mut conditions, Condition::new(CONDITION_READY, true, "Started")));
        assert!(!set_condition(&mut conditions, Condition::new(CONDITION_READY, true, "Started")));
        assert!(set_condition(&mut conditions, Condition::new(CONDITION_READY, false, "ProbeFailed")));
        assert!(!condition_is_true(&conditions, CONDITION_READY));
        assert_eq!(conditions.len(), 1);
    }
}
