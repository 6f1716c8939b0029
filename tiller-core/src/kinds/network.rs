//! The `NetworkIsolationPolicy` kind: declared traffic rules consumed by
//! the dataplane collaborator.
use super::resource_impl;
use crate::{labels::Selector, metadata::ObjectMeta};
use serde::{Deserialize, Serialize};

/// Declares allowed ingress/egress traffic for a set of workload units.
///
/// Once any policy selects a unit, traffic in the covered direction is
/// default-deny except where a rule allows it. Enforcement belongs to the
/// dataplane proxy; the control plane stores and validates the declaration.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
pub struct NetworkIsolationPolicy {
    /// Object metadata
    pub metadata: ObjectMeta,
    /// The declared rules
    pub spec: NetworkIsolationPolicySpec,
}

/// Spec of a [`NetworkIsolationPolicy`]
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkIsolationPolicySpec {
    /// The units this policy applies to
    #[serde(default)]
    pub unit_selector: Selector,
    /// Allowed inbound (peer, port) pairs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<TrafficRule>,
    /// Allowed outbound (peer, port) pairs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<TrafficRule>,
}

/// One allowed traffic pairing
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficRule {
    /// Peer units the traffic may flow to or from
    #[serde(default)]
    pub peer_selector: Selector,
    /// Restrict to one port; `None` allows all ports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

resource_impl!(NetworkIsolationPolicy, group: "network", version: "v1", scope: Namespaced);
