//! The `ServiceEndpoint` kind: a readiness-gated member list consumed by
//! the dataplane proxy.
use super::resource_impl;
use crate::{labels::Selector, metadata::ObjectMeta};
use serde::{Deserialize, Serialize};

/// Declares a selector; the endpoint controller maintains the live member
/// list of Ready matching units. Membership tracks readiness, not mere
/// existence.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
pub struct ServiceEndpoint {
    /// Object metadata
    pub metadata: ObjectMeta,
    /// Desired state
    pub spec: ServiceEndpointSpec,
    /// Observed state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ServiceEndpointStatus>,
}

/// Desired state of a service endpoint
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpointSpec {
    /// Selects member units; immutable once set
    #[serde(default)]
    pub selector: Selector,
    /// Port the members serve on
    #[serde(default)]
    pub port: u16,
}

/// Controller-maintained member list
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpointStatus {
    /// Ready members, sorted by address for deterministic diffs
    #[serde(default)]
    pub members: Vec<EndpointMember>,
}

/// One routable member
#[derive(Deserialize, Serialize, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "camelCase")]
pub struct EndpointMember {
    /// Unit address
    pub ip: String,
    /// Serving port
    pub port: u16,
}

resource_impl!(ServiceEndpoint, group: "", version: "v1", scope: Namespaced);
