//! Metadata structs flattened into every stored object.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Type information that is flattened into every tiller object
#[derive(Deserialize, Serialize, Clone, Default, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    /// The version of the API
    pub api_version: String,

    /// The name of the kind
    pub kind: String,
}

/// Standard object metadata carried by every persisted object.
///
/// All fields are optional on the wire; the gateway populates `uid`,
/// `resource_version` and `creation_timestamp` at persistence time.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Unique name within a namespace (or within the cluster for
    /// cluster-scoped kinds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Namespace the object lives in; `None` for cluster-scoped kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Immutable identifier assigned at creation, unique for the object's
    /// lifetime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// Monotonically increasing version used for optimistic-concurrency
    /// writes; opaque to clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    /// Map of string keys and values usable by selectors
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Unstructured key value map without selector semantics
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Objects this object is owned by; deletion of a controller owner
    /// implies cleanup of the dependents
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,

    /// Markers that block physical deletion until cleanup completes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    /// Set by the gateway when the object is first persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    /// Set by the gateway when deletion is requested while finalizers are
    /// still present; the object is erased once the finalizer list empties
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// A reference to an owning object.
///
/// The owner must be in the same namespace as the dependent (or
/// cluster-scoped).
#[derive(Deserialize, Serialize, Clone, Default, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    /// API version of the owner
    pub api_version: String,
    /// Kind of the owner
    pub kind: String,
    /// Name of the owner
    pub name: String,
    /// Uid of the owner
    pub uid: String,
    /// Whether this reference points to the managing controller
    #[serde(default)]
    pub controller: bool,
}

/// List metadata returned by list calls; only carries the collection's
/// resource version for watch resumption.
#[derive(Deserialize, Serialize, Clone, Default, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    /// Store revision at which the list was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_meta_round_trips_camel_case() {
        let meta = ObjectMeta {
            name: Some("web".into()),
            namespace: Some("default".into()),
            uid: Some("u-1".into()),
            resource_version: Some("12".into()),
            owner_references: vec![OwnerReference {
                api_version: "apps/v1".into(),
                kind: "ReplicaGroup".into(),
                name: "web".into(),
                uid: "u-0".into(),
                controller: true,
            }],
            ..ObjectMeta::default()
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_json_diff::assert_json_include!(
            actual: json.clone(),
            expected: serde_json::json!({
                "resourceVersion": "12",
                "ownerReferences": [{"apiVersion": "apps/v1", "controller": true}],
            })
        );
        let back: ObjectMeta = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }
}
