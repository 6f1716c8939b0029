//! The `AccessPolicy` and `AccessBinding` kinds: verb-by-kind permissions.
use super::resource_impl;
use crate::metadata::ObjectMeta;
use serde::{Deserialize, Serialize};

/// A reusable set of permission rules.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
pub struct AccessPolicy {
    /// Object metadata
    pub metadata: ObjectMeta,
    /// The rules this policy grants
    pub spec: AccessPolicySpec,
}

/// Rules of an [`AccessPolicy`]
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessPolicySpec {
    /// Any matching rule allows the request
    #[serde(default)]
    pub rules: Vec<AccessRule>,
}

/// One verb-by-kind permission.
///
/// `*` entries are wildcards; the engine treats them like explicit rules,
/// but tooling flags them as a distinct risk tier.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessRule {
    /// Allowed verbs (`get`, `list`, `watch`, `create`, `update`,
    /// `update_status`, `delete`, `evict`, or `*`)
    #[serde(default)]
    pub verbs: Vec<String>,
    /// Allowed kinds (PascalCase kind names, or `*`)
    #[serde(default)]
    pub kinds: Vec<String>,
    /// If non-empty, restricts the rule to specific object names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_names: Vec<String>,
}

impl AccessRule {
    /// Whether any entry in a rule list covers a value
    fn covers(list: &[String], value: &str) -> bool {
        list.iter().any(|entry| entry == "*" || entry == value)
    }

    /// Whether this rule allows the (verb, kind, name) triple
    pub fn allows(&self, verb: &str, kind: &str, name: Option<&str>) -> bool {
        if !Self::covers(&self.verbs, verb) || !Self::covers(&self.kinds, kind) {
            return false;
        }
        if self.resource_names.is_empty() {
            return true;
        }
        name.is_some_and(|n| self.resource_names.iter().any(|r| r == n))
    }

    /// Whether the rule contains a wildcard verb or kind
    pub fn is_wildcard(&self) -> bool {
        self.verbs.iter().any(|v| v == "*") || self.kinds.iter().any(|k| k == "*")
    }
}

/// Grants an [`AccessPolicy`]'s rules to a set of identities.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
pub struct AccessBinding {
    /// Object metadata
    pub metadata: ObjectMeta,
    /// Who is bound to what, and at which scope
    pub spec: AccessBindingSpec,
}

/// Spec of an [`AccessBinding`]
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessBindingSpec {
    /// The identities granted the policy's rules
    #[serde(default)]
    pub subjects: Vec<Subject>,
    /// The policy whose rules are granted
    #[serde(default)]
    pub policy_ref: PolicyRef,
    /// Namespace-scoped bindings grant only within their own namespace;
    /// cluster-scoped bindings grant everywhere
    #[serde(default)]
    pub scope: BindingScope,
}

/// An identity a binding grants to
#[derive(Deserialize, Serialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    /// User or group
    pub kind: SubjectKind,
    /// Identity name
    pub name: String,
}

/// Discriminates [`Subject`] identities
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubjectKind {
    /// A single authenticated user
    User,
    /// Every member of a group
    Group,
}

/// Reference to an [`AccessPolicy`]
#[derive(Deserialize, Serialize, Clone, Default, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRef {
    /// Policy namespace; defaults to the binding's own namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Policy name
    #[serde(default)]
    pub name: String,
}

/// Scope of an [`AccessBinding`]
#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, Eq, PartialEq)]
pub enum BindingScope {
    /// Grants apply only in the binding's namespace
    #[default]
    Namespace,
    /// Grants apply cluster-wide, including cluster-scoped kinds
    Cluster,
}

resource_impl!(AccessPolicy, group: "access", version: "v1", scope: Namespaced);
resource_impl!(AccessBinding, group: "access", version: "v1", scope: Namespaced);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_matching() {
        let rule = AccessRule {
            verbs: vec!["get".into(), "list".into()],
            kinds: vec!["WorkloadUnit".into()],
            resource_names: vec![],
        };
        assert!(rule.allows("get", "WorkloadUnit", None));
        assert!(!rule.allows("delete", "WorkloadUnit", None));
        assert!(!rule.allows("get", "Node", None));
        assert!(!rule.is_wildcard());
    }

    #[test]
    fn name_scoped_rule_requires_a_name() {
        let rule = AccessRule {
            verbs: vec!["update".into()],
            kinds: vec!["ReplicaGroup".into()],
            resource_names: vec!["web".into()],
        };
        assert!(rule.allows("update", "ReplicaGroup", Some("web")));
        assert!(!rule.allows("update", "ReplicaGroup", Some("api")));
        // list has no single name to check against
        assert!(!rule.allows("update", "ReplicaGroup", None));
    }

    #[test]
    fn wildcards_are_ordinary_rules() {
        let rule = AccessRule {
            verbs: vec!["*".into()],
            kinds: vec!["*".into()],
            resource_names: vec![],
        };
        assert!(rule.allows("evict", "WorkloadUnit", Some("web-0")));
        assert!(rule.is_wildcard());
    }
}
