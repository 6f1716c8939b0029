//! The authorization engine: default-deny evaluation of access bindings.
use crate::store::{ObjectKey, ObjectStore};
use std::sync::Arc;
use tiller_core::{
    kinds::{AccessBinding, AccessPolicy, BindingScope, SubjectKind},
    ApiResource, ErrorResponse, Result,
};

/// An authenticated caller, resolved upstream of the gateway.
///
/// Identity verification itself is an external collaborator; the engine
/// only evaluates what a resolved identity may do.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Identity {
    /// User name
    pub user: String,
    /// Groups the user belongs to
    pub groups: Vec<String>,
}

impl Identity {
    /// An ordinary user with no group memberships
    pub fn user(name: &str) -> Self {
        Self {
            user: name.to_string(),
            groups: Vec::new(),
        }
    }

    /// A control-plane component identity, member of the superuser group
    pub fn system(component: &str) -> Self {
        Self {
            user: format!("system:{component}"),
            groups: vec![SUPERUSER_GROUP.to_string()],
        }
    }
}

/// Members of this group bypass rule evaluation entirely
pub const SUPERUSER_GROUP: &str = "system:admin";

/// The verbs the gateway dispatches on
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verb {
    /// Read one object
    Get,
    /// Read a collection
    List,
    /// Stream a collection's changes
    Watch,
    /// Persist a new object
    Create,
    /// Replace an object's client-owned state
    Update,
    /// Replace an object's controller-owned state
    UpdateStatus,
    /// Request deletion
    Delete,
    /// Voluntarily evict a workload unit, subject to disruption budgets
    Evict,
}

impl Verb {
    /// The wire name rules are written against
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::List => "list",
            Verb::Watch => "watch",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::UpdateStatus => "update_status",
            Verb::Delete => "delete",
            Verb::Evict => "evict",
        }
    }
}

/// One authorization question
#[derive(Clone, Debug)]
pub struct Attributes<'a> {
    /// Who is asking
    pub identity: &'a Identity,
    /// What they want to do
    pub verb: Verb,
    /// On which kind
    pub kind: &'a str,
    /// In which namespace; `None` means cluster scope (cluster-scoped
    /// kinds, or collection access across all namespaces)
    pub namespace: Option<&'a str>,
    /// On which object, when the verb targets a single one
    pub name: Option<&'a str>,
}

/// Evaluates [`Attributes`] against the stored access bindings.
///
/// Absence of a matching rule is a rejection, never an implicit allow.
pub struct Authorizer {
    store: Arc<ObjectStore>,
    binding_resource: ApiResource,
    policy_resource: ApiResource,
}

impl Authorizer {
    /// An authorizer reading bindings and policies from the given store
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self {
            store,
            binding_resource: ApiResource::erase::<AccessBinding>(),
            policy_resource: ApiResource::erase::<AccessPolicy>(),
        }
    }

    /// Allow or reject; rejects with `Forbidden` carrying the denied triple
    pub fn authorize(&self, attr: &Attributes<'_>) -> Result<()> {
        if attr.identity.groups.iter().any(|g| g == SUPERUSER_GROUP) {
            return Ok(());
        }

        let (bindings, _) = self.store.list(&self.binding_resource.kind_key(), None);
        for dynamic in bindings {
            let Ok(binding) = dynamic.try_parse::<AccessBinding>() else {
                continue;
            };
            if !self.binding_names(&binding, attr.identity) {
                continue;
            }
            match binding.spec.scope {
                BindingScope::Cluster => {}
                BindingScope::Namespace => {
                    // namespace-scoped grants never cover cluster-scope
                    // requests, including cross-namespace collection access
                    if attr.namespace.is_none()
                        || binding.metadata.namespace.as_deref() != attr.namespace
                    {
                        continue;
                    }
                }
            }
            if self.policy_allows(&binding, attr) {
                return Ok(());
            }
        }

        Err(ErrorResponse::forbidden(format!(
            "{} cannot {} {} {}",
            attr.identity.user,
            attr.verb.as_str(),
            attr.kind,
            attr.name.unwrap_or("*"),
        )))
    }

    fn binding_names(&self, binding: &AccessBinding, identity: &Identity) -> bool {
        binding.spec.subjects.iter().any(|subject| match subject.kind {
            SubjectKind::User => subject.name == identity.user,
            SubjectKind::Group => identity.groups.iter().any(|g| *g == subject.name),
        })
    }

    fn policy_allows(&self, binding: &AccessBinding, attr: &Attributes<'_>) -> bool {
        let policy_ns = binding
            .spec
            .policy_ref
            .namespace
            .clone()
            .or_else(|| binding.metadata.namespace.clone());
        let key = ObjectKey::new(
            &self.policy_resource,
            policy_ns.as_deref(),
            &binding.spec.policy_ref.name,
        );
        let Some(dynamic) = self.store.get(&key) else {
            return false;
        };
        let Ok(policy) = dynamic.try_parse::<AccessPolicy>() else {
            return false;
        };
        policy
            .spec
            .rules
            .iter()
            .any(|rule| rule.allows(attr.verb.as_str(), attr.kind, attr.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_core::kinds::{AccessRule, PolicyRef, Subject};
    use tiller_core::DynamicObject;

    fn seed(store: &Arc<ObjectStore>, scope: BindingScope) {
        let policy_resource = ApiResource::erase::<AccessPolicy>();
        let mut policy = AccessPolicy::new("unit-reader");
        policy.metadata.namespace = Some("default".into());
        policy.spec.rules = vec![AccessRule {
            verbs: vec!["get".into(), "list".into()],
            kinds: vec!["WorkloadUnit".into()],
            resource_names: vec![],
        }];
        store
            .insert(
                ObjectKey::new(&policy_resource, Some("default"), "unit-reader"),
                DynamicObject::from_typed(&policy).unwrap(),
            )
            .unwrap();

        let binding_resource = ApiResource::erase::<AccessBinding>();
        let mut binding = AccessBinding::new("alice-reads-units");
        binding.metadata.namespace = Some("default".into());
        binding.spec.subjects = vec![Subject {
            kind: SubjectKind::User,
            name: "alice".into(),
        }];
        binding.spec.policy_ref = PolicyRef {
            namespace: None,
            name: "unit-reader".into(),
        };
        binding.spec.scope = scope;
        store
            .insert(
                ObjectKey::new(&binding_resource, Some("default"), "alice-reads-units"),
                DynamicObject::from_typed(&binding).unwrap(),
            )
            .unwrap();
    }

    fn attr<'a>(identity: &'a Identity, verb: Verb, namespace: Option<&'a str>) -> Attributes<'a> {
        Attributes {
            identity,
            verb,
            kind: "WorkloadUnit",
            namespace,
            name: None,
        }
    }

    #[test]
    fn default_is_deny() {
        let store = ObjectStore::new(16);
        let authorizer = Authorizer::new(store);
        let alice = Identity::user("alice");
        let err = authorizer.authorize(&attr(&alice, Verb::Get, Some("default"))).unwrap_err();
        assert_eq!(err.reason, tiller_core::Reason::Forbidden);
    }

    #[test]
    fn binding_grants_within_its_namespace_only() {
        let store = ObjectStore::new(16);
        seed(&store, BindingScope::Namespace);
        let authorizer = Authorizer::new(store);
        let alice = Identity::user("alice");

        assert!(authorizer.authorize(&attr(&alice, Verb::List, Some("default"))).is_ok());
        assert!(authorizer.authorize(&attr(&alice, Verb::List, Some("prod"))).is_err());
        // cross-namespace collection access needs a cluster binding
        assert!(authorizer.authorize(&attr(&alice, Verb::List, None)).is_err());
        // verbs outside the policy stay denied
        assert!(authorizer.authorize(&attr(&alice, Verb::Delete, Some("default"))).is_err());
        // other identities stay denied
        let bob = Identity::user("bob");
        assert!(authorizer.authorize(&attr(&bob, Verb::List, Some("default"))).is_err());
    }

    #[test]
    fn cluster_binding_grants_everywhere() {
        let store = ObjectStore::new(16);
        seed(&store, BindingScope::Cluster);
        let authorizer = Authorizer::new(store);
        let alice = Identity::user("alice");
        assert!(authorizer.authorize(&attr(&alice, Verb::List, Some("prod"))).is_ok());
        assert!(authorizer.authorize(&attr(&alice, Verb::List, None)).is_ok());
    }

    #[test]
    fn superuser_group_bypasses_rules() {
        let store = ObjectStore::new(16);
        let authorizer = Authorizer::new(store);
        let scheduler = Identity::system("scheduler");
        assert!(authorizer
            .authorize(&attr(&scheduler, Verb::Update, Some("default")))
            .is_ok());
    }
}
