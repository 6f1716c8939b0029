//! The API gateway: the only reader and writer of the object store.
//!
//! Every mutating call passes Authorization, then Admission, then the
//! optimistic-concurrency check, then the store write and its watch event
//! emission, in that order. Acceptance of desired state is decoupled from
//! achievement of desired state: a create returns as soon as the object is
//! persisted, and later reconciliation problems surface only on `status`.
use crate::{
    admission::{AdmissionChain, AdmissionRequest, Operation},
    authz::{Attributes, Authorizer, Identity, Verb},
    store::{ObjectKey, ObjectStore},
};
use ahash::HashMap;
use chrono::Utc;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tiller_core::{
    kinds::{self, DisruptionBudget, WorkloadUnit},
    ApiResource, DeleteParams, DynamicObject, ErrorResponse, ListParams, Result, Scope,
    WatchEvent,
};
use tracing::{debug, instrument, warn};

/// Static gateway configuration, fixed at construction
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Watch events retained per kind before compaction
    pub watch_history_limit: usize,
    /// Attempts at the eviction budget compare-and-swap before giving up
    pub eviction_retries: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            watch_history_limit: 1024,
            eviction_retries: 5,
        }
    }
}

/// The explicit lookup table components dispatch on instead of inheritance
pub struct KindRegistry {
    by_kind: HashMap<String, ApiResource>,
}

impl KindRegistry {
    /// A registry holding every built-in kind
    pub fn builtin() -> Self {
        let mut by_kind = HashMap::default();
        for resource in kinds::builtin_resources() {
            by_kind.insert(resource.kind.clone(), resource);
        }
        Self { by_kind }
    }

    /// Resolve a kind name; unknown kinds are a client error
    pub fn resolve(&self, kind: &str) -> Result<&ApiResource> {
        self.by_kind
            .get(kind)
            .ok_or_else(|| ErrorResponse::invalid(format!("unknown kind {kind:?}")))
    }
}

/// The in-process API gateway
pub struct Gateway {
    store: Arc<ObjectStore>,
    registry: KindRegistry,
    chain: AdmissionChain,
    authorizer: Authorizer,
    config: GatewayConfig,
}

impl Gateway {
    /// A gateway over a fresh store, with the built-in kind registry and
    /// admission chain
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let store = ObjectStore::new(config.watch_history_limit);
        Arc::new(Self {
            authorizer: Authorizer::new(store.clone()),
            store,
            registry: KindRegistry::builtin(),
            chain: AdmissionChain::builtin(),
            config,
        })
    }

    /// Same as [`Gateway::new`] with extra admitters appended to the
    /// built-in chain
    pub fn with_admission(config: GatewayConfig, chain: AdmissionChain) -> Arc<Self> {
        let store = ObjectStore::new(config.watch_history_limit);
        Arc::new(Self {
            authorizer: Authorizer::new(store.clone()),
            store,
            registry: KindRegistry::builtin(),
            chain,
            config,
        })
    }

    /// The kind registry, for callers that dispatch dynamically
    pub fn registry(&self) -> &KindRegistry {
        &self.registry
    }

    /// The store revision of the most recent write; used by tests asserting
    /// reconciliation idempotence (zero additional writes)
    pub fn latest_revision(&self) -> u64 {
        self.store.latest_revision()
    }

    fn authorize(
        &self,
        identity: &Identity,
        verb: Verb,
        kind: &str,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> Result<()> {
        self.authorizer.authorize(&Attributes {
            identity,
            verb,
            kind,
            namespace,
            name,
        })
    }

    fn key_for(&self, resource: &ApiResource, namespace: Option<&str>, obj: &DynamicObject) -> Result<ObjectKey> {
        let name = obj
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ErrorResponse::invalid("metadata.name is required"))?;
        Ok(ObjectKey::new(resource, namespace.or(obj.metadata.namespace.as_deref()), name))
    }

    /// Persist a new object
    #[instrument(level = "debug", skip_all, fields(name = ?obj.metadata.name))]
    pub fn create(&self, identity: &Identity, namespace: Option<&str>, mut obj: DynamicObject) -> Result<DynamicObject> {
        let resource = self.resource_of(&obj)?.clone();
        let namespace = effective_namespace(&resource, namespace, &obj);
        self.authorize(identity, Verb::Create, &resource.kind, namespace.as_deref(), obj.metadata.name.as_deref())?;

        if let Some(ns) = &namespace {
            obj.metadata.namespace = Some(ns.clone());
        }
        self.chain.admit(
            &AdmissionRequest {
                operation: Operation::Create,
                resource: &resource,
                old: None,
            },
            &mut obj,
        )?;

        obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        obj.metadata.creation_timestamp = Some(Utc::now());
        obj.metadata.resource_version = None;
        obj.metadata.deletion_timestamp = None;

        let key = self.key_for(&resource, namespace.as_deref(), &obj)?;
        debug!(%key, "creating object");
        self.store.insert(key, obj)
    }

    /// Replace an object's client-owned state, conditional on its
    /// `resourceVersion`
    #[instrument(level = "debug", skip_all, fields(name = ?obj.metadata.name))]
    pub fn update(&self, identity: &Identity, namespace: Option<&str>, obj: DynamicObject) -> Result<DynamicObject> {
        self.write(identity, namespace, obj, Verb::Update, Operation::Update)
    }

    /// Replace an object's controller-owned state through the status
    /// subresource
    #[instrument(level = "debug", skip_all, fields(name = ?obj.metadata.name))]
    pub fn update_status(&self, identity: &Identity, namespace: Option<&str>, obj: DynamicObject) -> Result<DynamicObject> {
        self.write(identity, namespace, obj, Verb::UpdateStatus, Operation::UpdateStatus)
    }

    fn write(
        &self,
        identity: &Identity,
        namespace: Option<&str>,
        mut obj: DynamicObject,
        verb: Verb,
        operation: Operation,
    ) -> Result<DynamicObject> {
        let resource = self.resource_of(&obj)?.clone();
        let namespace = effective_namespace(&resource, namespace, &obj);
        self.authorize(identity, verb, &resource.kind, namespace.as_deref(), obj.metadata.name.as_deref())?;

        let key = self.key_for(&resource, namespace.as_deref(), &obj)?;
        let old = self
            .store
            .get(&key)
            .ok_or_else(|| ErrorResponse::not_found(format!("{key} not found")))?;

        // reject stale writes up front so a losing compare-and-swap always
        // surfaces as Conflict, not as whatever admission would say about a
        // diff against an object the caller never saw; the store re-checks
        // atomically below
        let expected = obj
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| ErrorResponse::invalid("metadata.resourceVersion is required for updates"))?;
        if old.metadata.resource_version.as_deref() != Some(expected.as_str()) {
            return Err(ErrorResponse::conflict(format!(
                "{key}: resourceVersion {expected} is stale"
            )));
        }

        self.chain.admit(
            &AdmissionRequest {
                operation,
                resource: &resource,
                old: Some(&old),
            },
            &mut obj,
        )?;

        // server-managed fields always carry over from the stored object
        obj.metadata.uid = old.metadata.uid.clone();
        obj.metadata.creation_timestamp = old.metadata.creation_timestamp;
        obj.metadata.deletion_timestamp = old.metadata.deletion_timestamp;

        self.store.update(key, obj, &expected)
    }

    /// Request deletion; returns the final (or deleting) object state
    #[instrument(level = "debug", skip_all, fields(kind, namespace, name))]
    pub fn delete(
        &self,
        identity: &Identity,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
        params: &DeleteParams,
    ) -> Result<DynamicObject> {
        let resource = self.registry.resolve(kind)?.clone();
        self.authorize(identity, Verb::Delete, &resource.kind, namespace, Some(name))?;
        let key = ObjectKey::new(&resource, namespace, name);
        debug!(%key, "deleting object");
        self.store.delete(&key, params.preconditions_resource_version.as_deref())
    }

    /// Fetch one object
    pub fn get(&self, identity: &Identity, kind: &str, namespace: Option<&str>, name: &str) -> Result<DynamicObject> {
        let resource = self.registry.resolve(kind)?.clone();
        self.authorize(identity, Verb::Get, &resource.kind, namespace, Some(name))?;
        let key = ObjectKey::new(&resource, namespace, name);
        self.store
            .get(&key)
            .ok_or_else(|| ErrorResponse::not_found(format!("{key} not found")))
    }

    /// Snapshot a collection, with the revision the snapshot was taken at
    pub fn list(
        &self,
        identity: &Identity,
        kind: &str,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<(Vec<DynamicObject>, u64)> {
        let resource = self.registry.resolve(kind)?.clone();
        self.authorize(identity, Verb::List, &resource.kind, namespace, None)?;
        let (items, revision) = self.store.list(&resource.kind_key(), namespace);
        let items = items
            .into_iter()
            .filter(|obj| params.accepts(&obj.metadata.labels))
            .collect();
        Ok((items, revision))
    }

    /// An ordered, gap-free event stream for a kind, starting after
    /// `from_revision`.
    ///
    /// When the store can no longer serve that revision the stream yields
    /// an `Expired` error and ends; the caller must re-list and resume from
    /// the fresh list revision. This is a mandatory property: every
    /// consumer is level-triggered and must be able to resync from scratch
    /// after any gap.
    pub fn watch(
        &self,
        identity: &Identity,
        kind: &str,
        namespace: Option<String>,
        from_revision: u64,
    ) -> Result<impl Stream<Item = Result<WatchEvent<DynamicObject>>> + Send> {
        let resource = self.registry.resolve(kind)?.clone();
        self.authorize(identity, Verb::Watch, &resource.kind, namespace.as_deref(), None)?;
        let stream = self
            .store
            .clone()
            .watch(&resource.kind_key(), from_revision)
            .filter(move |item| {
                let keep = match item {
                    Ok(event) => {
                        namespace.is_none() || event.object().metadata.namespace == namespace
                    }
                    Err(_) => true,
                };
                futures::future::ready(keep)
            });
        Ok(stream)
    }

    /// Voluntarily evict a workload unit.
    ///
    /// Attempts to atomically decrement `disruptionsAllowed` on the
    /// matching disruption budget before deleting; aborts with
    /// `TooManyRequests` when the budget is exhausted (or not yet
    /// evaluated). Involuntary failures never pass through here.
    #[instrument(level = "debug", skip_all, fields(namespace, name))]
    pub fn evict(&self, identity: &Identity, namespace: &str, name: &str) -> Result<DynamicObject> {
        let unit_resource = ApiResource::erase::<WorkloadUnit>();
        let budget_resource = ApiResource::erase::<DisruptionBudget>();
        self.authorize(identity, Verb::Evict, &unit_resource.kind, Some(namespace), Some(name))?;

        for _ in 0..self.config.eviction_retries {
            let unit_key = ObjectKey::new(&unit_resource, Some(namespace), name);
            let unit = self
                .store
                .get(&unit_key)
                .ok_or_else(|| ErrorResponse::not_found(format!("{unit_key} not found")))?;

            let (budgets, _) = self.store.list(&budget_resource.kind_key(), Some(namespace));
            let matching: Vec<DisruptionBudget> = budgets
                .iter()
                .filter_map(|b| b.try_parse::<DisruptionBudget>().ok())
                .filter(|b| b.spec.selector.matches(&unit.metadata.labels))
                .collect();

            match matching.len() {
                0 => return self.store.delete(&unit_key, None),
                1 => {}
                n => {
                    return Err(ErrorResponse::invalid(format!(
                        "{n} disruption budgets match {namespace}/{name}; eviction requires at most one"
                    )))
                }
            }
            let budget = &matching[0];

            let Some(status) = &budget.status else {
                return Err(ErrorResponse::too_many_requests(format!(
                    "budget {} has not been evaluated yet",
                    budget.metadata.name.as_deref().unwrap_or_default()
                )));
            };
            if status.disruptions_allowed == 0 {
                return Err(ErrorResponse::too_many_requests(format!(
                    "budget {} allows no further disruptions",
                    budget.metadata.name.as_deref().unwrap_or_default()
                )));
            }

            let mut decremented = budget.clone();
            decremented.status.as_mut().expect("checked above").disruptions_allowed =
                status.disruptions_allowed - 1;
            let budget_key = ObjectKey::new(
                &budget_resource,
                Some(namespace),
                budget.metadata.name.as_deref().unwrap_or_default(),
            );
            let dynamic = DynamicObject::from_typed(&decremented)
                .map_err(|err| ErrorResponse::invalid(err.to_string()))?;
            let expected = budget.metadata.resource_version.clone().unwrap_or_default();
            match self.store.update(budget_key, dynamic, &expected) {
                Ok(_) => return self.store.delete(&unit_key, None),
                Err(err) if err.reason == tiller_core::Reason::Conflict => {
                    // another evictor or the budget controller won the
                    // write; re-read and retry
                    warn!(namespace, name, "eviction budget write conflicted, retrying");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(ErrorResponse::conflict(format!(
            "eviction of {namespace}/{name} kept losing the budget write"
        )))
    }

    fn resource_of(&self, obj: &DynamicObject) -> Result<&ApiResource> {
        let types = obj
            .types
            .as_ref()
            .ok_or_else(|| ErrorResponse::invalid("apiVersion and kind are required"))?;
        let resource = self.registry.resolve(&types.kind)?;
        if resource.api_version != types.api_version {
            return Err(ErrorResponse::invalid(format!(
                "kind {} belongs to {}, not {}",
                types.kind, resource.api_version, types.api_version
            )));
        }
        Ok(resource)
    }
}

fn effective_namespace(resource: &ApiResource, namespace: Option<&str>, obj: &DynamicObject) -> Option<String> {
    match resource.scope {
        Scope::Cluster => None,
        Scope::Namespaced => namespace
            .map(String::from)
            .or_else(|| obj.metadata.namespace.clone()),
    }
}
