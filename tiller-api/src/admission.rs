//! The admission pipeline: mutation then validation, before persistence.
//!
//! Runs after authorization and before the optimistic-concurrency check.
//! Mutating admitters may rewrite the incoming object (defaults); validating
//! admitters may only reject. The built-in chain enforces the spec/status
//! ownership split and the envelope's immutability rules.
use serde_json::Value;
use tiller_core::{
    kinds::{DisruptionBudget, ReplicaGroup, ScalingPolicy, WorkloadUnit},
    ApiResource, DynamicObject, ErrorResponse, Result, Scope,
};

/// What the gateway is about to do with the object
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    /// First persistence of a new object
    Create,
    /// Replacement of client-owned state
    Update,
    /// Replacement of controller-owned state via the status subresource
    UpdateStatus,
}

/// Context handed to every admitter
pub struct AdmissionRequest<'a> {
    /// The operation being admitted
    pub operation: Operation,
    /// Kind information for the object
    pub resource: &'a ApiResource,
    /// The currently stored object, absent on `Create`
    pub old: Option<&'a DynamicObject>,
}

/// A mutating admitter; runs before all validators
pub trait Mutate: Send + Sync {
    /// May rewrite the incoming object, e.g. to inject defaults
    fn mutate(&self, req: &AdmissionRequest<'_>, obj: &mut DynamicObject) -> Result<()>;
}

/// A validating admitter; may only reject
pub trait Validate: Send + Sync {
    /// Rejects with `Invalid` when the object violates a rule
    fn validate(&self, req: &AdmissionRequest<'_>, obj: &DynamicObject) -> Result<()>;
}

/// The ordered chain of mutating then validating admitters
pub struct AdmissionChain {
    mutators: Vec<Box<dyn Mutate>>,
    validators: Vec<Box<dyn Validate>>,
}

impl AdmissionChain {
    /// The built-in chain every gateway runs
    pub fn builtin() -> Self {
        Self {
            mutators: vec![Box::new(Defaulter)],
            validators: vec![
                Box::new(NameRules),
                Box::new(StatusOwnership),
                Box::new(Immutability),
                Box::new(KindRules),
            ],
        }
    }

    /// Appends a custom mutating admitter
    pub fn push_mutator(&mut self, mutator: Box<dyn Mutate>) {
        self.mutators.push(mutator);
    }

    /// Appends a custom validating admitter
    pub fn push_validator(&mut self, validator: Box<dyn Validate>) {
        self.validators.push(validator);
    }

    /// Runs the full chain
    pub fn admit(&self, req: &AdmissionRequest<'_>, obj: &mut DynamicObject) -> Result<()> {
        for mutator in &self.mutators {
            mutator.mutate(req, obj)?;
        }
        for validator in &self.validators {
            validator.validate(req, obj)?;
        }
        Ok(())
    }
}

fn subtree<'v>(obj: &'v DynamicObject, field: &str) -> &'v Value {
    obj.data.get(field).unwrap_or(&Value::Null)
}

/// Injects defaults into the incoming object
struct Defaulter;

impl Mutate for Defaulter {
    fn mutate(&self, req: &AdmissionRequest<'_>, obj: &mut DynamicObject) -> Result<()> {
        match req.resource.scope {
            Scope::Namespaced => {
                if obj.metadata.namespace.is_none() {
                    obj.metadata.namespace = Some("default".to_string());
                }
            }
            Scope::Cluster => obj.metadata.namespace = None,
        }
        Ok(())
    }
}

/// Structural rules on names and namespaces
struct NameRules;

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

impl Validate for NameRules {
    fn validate(&self, req: &AdmissionRequest<'_>, obj: &DynamicObject) -> Result<()> {
        let name = obj
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ErrorResponse::invalid("metadata.name is required"))?;
        if !valid_name(name) {
            return Err(ErrorResponse::invalid(format!(
                "metadata.name {name:?} must be a lowercase dns-style label"
            )));
        }
        if req.resource.scope == Scope::Namespaced && obj.metadata.namespace.is_none() {
            return Err(ErrorResponse::invalid("metadata.namespace is required"));
        }
        Ok(())
    }
}

/// Enforces that `spec` is client-owned and `status` controller-owned.
///
/// Violating this split is the most common source of update-conflict
/// storms, so it is rejected here rather than silently corrected.
struct StatusOwnership;

impl Validate for StatusOwnership {
    fn validate(&self, req: &AdmissionRequest<'_>, obj: &DynamicObject) -> Result<()> {
        match req.operation {
            Operation::Create => {
                if !subtree(obj, "status").is_null() {
                    return Err(ErrorResponse::invalid("status is controller-owned and cannot be set on create"));
                }
            }
            Operation::Update => {
                let old = req.old.expect("update admission always has the stored object");
                if subtree(obj, "status") != subtree(old, "status") {
                    return Err(ErrorResponse::invalid("status is controller-owned; use the status subresource"));
                }
            }
            Operation::UpdateStatus => {
                let old = req.old.expect("update admission always has the stored object");
                if subtree(obj, "spec") != subtree(old, "spec") {
                    return Err(ErrorResponse::invalid("spec is client-owned and cannot change via the status subresource"));
                }
                if obj.metadata.labels != old.metadata.labels
                    || obj.metadata.finalizers != old.metadata.finalizers
                    || obj.metadata.owner_references != old.metadata.owner_references
                {
                    return Err(ErrorResponse::invalid("metadata cannot change via the status subresource"));
                }
            }
        }
        Ok(())
    }
}

/// Envelope and kind-specific immutable fields
struct Immutability;

impl Validate for Immutability {
    fn validate(&self, req: &AdmissionRequest<'_>, obj: &DynamicObject) -> Result<()> {
        let Some(old) = req.old else {
            return Ok(());
        };

        if obj.metadata.name != old.metadata.name {
            return Err(ErrorResponse::invalid("metadata.name is immutable"));
        }
        if obj.metadata.namespace != old.metadata.namespace {
            return Err(ErrorResponse::invalid("metadata.namespace is immutable"));
        }
        if obj.metadata.uid.is_some() && obj.metadata.uid != old.metadata.uid {
            return Err(ErrorResponse::invalid("metadata.uid is immutable"));
        }
        if obj.metadata.deletion_timestamp != old.metadata.deletion_timestamp {
            return Err(ErrorResponse::invalid("metadata.deletionTimestamp is store-managed"));
        }

        if req.operation == Operation::Update {
            match req.resource.kind.as_str() {
                "ReplicaGroup" | "RolloutSpec" | "ServiceEndpoint" | "DisruptionBudget" => {
                    let old_selector = subtree(old, "spec").get("selector");
                    let new_selector = subtree(obj, "spec").get("selector");
                    if old_selector != new_selector {
                        return Err(ErrorResponse::invalid(format!(
                            "spec.selector of an existing {} is immutable",
                            req.resource.kind
                        )));
                    }
                }
                "WorkloadUnit" => {
                    let old_node = subtree(old, "spec").get("nodeName");
                    let new_node = subtree(obj, "spec").get("nodeName");
                    if old_node.is_some_and(|n| !n.is_null()) && new_node != old_node {
                        return Err(ErrorResponse::invalid("spec.nodeName is immutable once bound"));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Per-kind structural validation, dispatched through the kind registry
struct KindRules;

impl Validate for KindRules {
    fn validate(&self, req: &AdmissionRequest<'_>, obj: &DynamicObject) -> Result<()> {
        if req.operation == Operation::UpdateStatus {
            return Ok(());
        }
        match req.resource.kind.as_str() {
            "WorkloadUnit" => {
                let unit: WorkloadUnit = parse(obj)?;
                if unit.spec.processes.is_empty() {
                    return Err(ErrorResponse::invalid("spec.processes must not be empty"));
                }
            }
            "ReplicaGroup" => {
                let group: ReplicaGroup = parse(obj)?;
                if !group.spec.selector.matches(&group.spec.template.labels) {
                    return Err(ErrorResponse::invalid("spec.template.labels must satisfy spec.selector"));
                }
            }
            "RolloutSpec" => {
                let rollout: tiller_core::kinds::RolloutSpec = parse(obj)?;
                if !rollout.spec.selector.matches(&rollout.spec.template.labels) {
                    return Err(ErrorResponse::invalid("spec.template.labels must satisfy spec.selector"));
                }
                if rollout.spec.max_unavailable > rollout.spec.replicas && rollout.spec.replicas > 0 {
                    return Err(ErrorResponse::invalid("spec.maxUnavailable cannot exceed spec.replicas"));
                }
            }
            "DisruptionBudget" => {
                let budget: DisruptionBudget = parse(obj)?;
                let bounds = [budget.spec.min_available.is_some(), budget.spec.max_unavailable.is_some()];
                if bounds.iter().filter(|set| **set).count() != 1 {
                    return Err(ErrorResponse::invalid(
                        "exactly one of spec.minAvailable and spec.maxUnavailable must be set",
                    ));
                }
            }
            "ScalingPolicy" => {
                let policy: ScalingPolicy = parse(obj)?;
                if policy.spec.min_replicas > policy.spec.max_replicas {
                    return Err(ErrorResponse::invalid("spec.minReplicas cannot exceed spec.maxReplicas"));
                }
                if policy.spec.target_utilization <= 0.0 {
                    return Err(ErrorResponse::invalid("spec.targetUtilization must be positive"));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn parse<K: tiller_core::Resource + serde::de::DeserializeOwned>(obj: &DynamicObject) -> Result<K> {
    obj.try_parse()
        .map_err(|err| ErrorResponse::invalid(format!("malformed object: {err}")))
}
