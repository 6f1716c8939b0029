//! The endpoint controller: maintains readiness-gated member lists.
//!
//! Membership tracks readiness, not existence: a unit failing its
//! readiness probe leaves the list without being deleted. A short settle
//! window debounces rapid readiness flapping so the dataplane is not
//! thrashed by transient health-check noise.
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tiller_api::{Api, Client};
use tiller_core::{
    kinds::{EndpointMember, ServiceEndpoint, ServiceEndpointStatus, WorkloadUnit},
    ErrorResponse, ListParams, Reason, ResourceExt,
};
use tiller_runtime::{Action, Controller, ObjectRef};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Static endpoint controller configuration
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// Minimum spacing between two membership writes for one endpoint
    pub settle_window: Duration,
    /// How often membership is re-derived even without unit events
    pub reevaluation_interval: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            settle_window: Duration::from_secs(3),
            reevaluation_interval: Duration::from_secs(15),
        }
    }
}

/// Shared state of the endpoint controller
pub struct Context {
    /// Gateway access as the controller identity
    pub client: Client,
    /// Static configuration
    pub config: EndpointConfig,
    /// When each endpoint's membership was last rewritten
    last_writes: Mutex<ahash::HashMap<ObjectRef, Instant>>,
}

impl Context {
    /// Fresh controller state
    pub fn new(client: Client, config: EndpointConfig) -> Self {
        Self {
            client,
            config,
            last_writes: Mutex::new(ahash::HashMap::default()),
        }
    }
}

/// The members an endpoint should currently route to: Ready matching units
/// with a reported address
pub fn derive_members(endpoint: &ServiceEndpoint, units: &[WorkloadUnit]) -> Vec<EndpointMember> {
    let mut members: Vec<EndpointMember> = units
        .iter()
        .filter(|unit| endpoint.spec.selector.matches(unit.labels()))
        .filter(|unit| !unit.is_deleting() && unit.is_ready())
        .filter_map(|unit| {
            unit.status.as_ref().and_then(|s| s.unit_ip.clone()).map(|ip| EndpointMember {
                ip,
                port: endpoint.spec.port,
            })
        })
        .collect();
    members.sort();
    members.dedup();
    members
}

/// One reconciliation pass over a single endpoint
#[instrument(level = "debug", skip_all, fields(endpoint = %endpoint.name_any()))]
pub async fn reconcile(endpoint: Arc<ServiceEndpoint>, ctx: Arc<Context>) -> Result<Action, ErrorResponse> {
    let Some(namespace) = endpoint.namespace() else {
        return Ok(Action::await_change());
    };
    let units: Api<WorkloadUnit> = Api::namespaced(ctx.client.clone(), &namespace);
    let endpoints: Api<ServiceEndpoint> = Api::namespaced(ctx.client.clone(), &namespace);

    let all = units.list(&ListParams::default()).await?.items;
    let members = derive_members(&endpoint, &all);
    let current = endpoint
        .status
        .as_ref()
        .map(|s| s.members.clone())
        .unwrap_or_default();

    if members == current {
        return Ok(Action::requeue(ctx.config.reevaluation_interval));
    }

    let key = ObjectRef::from_obj(endpoint.as_ref());
    if let Some(last) = ctx.last_writes.lock().get(&key) {
        let elapsed = last.elapsed();
        if elapsed < ctx.config.settle_window {
            // flapping guard: postpone the rewrite until the window passes
            debug!(endpoint = %endpoint.name_any(), "membership changed within settle window, deferring");
            return Ok(Action::requeue(ctx.config.settle_window - elapsed));
        }
    }

    let mut updated = (*endpoint).clone();
    updated.status = Some(ServiceEndpointStatus { members });
    match endpoints.replace_status(&updated).await {
        Ok(_) => {
            ctx.last_writes.lock().insert(key, Instant::now());
            Ok(Action::requeue(ctx.config.reevaluation_interval))
        }
        Err(err) if err.reason == Reason::Conflict => {
            // the endpoint changed under us; the watch event re-wakes us
            Ok(Action::await_change())
        }
        Err(err) => Err(err),
    }
}

/// Retry policy: defer to the loop's exponential backoff
pub fn error_policy(endpoint: Arc<ServiceEndpoint>, err: &ErrorResponse, _ctx: Arc<Context>) -> Action {
    warn!(endpoint = %endpoint.name_any(), error = %err, "endpoint reconciliation failed");
    Action::await_change()
}

/// Runs the endpoint controller until the process ends
pub async fn run(client: Client, config: EndpointConfig) {
    let api: Api<ServiceEndpoint> = Api::all(client.clone());
    let ctx = Arc::new(Context::new(client, config));
    Controller::new(api).run(reconcile, error_policy, ctx).await;
}
