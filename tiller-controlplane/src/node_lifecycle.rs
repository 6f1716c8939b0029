//! The node lifecycle controller: fails over nodes whose agent went quiet.
//!
//! Agents heartbeat into `status.heartbeatTime`; when a heartbeat ages past
//! the grace window the node's Ready condition is flipped false, taking it
//! out of the scheduler's feasible set. The condition flips back as soon as
//! the agent reports in again.
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tiller_api::{Api, Client};
use tiller_core::{
    kinds::{condition_is_true, set_condition, Condition, Node, CONDITION_READY},
    ErrorResponse, Reason, ResourceExt,
};
use tiller_runtime::{Action, Controller};
use tracing::{info, instrument, warn};

/// Static node lifecycle configuration
#[derive(Clone, Debug)]
pub struct NodeLifecycleConfig {
    /// How stale a heartbeat may be before the node is marked NotReady
    pub heartbeat_grace: Duration,
    /// Spacing between liveness checks per node
    pub check_interval: Duration,
}

impl Default for NodeLifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat_grace: Duration::from_secs(40),
            check_interval: Duration::from_secs(10),
        }
    }
}

/// Shared state of the node lifecycle controller
pub struct Context {
    /// Gateway access as the controller identity
    pub client: Client,
    /// Static configuration
    pub config: NodeLifecycleConfig,
}

fn heartbeat_expired(node: &Node, grace: Duration) -> bool {
    let Some(status) = &node.status else {
        return false;
    };
    match status.heartbeat_time {
        Some(beat) => {
            Utc::now().signed_duration_since(beat)
                > chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX)
        }
        // registered but never reported; treat as expired
        None => true,
    }
}

/// One liveness check over a single node
#[instrument(level = "debug", skip_all, fields(node = %node.name_any()))]
pub async fn reconcile(node: Arc<Node>, ctx: Arc<Context>) -> Result<Action, ErrorResponse> {
    let tick = Action::requeue(ctx.config.check_interval);
    if node.status.is_none() || node.is_deleting() {
        return Ok(tick);
    }

    let expired = heartbeat_expired(&node, ctx.config.heartbeat_grace);
    let currently_ready = node.is_ready();
    if !(expired && currently_ready) {
        // healthy, already NotReady, or not yet reporting; nothing to write
        return Ok(tick);
    }

    info!(node = %node.name_any(), "heartbeat timed out, marking NotReady");
    let nodes: Api<Node> = Api::all(ctx.client.clone());
    let mut updated = (*node).clone();
    let status = updated.status.as_mut().expect("checked above");
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_READY, false, "HeartbeatTimeout"),
    );
    debug_assert!(!condition_is_true(&status.conditions, CONDITION_READY));
    match nodes.replace_status(&updated).await {
        Ok(_) => Ok(tick),
        // the agent came back mid-write; its heartbeat wins
        Err(err) if err.reason == Reason::Conflict => Ok(tick),
        Err(err) => Err(err),
    }
}

/// Retry policy: defer to the loop's exponential backoff
pub fn error_policy(node: Arc<Node>, err: &ErrorResponse, _ctx: Arc<Context>) -> Action {
    warn!(node = %node.name_any(), error = %err, "node liveness check failed");
    Action::await_change()
}

/// Runs the node lifecycle controller until the process ends
pub async fn run(client: Client, config: NodeLifecycleConfig) {
    let api: Api<Node> = Api::all(client.clone());
    let ctx = Arc::new(Context { client, config });
    Controller::new(api).run(reconcile, error_policy, ctx).await;
}
