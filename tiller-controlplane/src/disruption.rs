//! The disruption-budget controller: maintains eviction headroom.
//!
//! Keeps `status.disruptionsAllowed = currentHealthy − desiredHealthy` for
//! each budget. The gateway's evict verb decrements that count atomically
//! and aborts when it would go negative; this protects against voluntary
//! disruption only and has no effect on involuntary failures.
use std::{sync::Arc, time::Duration};
use tiller_api::{Api, Client};
use tiller_core::{
    kinds::{DisruptionBudget, DisruptionBudgetStatus, WorkloadUnit},
    ErrorResponse, ListParams, Reason, ResourceExt,
};
use tiller_runtime::{Action, Controller};
use tracing::{instrument, warn};

/// Static disruption controller configuration
#[derive(Clone, Debug)]
pub struct DisruptionConfig {
    /// How often budgets are re-evaluated even without budget events
    pub reevaluation_interval: Duration,
}

impl Default for DisruptionConfig {
    fn default() -> Self {
        Self {
            reevaluation_interval: Duration::from_secs(10),
        }
    }
}

/// Shared state of the disruption controller
pub struct Context {
    /// Gateway access as the controller identity
    pub client: Client,
    /// Static configuration
    pub config: DisruptionConfig,
}

/// The accounting a budget should currently carry
pub fn derive_status(budget: &DisruptionBudget, units: &[WorkloadUnit]) -> DisruptionBudgetStatus {
    let matching: Vec<&WorkloadUnit> = units
        .iter()
        .filter(|u| budget.spec.selector.matches(u.labels()))
        .filter(|u| !u.phase().is_terminal() && !u.is_deleting())
        .collect();
    let total = matching.len() as u32;
    let healthy = matching.iter().filter(|u| u.is_ready()).count() as u32;

    let desired_healthy = match (budget.spec.min_available, budget.spec.max_unavailable) {
        (Some(min), _) => min,
        (None, Some(max)) => total.saturating_sub(max),
        // admission guarantees one bound is set; an unset budget allows
        // nothing rather than everything
        (None, None) => total,
    };

    DisruptionBudgetStatus {
        current_healthy: healthy,
        desired_healthy,
        disruptions_allowed: healthy.saturating_sub(desired_healthy),
    }
}

/// One reconciliation pass over a single budget
#[instrument(level = "debug", skip_all, fields(budget = %budget.name_any()))]
pub async fn reconcile(budget: Arc<DisruptionBudget>, ctx: Arc<Context>) -> Result<Action, ErrorResponse> {
    let tick = Action::requeue(ctx.config.reevaluation_interval);
    let Some(namespace) = budget.namespace() else {
        return Ok(Action::await_change());
    };
    if budget.is_deleting() {
        return Ok(Action::await_change());
    }

    let units: Api<WorkloadUnit> = Api::namespaced(ctx.client.clone(), &namespace);
    let all = units.list(&ListParams::default()).await?.items;
    let status = derive_status(&budget, &all);

    if budget.status.as_ref() == Some(&status) {
        return Ok(tick);
    }
    let budgets: Api<DisruptionBudget> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut updated = (*budget).clone();
    updated.status = Some(status);
    match budgets.replace_status(&updated).await {
        Ok(_) => Ok(tick),
        // an eviction decremented the budget under us; re-derive next tick
        Err(err) if err.reason == Reason::Conflict => Ok(tick),
        Err(err) => Err(err),
    }
}

/// Retry policy: defer to the loop's exponential backoff
pub fn error_policy(budget: Arc<DisruptionBudget>, err: &ErrorResponse, _ctx: Arc<Context>) -> Action {
    warn!(budget = %budget.name_any(), error = %err, "budget reconciliation failed");
    Action::await_change()
}

/// Runs the disruption controller until the process ends
pub async fn run(client: Client, config: DisruptionConfig) {
    let api: Api<DisruptionBudget> = Api::all(client.clone());
    let ctx = Arc::new(Context { client, config });
    Controller::new(api).run(reconcile, error_policy, ctx).await;
}
