//! The scaling controller: horizontal autoscaling of replica targets.
//!
//! Every evaluation interval the controller reads the current metric
//! utilization for the target's selector and steers the target's replica
//! count toward `desired = ceil(current × metric / target)`, clamped to
//! `[min, max]`. Cooldown is asymmetric on purpose: adding capacity is
//! immediate, removing it waits out a cooldown window, because a late
//! scale-up costs availability while a late scale-down only costs money.
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tiller_api::{Api, Client};
use tiller_core::{
    kinds::{ReplicaGroup, RolloutSpec, ScalingPolicy, ScalingPolicyStatus},
    ErrorResponse, Reason, ResourceExt, Selector,
};
use tiller_runtime::{Action, Controller};
use tracing::{debug, info, instrument, warn};

/// Supplies the current metric utilization for a set of units.
///
/// External collaborator: the metrics pipeline is out of scope, only this
/// seam is specified. `None` means no data, in which case the controller
/// holds its position.
pub trait MetricsProvider: Send + Sync + 'static {
    /// Mean utilization (1.0 = exactly at target capacity) of the units
    /// matching `selector` in `namespace`
    fn utilization(&self, namespace: &str, selector: &Selector) -> Option<f64>;
}

/// Static scaling controller configuration
#[derive(Clone, Debug)]
pub struct AutoscalerConfig {
    /// Spacing between metric evaluations
    pub evaluation_interval: Duration,
    /// Relative dead band around the target within which no scaling happens
    pub tolerance: f64,
    /// Minimum spacing between two scale-downs of one policy
    pub scale_down_cooldown: Duration,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(15),
            tolerance: 0.1,
            scale_down_cooldown: Duration::from_secs(300),
        }
    }
}

/// Shared state of the scaling controller
pub struct Context {
    /// Gateway access as the controller identity
    pub client: Client,
    /// The metric utilization source
    pub metrics: Arc<dyn MetricsProvider>,
    /// Static configuration
    pub config: AutoscalerConfig,
}

/// The replica count a policy wants, given the observed utilization.
///
/// Returns `current` inside the tolerance band (hysteresis), otherwise
/// `ceil(current × ratio)` clamped to the policy's bounds.
pub fn desired_replicas(policy: &ScalingPolicy, current: u32, utilization: f64) -> u32 {
    let target = policy.spec.target_utilization;
    let ratio = utilization / target;
    let proposed = if (ratio - 1.0).abs() <= f64::EPSILON || current == 0 {
        current.max(policy.spec.min_replicas)
    } else {
        (current as f64 * ratio).ceil() as u32
    };
    proposed.clamp(policy.spec.min_replicas, policy.spec.max_replicas)
}

/// Whether the change is large enough to act on
fn outside_tolerance(utilization: f64, target: f64, tolerance: f64) -> bool {
    (utilization / target - 1.0).abs() > tolerance
}

enum Target {
    Group(ReplicaGroup),
    Rollout(RolloutSpec),
}

impl Target {
    fn replicas(&self) -> u32 {
        match self {
            Target::Group(g) => g.spec.replicas,
            Target::Rollout(r) => r.spec.replicas,
        }
    }

    fn selector(&self) -> &Selector {
        match self {
            Target::Group(g) => &g.spec.selector,
            Target::Rollout(r) => &r.spec.selector,
        }
    }
}

async fn load_target(ctx: &Context, namespace: &str, policy: &ScalingPolicy) -> Result<Option<Target>, ErrorResponse> {
    let name = &policy.spec.target_ref.name;
    match policy.spec.target_ref.kind.as_str() {
        "ReplicaGroup" => {
            let api: Api<ReplicaGroup> = Api::namespaced(ctx.client.clone(), namespace);
            Ok(api.get_opt(name).await?.map(Target::Group))
        }
        "RolloutSpec" => {
            let api: Api<RolloutSpec> = Api::namespaced(ctx.client.clone(), namespace);
            Ok(api.get_opt(name).await?.map(Target::Rollout))
        }
        other => {
            warn!(policy = %policy.name_any(), kind = other, "unsupported scaling target kind");
            Ok(None)
        }
    }
}

async fn write_target(ctx: &Context, namespace: &str, target: Target, replicas: u32) -> Result<(), ErrorResponse> {
    match target {
        Target::Group(mut group) => {
            group.spec.replicas = replicas;
            let api: Api<ReplicaGroup> = Api::namespaced(ctx.client.clone(), namespace);
            api.replace(&group).await?;
        }
        Target::Rollout(mut rollout) => {
            rollout.spec.replicas = replicas;
            let api: Api<RolloutSpec> = Api::namespaced(ctx.client.clone(), namespace);
            api.replace(&rollout).await?;
        }
    }
    Ok(())
}

/// One evaluation pass over a single policy
#[instrument(level = "debug", skip_all, fields(policy = %policy.name_any()))]
pub async fn reconcile(policy: Arc<ScalingPolicy>, ctx: Arc<Context>) -> Result<Action, ErrorResponse> {
    let tick = Action::requeue(ctx.config.evaluation_interval);
    let Some(namespace) = policy.namespace() else {
        return Ok(Action::await_change());
    };
    if policy.is_deleting() {
        return Ok(Action::await_change());
    }

    let Some(target) = load_target(&ctx, &namespace, &policy).await? else {
        debug!(policy = %policy.name_any(), "scaling target missing");
        return Ok(tick);
    };
    let Some(utilization) = ctx.metrics.utilization(&namespace, target.selector()) else {
        // no data: hold position rather than guessing
        return Ok(tick);
    };

    let current = target.replicas();
    let mut status = policy.status.clone().unwrap_or_default();
    status.observed_utilization = Some(utilization);

    let proposed = desired_replicas(&policy, current, utilization);
    let acting = proposed != current
        && (outside_tolerance(utilization, policy.spec.target_utilization, ctx.config.tolerance)
            || current < policy.spec.min_replicas
            || current > policy.spec.max_replicas);

    if acting && proposed < current {
        // scale-down only after the cooldown since the last one; scale-up
        // is never throttled this way
        let in_cooldown = status.last_scale_down.is_some_and(|last| {
            let elapsed = Utc::now().signed_duration_since(last);
            elapsed < chrono::Duration::from_std(ctx.config.scale_down_cooldown).unwrap_or_default()
        });
        if in_cooldown {
            debug!(policy = %policy.name_any(), "scale-down blocked by cooldown");
            return finish(&ctx, &namespace, &policy, status, tick).await;
        }
    }

    if acting {
        info!(
            policy = %policy.name_any(),
            current,
            desired = proposed,
            utilization,
            "scaling target"
        );
        match write_target(&ctx, &namespace, target, proposed).await {
            Ok(()) => {}
            // the target moved under us; next tick re-evaluates
            Err(err) if err.reason == Reason::Conflict => return Ok(tick),
            Err(err) => return Err(err),
        }
        status.desired_replicas = Some(proposed);
        if proposed < current {
            status.last_scale_down = Some(Utc::now());
        }
    } else {
        status.desired_replicas = Some(current);
    }

    finish(&ctx, &namespace, &policy, status, tick).await
}

async fn finish(
    ctx: &Context,
    namespace: &str,
    policy: &ScalingPolicy,
    status: ScalingPolicyStatus,
    tick: Action,
) -> Result<Action, ErrorResponse> {
    if policy.status.as_ref() == Some(&status) {
        return Ok(tick);
    }
    let api: Api<ScalingPolicy> = Api::namespaced(ctx.client.clone(), namespace);
    let mut updated = policy.clone();
    updated.status = Some(status);
    match api.replace_status(&updated).await {
        Ok(_) => Ok(tick),
        Err(err) if err.reason == Reason::Conflict => Ok(tick),
        Err(err) => Err(err),
    }
}

/// Retry policy: defer to the loop's exponential backoff
pub fn error_policy(policy: Arc<ScalingPolicy>, err: &ErrorResponse, _ctx: Arc<Context>) -> Action {
    warn!(policy = %policy.name_any(), error = %err, "scaling evaluation failed");
    Action::await_change()
}

/// Runs the scaling controller until the process ends
pub async fn run(client: Client, metrics: Arc<dyn MetricsProvider>, config: AutoscalerConfig) {
    let api: Api<ScalingPolicy> = Api::all(client.clone());
    let ctx = Arc::new(Context { client, metrics, config });
    Controller::new(api).run(reconcile, error_policy, ctx).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tiller_api::{Gateway, GatewayConfig, Identity};
    use tiller_core::kinds::{ProcessSpec, TargetRef, WorkloadTemplate};

    struct FakeMetrics {
        utilization: Mutex<Option<f64>>,
    }

    impl MetricsProvider for FakeMetrics {
        fn utilization(&self, _namespace: &str, _selector: &Selector) -> Option<f64> {
            *self.utilization.lock()
        }
    }

    fn client() -> Client {
        Client::new(Gateway::new(GatewayConfig::default()), Identity::system("autoscaler"))
    }

    fn group(name: &str, replicas: u32) -> ReplicaGroup {
        let mut group = ReplicaGroup::new(name);
        group.metadata.namespace = Some("default".into());
        group.spec.replicas = replicas;
        group.spec.selector = [("app", "web")].into_iter().collect();
        group.spec.template = WorkloadTemplate {
            labels: [("app".to_string(), "web".to_string())].into(),
            spec: tiller_core::kinds::WorkloadUnitSpec {
                processes: vec![ProcessSpec {
                    name: "main".into(),
                    artifact: "registry/web:1".into(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        };
        group
    }

    fn policy(name: &str, min: u32, max: u32) -> ScalingPolicy {
        let mut policy = ScalingPolicy::new(name);
        policy.metadata.namespace = Some("default".into());
        policy.spec.target_ref = TargetRef {
            kind: "ReplicaGroup".into(),
            name: "web".into(),
        };
        policy.spec.min_replicas = min;
        policy.spec.max_replicas = max;
        policy.spec.target_utilization = 1.0;
        policy
    }

    fn context(client: &Client, utilization: Option<f64>) -> (Arc<Context>, Arc<FakeMetrics>) {
        let metrics = Arc::new(FakeMetrics {
            utilization: Mutex::new(utilization),
        });
        let ctx = Arc::new(Context {
            client: client.clone(),
            metrics: metrics.clone(),
            config: AutoscalerConfig::default(),
        });
        (ctx, metrics)
    }

    async fn evaluate(client: &Client, ctx: &Arc<Context>) {
        let policies: Api<ScalingPolicy> = Api::namespaced(client.clone(), "default");
        let current = policies.get("web-scaler").await.unwrap();
        reconcile(Arc::new(current), ctx.clone()).await.unwrap();
    }

    #[test]
    fn desired_replicas_is_ceil_and_clamped() {
        let policy = policy("web-scaler", 1, 10);
        // 3 replicas at 1.5x target => ceil(4.5) = 5
        assert_eq!(desired_replicas(&policy, 3, 1.5), 5);
        // way over target clamps to max
        assert_eq!(desired_replicas(&policy, 8, 3.0), 10);
        // way under clamps to min
        assert_eq!(desired_replicas(&policy, 3, 0.1), 1);
    }

    #[tokio::test]
    async fn scale_up_is_immediate() {
        let client = client();
        let groups: Api<ReplicaGroup> = Api::namespaced(client.clone(), "default");
        let policies: Api<ScalingPolicy> = Api::namespaced(client.clone(), "default");
        groups.create(&group("web", 2)).await.unwrap();
        policies.create(&policy("web-scaler", 1, 10)).await.unwrap();

        let (ctx, _) = context(&client, Some(2.0));
        evaluate(&client, &ctx).await;
        assert_eq!(groups.get("web").await.unwrap().spec.replicas, 4);
    }

    #[tokio::test]
    async fn scale_down_waits_out_the_cooldown() {
        let client = client();
        let groups: Api<ReplicaGroup> = Api::namespaced(client.clone(), "default");
        let policies: Api<ScalingPolicy> = Api::namespaced(client.clone(), "default");
        groups.create(&group("web", 6)).await.unwrap();
        policies.create(&policy("web-scaler", 1, 10)).await.unwrap();

        // first scale-down goes through and stamps the cooldown
        let (ctx, metrics) = context(&client, Some(0.5));
        evaluate(&client, &ctx).await;
        assert_eq!(groups.get("web").await.unwrap().spec.replicas, 3);
        let stamped = policies.get("web-scaler").await.unwrap();
        assert!(stamped.status.as_ref().unwrap().last_scale_down.is_some());

        // utilization drops further, but the cooldown holds the line
        *metrics.utilization.lock() = Some(0.4);
        evaluate(&client, &ctx).await;
        assert_eq!(groups.get("web").await.unwrap().spec.replicas, 3);

        // a subsequent scale-up is not throttled by the cooldown
        *metrics.utilization.lock() = Some(2.0);
        evaluate(&client, &ctx).await;
        assert_eq!(groups.get("web").await.unwrap().spec.replicas, 6);
    }

    #[tokio::test]
    async fn inside_the_tolerance_band_nothing_moves() {
        let client = client();
        let groups: Api<ReplicaGroup> = Api::namespaced(client.clone(), "default");
        let policies: Api<ScalingPolicy> = Api::namespaced(client.clone(), "default");
        groups.create(&group("web", 4)).await.unwrap();
        policies.create(&policy("web-scaler", 1, 10)).await.unwrap();

        let (ctx, _) = context(&client, Some(1.05));
        evaluate(&client, &ctx).await;
        assert_eq!(groups.get("web").await.unwrap().spec.replicas, 4);

        // repeated evaluation with the same reading writes nothing new
        let settled = client.gateway().latest_revision();
        evaluate(&client, &ctx).await;
        assert_eq!(client.gateway().latest_revision(), settled);
    }

    #[tokio::test]
    async fn missing_metric_holds_position() {
        let client = client();
        let groups: Api<ReplicaGroup> = Api::namespaced(client.clone(), "default");
        let policies: Api<ScalingPolicy> = Api::namespaced(client.clone(), "default");
        groups.create(&group("web", 4)).await.unwrap();
        policies.create(&policy("web-scaler", 1, 10)).await.unwrap();

        let (ctx, _) = context(&client, None);
        let settled = client.gateway().latest_revision();
        evaluate(&client, &ctx).await;
        assert_eq!(groups.get("web").await.unwrap().spec.replicas, 4);
        assert_eq!(client.gateway().latest_revision(), settled);
    }
}
