//! The rollout controller: migrates between ReplicaGroup generations under
//! a bounded-unavailability constraint.
//!
//! Each template revision gets its own ReplicaGroup, named by a stable
//! template hash and selecting only its own generation's units. Total
//! declared replicas across generations always equals `spec.replicas`; the
//! controller moves replicas from old generations to the current one, never
//! dropping ready units below `replicas − maxUnavailable`.
use std::{
    hash::{BuildHasher, Hash, Hasher},
    sync::Arc,
    time::Duration,
};
use tiller_api::{Api, Client};
use tiller_core::{
    kinds::{ReplicaGroup, RolloutSpec, RolloutSpecStatus, WorkloadTemplate},
    ErrorResponse, Expression, ListParams, Reason, Resource, ResourceExt, Selector,
};
use tiller_runtime::{
    finalizer::{finalizer, Event},
    Action, Controller,
};
use tracing::{info, instrument, warn};

/// The finalizer guarding owned replica groups against owner deletion
pub const FINALIZER: &str = "apps.tiller.dev/rollout";

/// Label stamped onto each generation's selector, template and units
pub const HASH_LABEL: &str = "apps.tiller.dev/template-hash";

/// Static rollout controller configuration
#[derive(Clone, Debug)]
pub struct RolloutConfig {
    /// Requeue spacing while a migration is in progress
    pub progress_interval: Duration,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_secs(5),
        }
    }
}

/// Shared state of the rollout controller
pub struct Context {
    /// Gateway access as the controller identity
    pub client: Client,
    /// Static configuration
    pub config: RolloutConfig,
}

/// A short stable hash of a workload template.
///
/// Seeded so the value is identical across controller replicas and
/// restarts; generation identity must not depend on process lifetime.
pub fn template_hash(template: &WorkloadTemplate) -> String {
    let canonical = serde_json::to_string(template).unwrap_or_default();
    let mut hasher = ahash::RandomState::with_seeds(0x7469, 0x6c6c, 0x6572, 0x0001).build_hasher();
    canonical.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

fn owned_groups(rollout: &RolloutSpec, groups: &[ReplicaGroup]) -> Vec<ReplicaGroup> {
    let uid = rollout.uid();
    groups
        .iter()
        .filter(|g| g.controller_owner().map(|o| o.uid.clone()) == uid)
        .cloned()
        .collect()
}

/// The ReplicaGroup for one template generation
fn generation_group(rollout: &RolloutSpec, hash: &str) -> ReplicaGroup {
    let mut selector_exprs = vec![Expression::Equal(HASH_LABEL.into(), hash.into())];
    selector_exprs.extend(
        rollout
            .spec
            .selector
            .required_labels()
            .into_iter()
            .map(|(k, v)| Expression::Equal(k, v)),
    );

    let mut group = ReplicaGroup::new(&format!("{}-{hash}", rollout.name_any()));
    group.metadata.namespace = rollout.namespace();
    group.metadata.labels = rollout.spec.template.labels.clone();
    group.metadata.owner_references = rollout.controller_owner_ref(&()).into_iter().collect();
    group.spec.selector = Selector::from_expressions(selector_exprs);
    group.spec.template = rollout.spec.template.clone();
    group.spec.template.labels.insert(HASH_LABEL.into(), hash.into());
    group
}

/// One reconciliation pass over a single rollout
#[instrument(level = "debug", skip_all, fields(rollout = %rollout.name_any()))]
pub async fn reconcile(rollout: Arc<RolloutSpec>, ctx: Arc<Context>) -> Result<Action, ErrorResponse> {
    let Some(namespace) = rollout.namespace() else {
        return Ok(Action::await_change());
    };
    let rollouts: Api<RolloutSpec> = Api::namespaced(ctx.client.clone(), &namespace);
    let groups: Api<ReplicaGroup> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&rollouts, FINALIZER, rollout, |event| async {
        match event {
            Event::Apply(rollout) => apply(&rollout, &rollouts, &groups, &ctx).await,
            Event::Cleanup(rollout) => cleanup(&rollout, &groups).await,
        }
    })
    .await
}

async fn apply(
    rollout: &RolloutSpec,
    rollouts: &Api<RolloutSpec>,
    groups: &Api<ReplicaGroup>,
    ctx: &Context,
) -> Result<Action, ErrorResponse> {
    let desired = rollout.spec.replicas;
    let max_unavailable = rollout.spec.max_unavailable.min(desired);
    let hash = template_hash(&rollout.spec.template);

    let all = groups.list(&ListParams::default()).await?.items;
    let owned = owned_groups(rollout, &all);
    let current_name = format!("{}-{hash}", rollout.name_any());

    let mut olds: Vec<ReplicaGroup> = owned
        .iter()
        .filter(|g| g.name_any() != current_name)
        .cloned()
        .collect();
    let current = owned.iter().find(|g| g.name_any() == current_name).cloned();

    let Some(mut current) = current else {
        // a fresh generation starts at full strength only when there is
        // nothing to migrate from
        let mut fresh = generation_group(rollout, &hash);
        let old_total: u32 = olds.iter().map(|g| g.spec.replicas).sum();
        fresh.spec.replicas = desired.saturating_sub(old_total);
        info!(rollout = %rollout.name_any(), group = %fresh.name_any(), "creating generation group");
        match groups.create(&fresh).await {
            Ok(_) => {}
            Err(err) if err.reason == Reason::AlreadyExists => {}
            Err(err) => return Err(err),
        }
        return Ok(Action::requeue(ctx.config.progress_interval));
    };

    let total_ready: u32 = owned
        .iter()
        .filter_map(|g| g.status.as_ref())
        .map(|s| s.ready_replicas)
        .sum();

    // ready units we may remove right now without dropping below the
    // availability floor
    let mut budget = total_ready.saturating_sub(desired.saturating_sub(max_unavailable));

    // scale old generations down (oldest first), bounded by the budget
    olds.sort_by(|a, b| a.metadata.creation_timestamp.cmp(&b.metadata.creation_timestamp));
    for old in olds.iter_mut() {
        if budget == 0 {
            break;
        }
        let take = old.spec.replicas.min(budget);
        if take == 0 {
            continue;
        }
        old.spec.replicas -= take;
        budget -= take;
        info!(rollout = %rollout.name_any(), group = %old.name_any(), replicas = old.spec.replicas, "scaling down old generation");
        match groups.replace(old).await {
            Ok(_) => {}
            Err(err) if err.reason == Reason::Conflict => {
                return Ok(Action::requeue(ctx.config.progress_interval))
            }
            Err(err) => return Err(err),
        }
    }

    // the current generation owns whatever the old ones no longer declare
    let old_total: u32 = olds.iter().map(|g| g.spec.replicas).sum();
    let current_desired = desired.saturating_sub(old_total);
    if current.spec.replicas != current_desired {
        current.spec.replicas = current_desired;
        info!(rollout = %rollout.name_any(), group = %current.name_any(), replicas = current_desired, "scaling current generation");
        match groups.replace(&current).await {
            Ok(_) => {}
            Err(err) if err.reason == Reason::Conflict => {
                return Ok(Action::requeue(ctx.config.progress_interval))
            }
            Err(err) => return Err(err),
        }
    }

    let status = RolloutSpecStatus {
        updated_replicas: current.status.as_ref().map(|s| s.replicas).unwrap_or_default(),
        ready_replicas: total_ready,
        current_hash: Some(hash),
    };
    if rollout.status.as_ref() != Some(&status) {
        let mut updated = rollout.clone();
        updated.status = Some(status);
        match rollouts.replace_status(&updated).await {
            Ok(_) => {}
            Err(err) if err.reason == Reason::Conflict => {}
            Err(err) => return Err(err),
        }
    }

    let migrating = old_total > 0 || total_ready < desired;
    if migrating {
        Ok(Action::requeue(ctx.config.progress_interval))
    } else {
        Ok(Action::await_change())
    }
}

/// Owner deletion: remove every generation group (each cascades to its
/// units through its own finalizer)
async fn cleanup(rollout: &RolloutSpec, groups: &Api<ReplicaGroup>) -> Result<Action, ErrorResponse> {
    let all = groups.list(&ListParams::default()).await?.items;
    for group in owned_groups(rollout, &all) {
        if group.is_deleting() {
            continue;
        }
        match groups.delete(&group.name_any()).await {
            Ok(_) => {}
            Err(err) if err.reason == Reason::NotFound => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(Action::await_change())
}

/// Retry policy: defer to the loop's exponential backoff
pub fn error_policy(rollout: Arc<RolloutSpec>, err: &ErrorResponse, _ctx: Arc<Context>) -> Action {
    warn!(rollout = %rollout.name_any(), error = %err, "rollout reconciliation failed");
    Action::await_change()
}

/// Runs the rollout controller until the process ends
pub async fn run(client: Client, config: RolloutConfig) {
    let api: Api<RolloutSpec> = Api::all(client.clone());
    let ctx = Arc::new(Context { client, config });
    Controller::new(api).run(reconcile, error_policy, ctx).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica;
    use tiller_api::{Gateway, GatewayConfig, Identity};
    use tiller_core::kinds::{
        set_condition, Condition, ProcessSpec, WorkloadUnit, WorkloadUnitSpec, CONDITION_READY,
        WorkloadUnitStatus,
    };

    fn client() -> Client {
        Client::new(Gateway::new(GatewayConfig::default()), Identity::system("rollout-controller"))
    }

    fn rollout(name: &str, replicas: u32, artifact: &str) -> RolloutSpec {
        let mut rollout = RolloutSpec::new(name);
        rollout.metadata.namespace = Some("default".into());
        rollout.spec.replicas = replicas;
        rollout.spec.max_unavailable = 1;
        rollout.spec.selector = [("app", "web")].into_iter().collect();
        rollout.spec.template = WorkloadTemplate {
            labels: [("app".to_string(), "web".to_string())].into(),
            spec: WorkloadUnitSpec {
                processes: vec![ProcessSpec {
                    name: "main".into(),
                    artifact: artifact.into(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        };
        rollout
    }

    async fn reconcile_rollout(client: &Client, name: &str) {
        let rollouts: Api<RolloutSpec> = Api::namespaced(client.clone(), "default");
        let current = rollouts.get(name).await.unwrap();
        let ctx = Arc::new(Context {
            client: client.clone(),
            config: RolloutConfig::default(),
        });
        reconcile(Arc::new(current), ctx).await.unwrap();
    }

    async fn reconcile_groups(client: &Client) {
        let groups: Api<ReplicaGroup> = Api::namespaced(client.clone(), "default");
        let ctx = Arc::new(replica::Context { client: client.clone() });
        for group in groups.list(&ListParams::default()).await.unwrap().items {
            // two passes: finalizer attach, then convergence
            replica::reconcile(Arc::new(group.clone()), ctx.clone()).await.unwrap();
            let refreshed = groups.get_opt(&group.name_any()).await.unwrap();
            if let Some(refreshed) = refreshed {
                replica::reconcile(Arc::new(refreshed), ctx.clone()).await.unwrap();
            }
        }
    }

    async fn mark_all_ready(client: &Client) {
        let units: Api<WorkloadUnit> = Api::namespaced(client.clone(), "default");
        for unit in units.list(&ListParams::default()).await.unwrap().items {
            let mut updated = unit.clone();
            let status = updated.status.get_or_insert_with(WorkloadUnitStatus::default);
            set_condition(&mut status.conditions, Condition::new(CONDITION_READY, true, "Probe"));
            if status.unit_ip.is_none() {
                status.unit_ip = Some("10.0.0.1".into());
            }
            units.replace_status(&updated).await.unwrap();
        }
    }

    fn ready_count(units: &[WorkloadUnit]) -> usize {
        units.iter().filter(|u| u.is_ready() && !u.is_deleting()).count()
    }

    #[test]
    fn template_hash_is_stable_and_template_sensitive() {
        let a = rollout("web", 3, "registry/web:1").spec.template;
        let b = rollout("web", 3, "registry/web:1").spec.template;
        let c = rollout("web", 3, "registry/web:2").spec.template;
        assert_eq!(template_hash(&a), template_hash(&b));
        assert_ne!(template_hash(&a), template_hash(&c));
    }

    #[tokio::test]
    async fn fresh_rollout_creates_one_generation_at_full_strength() {
        let client = client();
        let rollouts: Api<RolloutSpec> = Api::namespaced(client.clone(), "default");
        let groups: Api<ReplicaGroup> = Api::namespaced(client.clone(), "default");
        rollouts.create(&rollout("web", 3, "registry/web:1")).await.unwrap();

        reconcile_rollout(&client, "web").await; // finalizer
        reconcile_rollout(&client, "web").await; // generation group

        let owned = groups.list(&ListParams::default()).await.unwrap().items;
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].spec.replicas, 3);
        assert!(owned[0]
            .spec
            .template
            .labels
            .contains_key(HASH_LABEL));
    }

    #[tokio::test]
    async fn migration_never_drops_below_the_availability_floor() {
        let client = client();
        let rollouts: Api<RolloutSpec> = Api::namespaced(client.clone(), "default");
        let groups: Api<ReplicaGroup> = Api::namespaced(client.clone(), "default");
        let units: Api<WorkloadUnit> = Api::namespaced(client.clone(), "default");

        // settle generation one at 3/3 ready
        rollouts.create(&rollout("web", 3, "registry/web:1")).await.unwrap();
        reconcile_rollout(&client, "web").await;
        reconcile_rollout(&client, "web").await;
        reconcile_groups(&client).await;
        mark_all_ready(&client).await;
        reconcile_groups(&client).await; // refresh ready counts in group status

        // push generation two
        let mut updated = rollouts.get("web").await.unwrap();
        updated.spec.template = rollout("web", 3, "registry/web:2").spec.template;
        rollouts.replace(&updated).await.unwrap();

        // drive the migration step by step, checking the floor after every
        // controller pass
        for _ in 0..12 {
            reconcile_rollout(&client, "web").await;
            let all = units.list(&ListParams::default()).await.unwrap().items;
            assert!(
                ready_count(&all) >= 2,
                "ready units dropped below replicas - maxUnavailable"
            );
            reconcile_groups(&client).await;
            let all = units.list(&ListParams::default()).await.unwrap().items;
            assert!(ready_count(&all) >= 2, "replica pass broke the floor");
            mark_all_ready(&client).await;
            reconcile_groups(&client).await;

            let owned = groups.list(&ListParams::default()).await.unwrap().items;
            let old_total: u32 = owned
                .iter()
                .filter(|g| {
                    !g.spec
                        .template
                        .labels
                        .get(HASH_LABEL)
                        .is_some_and(|h| *h == template_hash(&updated.spec.template))
                })
                .map(|g| g.spec.replicas)
                .sum();
            if old_total == 0 {
                break;
            }
        }

        // the migration finished on the new template
        let hash = template_hash(&updated.spec.template);
        let owned = groups.list(&ListParams::default()).await.unwrap().items;
        let current = owned
            .iter()
            .find(|g| g.name_any().ends_with(&hash))
            .expect("current generation exists");
        assert_eq!(current.spec.replicas, 3);
        let olds_total: u32 = owned
            .iter()
            .filter(|g| !g.name_any().ends_with(&hash))
            .map(|g| g.spec.replicas)
            .sum();
        assert_eq!(olds_total, 0);
    }

    #[tokio::test]
    async fn deleting_the_rollout_cascades_through_generations() {
        let client = client();
        let rollouts: Api<RolloutSpec> = Api::namespaced(client.clone(), "default");
        let groups: Api<ReplicaGroup> = Api::namespaced(client.clone(), "default");
        rollouts.create(&rollout("web", 2, "registry/web:1")).await.unwrap();
        reconcile_rollout(&client, "web").await;
        reconcile_rollout(&client, "web").await;
        reconcile_groups(&client).await;

        rollouts.delete("web").await.unwrap();
        reconcile_rollout(&client, "web").await;
        // the generation group is marked deleting; its own finalizer pass
        // removes the units and then the group
        reconcile_groups(&client).await;
        assert!(groups.list(&ListParams::default()).await.unwrap().items.is_empty());
        assert!(rollouts.get_opt("web").await.unwrap().is_none());
    }
}
