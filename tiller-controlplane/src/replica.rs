//! The ReplicaGroup controller: keeps the owned unit count at
//! `spec.replicas`.
//!
//! Owned units are deleted through the group's finalizer when the group
//! itself is deleted, so dependents never outlive their owner.
use rand::Rng;
use std::sync::Arc;
use tiller_api::{Api, Client};
use tiller_core::{
    kinds::{ReplicaGroup, ReplicaGroupStatus, WorkloadUnit},
    ErrorResponse, ListParams, Reason, Resource, ResourceExt,
};
use tiller_runtime::{
    finalizer::{finalizer, Event},
    Action, Controller,
};
use tracing::{info, instrument, warn};

/// The finalizer guarding owned units against owner deletion
pub const FINALIZER: &str = "apps.tiller.dev/replica-group";

/// Shared state of the replica controller
pub struct Context {
    /// Gateway access as the controller identity
    pub client: Client,
}

/// Characters used for generated unit name suffixes (lowercase, no
/// look-alikes, after the fashion of generated names everywhere)
const SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

fn generate_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

/// The units a group owns: matching the selector, carrying its controller
/// owner reference
fn owned_units(group: &ReplicaGroup, units: &[WorkloadUnit]) -> Vec<WorkloadUnit> {
    let uid = group.uid();
    units
        .iter()
        .filter(|unit| group.spec.selector.matches(unit.labels()))
        .filter(|unit| unit.controller_owner().map(|o| o.uid.clone()) == uid)
        .cloned()
        .collect()
}

/// Deterministic surplus deletion order: not-Ready before Ready, then
/// newest before oldest, then lexicographic by uid.
///
/// Deleting the worst units first minimizes availability impact, and the
/// fixed tie-break keeps concurrent scale events from flapping.
fn deletion_order(a: &WorkloadUnit, b: &WorkloadUnit) -> std::cmp::Ordering {
    a.is_ready()
        .cmp(&b.is_ready())
        .then_with(|| b.metadata.creation_timestamp.cmp(&a.metadata.creation_timestamp))
        .then_with(|| a.uid().cmp(&b.uid()))
}

/// One reconciliation pass over a single group
#[instrument(level = "debug", skip_all, fields(group = %group.name_any()))]
pub async fn reconcile(group: Arc<ReplicaGroup>, ctx: Arc<Context>) -> Result<Action, ErrorResponse> {
    let Some(namespace) = group.namespace() else {
        return Ok(Action::await_change());
    };
    let groups: Api<ReplicaGroup> = Api::namespaced(ctx.client.clone(), &namespace);
    let units: Api<WorkloadUnit> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&groups, FINALIZER, group, |event| async {
        match event {
            Event::Apply(group) => apply(&group, &groups, &units).await,
            Event::Cleanup(group) => cleanup(&group, &units).await,
        }
    })
    .await
}

async fn apply(
    group: &ReplicaGroup,
    groups: &Api<ReplicaGroup>,
    units: &Api<WorkloadUnit>,
) -> Result<Action, ErrorResponse> {
    let all = units.list(&ListParams::default()).await?.items;
    let owned = owned_units(group, &all);
    let mut live: Vec<WorkloadUnit> = owned
        .into_iter()
        .filter(|u| !u.is_deleting() && !u.phase().is_terminal())
        .collect();

    let observed = live.len() as u32;
    let desired = group.spec.replicas;

    if observed < desired {
        let deficit = desired - observed;
        info!(group = %group.name_any(), observed, desired, "creating {deficit} units");
        for _ in 0..deficit {
            let unit = stamp_unit(group);
            match units.create(&unit).await {
                Ok(_) => {}
                // suffix collision; the next pass fills the remaining gap
                Err(err) if err.reason == Reason::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        }
    } else if observed > desired {
        let excess = (observed - desired) as usize;
        info!(group = %group.name_any(), observed, desired, "deleting {excess} units");
        live.sort_by(deletion_order);
        for victim in live.iter().take(excess) {
            match units.delete(&victim.name_any()).await {
                Ok(_) => {}
                // already gone; the diff was stale
                Err(err) if err.reason == Reason::NotFound => continue,
                Err(err) => return Err(err),
            }
        }
    }

    let ready = live.iter().filter(|u| u.is_ready()).count() as u32;
    let status = ReplicaGroupStatus {
        replicas: observed,
        ready_replicas: ready,
    };
    if group.status.as_ref() != Some(&status) {
        let mut updated = group.clone();
        updated.status = Some(status);
        match groups.replace_status(&updated).await {
            Ok(_) => {}
            // a concurrent pass got there first; the next wake re-reads
            Err(err) if err.reason == Reason::Conflict => {}
            Err(err) => return Err(err),
        }
    }
    Ok(Action::await_change())
}

/// Owner deletion: remove every owned unit before the group itself goes
async fn cleanup(group: &ReplicaGroup, units: &Api<WorkloadUnit>) -> Result<Action, ErrorResponse> {
    let all = units.list(&ListParams::default()).await?.items;
    for unit in owned_units(group, &all) {
        if unit.is_deleting() {
            continue;
        }
        match units.delete(&unit.name_any()).await {
            Ok(_) => {}
            Err(err) if err.reason == Reason::NotFound => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(Action::await_change())
}

/// A fresh unit stamped from the group's template
fn stamp_unit(group: &ReplicaGroup) -> WorkloadUnit {
    let name = format!("{}-{}", group.name_any(), generate_suffix(5));
    let mut unit = WorkloadUnit::new(&name);
    unit.metadata.namespace = group.namespace();
    unit.metadata.labels = group.spec.template.labels.clone();
    unit.metadata.owner_references = group
        .controller_owner_ref(&())
        .into_iter()
        .collect();
    unit.spec = group.spec.template.spec.clone();
    unit
}

/// Retry policy: defer to the loop's exponential backoff
pub fn error_policy(group: Arc<ReplicaGroup>, err: &ErrorResponse, _ctx: Arc<Context>) -> Action {
    warn!(group = %group.name_any(), error = %err, "replica reconciliation failed");
    Action::await_change()
}

/// Runs the replica controller until the process ends
pub async fn run(client: Client) {
    let api: Api<ReplicaGroup> = Api::all(client.clone());
    let ctx = Arc::new(Context { client });
    Controller::new(api).run(reconcile, error_policy, ctx).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_api::{Gateway, GatewayConfig, Identity};
    use tiller_core::kinds::{
        set_condition, Condition, Phase, ProcessSpec, WorkloadTemplate, WorkloadUnitStatus,
        CONDITION_READY,
    };

    fn client() -> Client {
        Client::new(Gateway::new(GatewayConfig::default()), Identity::system("replica-controller"))
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

    async fn reconcile_group(client: &Client, name: &str) -> Action {
        let groups: Api<ReplicaGroup> = Api::namespaced(client.clone(), "default");
        let current = groups.get(name).await.unwrap();
        reconcile(Arc::new(current), Arc::new(Context { client: client.clone() }))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn scale_up_creates_owned_units_in_one_pass() {
        let client = client();
        let groups: Api<ReplicaGroup> = Api::namespaced(client.clone(), "default");
        let units: Api<WorkloadUnit> = Api::namespaced(client.clone(), "default");
        let created = groups.create(&group("web", 3)).await.unwrap();

        // first pass attaches the finalizer, second creates the deficit
        reconcile_group(&client, "web").await;
        reconcile_group(&client, "web").await;

        let observed = units.list(&ListParams::default()).await.unwrap().items;
        assert_eq!(observed.len(), 3);
        for unit in &observed {
            assert_eq!(unit.phase(), Phase::Pending);
            let owner = unit.controller_owner().expect("owner reference present");
            assert_eq!(owner.kind, "ReplicaGroup");
            assert_eq!(owner.uid, created.metadata.uid.clone().unwrap());
            assert!(unit.name_any().starts_with("web-"));
        }
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_once_converged() {
        let client = client();
        let groups: Api<ReplicaGroup> = Api::namespaced(client.clone(), "default");
        groups.create(&group("web", 2)).await.unwrap();

        reconcile_group(&client, "web").await; // finalizer
        reconcile_group(&client, "web").await; // creates
        reconcile_group(&client, "web").await; // status settles

        let settled = client.gateway().latest_revision();
        reconcile_group(&client, "web").await;
        reconcile_group(&client, "web").await;
        assert_eq!(client.gateway().latest_revision(), settled, "converged reconciliation must write nothing");
    }

    #[tokio::test]
    async fn scale_down_prefers_not_ready_then_newest() {
        let client = client();
        let groups: Api<ReplicaGroup> = Api::namespaced(client.clone(), "default");
        let units: Api<WorkloadUnit> = Api::namespaced(client.clone(), "default");
        groups.create(&group("web", 3)).await.unwrap();
        reconcile_group(&client, "web").await;
        reconcile_group(&client, "web").await;

        // mark all Ready except one
        let all = units.list(&ListParams::default()).await.unwrap().items;
        let mut names: Vec<String> = all.iter().map(|u| u.name_any()).collect();
        names.sort();
        for unit in &all {
            let mut updated = unit.clone();
            let status = updated.status.get_or_insert_with(WorkloadUnitStatus::default);
            let ready = unit.name_any() != names[0];
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_READY, ready, "Probe"),
            );
            units.replace_status(&updated).await.unwrap();
        }

        let mut scaled = groups.get("web").await.unwrap();
        scaled.spec.replicas = 2;
        groups.replace(&scaled).await.unwrap();
        reconcile_group(&client, "web").await;

        let survivors = units.list(&ListParams::default()).await.unwrap().items;
        let survivor_names: Vec<String> = survivors.iter().map(|u| u.name_any()).collect();
        assert_eq!(survivors.len(), 2);
        assert!(
            !survivor_names.contains(&names[0]),
            "the not-Ready unit must be deleted first"
        );
    }

    #[tokio::test]
    async fn deleting_the_group_deletes_owned_units_first() {
        let client = client();
        let groups: Api<ReplicaGroup> = Api::namespaced(client.clone(), "default");
        let units: Api<WorkloadUnit> = Api::namespaced(client.clone(), "default");
        groups.create(&group("web", 2)).await.unwrap();
        reconcile_group(&client, "web").await;
        reconcile_group(&client, "web").await;
        assert_eq!(units.list(&ListParams::default()).await.unwrap().items.len(), 2);

        // delete only marks the group while the finalizer holds it
        groups.delete("web").await.unwrap();
        assert!(groups.get("web").await.unwrap().metadata.deletion_timestamp.is_some());

        // the cleanup pass removes dependents, then the group disappears
        reconcile_group(&client, "web").await;
        assert!(units.list(&ListParams::default()).await.unwrap().items.is_empty());
        assert!(groups.get_opt("web").await.unwrap().is_none());
    }

    #[test]
    fn deletion_order_is_deterministic() {
        let mut ready = WorkloadUnit::new("a");
        ready.metadata.uid = Some("u-1".into());
        ready.status = Some(WorkloadUnitStatus {
            conditions: vec![Condition::new(CONDITION_READY, true, "Probe")],
            ..Default::default()
        });
        let mut not_ready = WorkloadUnit::new("b");
        not_ready.metadata.uid = Some("u-2".into());

        let mut units = vec![ready.clone(), not_ready.clone()];
        units.sort_by(deletion_order);
        assert_eq!(units[0].name_any(), "b", "not-Ready sorts first");

        // equal readiness: newest first
        let mut old = WorkloadUnit::new("old");
        old.metadata.uid = Some("u-3".into());
        old.metadata.creation_timestamp = Some(chrono::Utc::now() - chrono::Duration::hours(1));
        let mut new = WorkloadUnit::new("new");
        new.metadata.uid = Some("u-4".into());
        new.metadata.creation_timestamp = Some(chrono::Utc::now());
        let mut units = vec![old, new];
        units.sort_by(deletion_order);
        assert_eq!(units[0].name_any(), "new");
    }
}
