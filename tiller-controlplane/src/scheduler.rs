//! The placement scheduler: binds pending workload units to nodes.
//!
//! Feasibility filters first, scoring second, then a single conditional
//! write of `spec.nodeName`. Multiple scheduler instances may run
//! concurrently: the compare-and-swap bind makes races safe, and the loser
//! simply observes the winner's binding on its retry and stops.
use ahash::HashMap;
use std::{sync::Arc, time::Duration};
use tiller_api::{Api, Client};
use tiller_core::{
    kinds::{set_condition, Node, Phase, Resources, WorkloadUnit, WorkloadUnitStatus},
    ErrorResponse, ListParams, Reason, ResourceExt,
};
use tiller_runtime::{Action, Controller};
use tracing::{debug, info, instrument, warn};

/// Static scheduler configuration
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Node label identifying the failure domain units are spread across
    pub spread_label: String,
    /// Weight of the lower-fragmentation score component
    pub least_allocated_weight: f64,
    /// Weight of the owner-spread score component
    pub spread_weight: f64,
    /// How long to wait before re-evaluating an unschedulable unit
    pub unschedulable_retry: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            spread_label: "failure-domain".to_string(),
            least_allocated_weight: 1.0,
            spread_weight: 1.0,
            unschedulable_retry: Duration::from_secs(30),
        }
    }
}

/// Shared state of one scheduler instance
pub struct Context {
    /// Gateway access as the scheduler identity
    pub client: Client,
    /// Static configuration
    pub config: SchedulerConfig,
}

/// Sum of requests of all non-terminal units bound to each node.
///
/// Requests, not live usage: capacity is reserved from the moment of
/// binding, even before the unit runs, so concurrent scheduling decisions
/// cannot overcommit a node.
fn reservations(units: &[WorkloadUnit]) -> HashMap<String, Resources> {
    let mut reserved: HashMap<String, Resources> = HashMap::default();
    for unit in units {
        if unit.phase().is_terminal() {
            continue;
        }
        if let Some(node) = &unit.spec.node_name {
            *reserved.entry(node.clone()).or_default() += unit.requests();
        }
    }
    reserved
}

/// The nodes this unit could run on right now
fn feasible_nodes<'n>(
    unit: &WorkloadUnit,
    nodes: &'n [Node],
    reserved: &HashMap<String, Resources>,
) -> Vec<&'n Node> {
    nodes
        .iter()
        .filter(|node| {
            let name = node.name_any();
            if !node.is_ready() || node.spec.unschedulable {
                return false;
            }
            if !unit.tolerates_all(&node.spec.taints) {
                return false;
            }
            if !unit
                .spec
                .node_selector
                .iter()
                .all(|(k, v)| node.labels().get(k) == Some(v))
            {
                return false;
            }
            let free = node.allocatable() - reserved.get(&name).copied().unwrap_or_default();
            unit.requests().fits_within(&free)
        })
        .collect()
}

/// Score one feasible node; higher is better.
///
/// Components: free capacity after placement (prefers lower fragmentation)
/// and spread of the unit's siblings (same controller owner) across
/// failure domains.
fn score(
    unit: &WorkloadUnit,
    node: &Node,
    nodes: &[Node],
    units: &[WorkloadUnit],
    reserved: &HashMap<String, Resources>,
    config: &SchedulerConfig,
) -> f64 {
    let name = node.name_any();
    let used = reserved.get(&name).copied().unwrap_or_default() + unit.requests();
    let free_fraction = 1.0 - used.dominant_fraction_of(&node.allocatable());

    let domain = node.labels().get(&config.spread_label);
    let domain_nodes: Vec<String> = nodes
        .iter()
        .filter(|n| match domain {
            Some(d) => n.labels().get(&config.spread_label) == Some(d),
            // nodes without the label are each their own domain
            None => n.name_any() == name,
        })
        .map(|n| n.name_any())
        .collect();
    let owner = unit.controller_owner().map(|o| o.uid.clone());
    let siblings = units
        .iter()
        .filter(|u| !u.phase().is_terminal())
        .filter(|u| owner.is_some() && u.controller_owner().map(|o| o.uid.clone()) == owner)
        .filter(|u| {
            u.spec
                .node_name
                .as_ref()
                .is_some_and(|n| domain_nodes.iter().any(|d| d == n))
        })
        .count();
    let spread = 1.0 / (1.0 + siblings as f64);

    config.least_allocated_weight * free_fraction + config.spread_weight * spread
}

/// The placement decision for one unit, if any node is feasible.
///
/// Ties on score break lexicographically by node name, so concurrent
/// scheduler instances given the same snapshot decide identically.
pub fn select_node<'n>(
    unit: &WorkloadUnit,
    nodes: &'n [Node],
    units: &[WorkloadUnit],
    config: &SchedulerConfig,
) -> Option<&'n Node> {
    let reserved = reservations(units);
    let mut feasible = feasible_nodes(unit, nodes, &reserved);
    feasible.sort_by(|a, b| {
        let score_a = score(unit, a, nodes, units, &reserved, config);
        let score_b = score(unit, b, nodes, units, &reserved, config);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
    feasible.first().copied()
}

/// One scheduling pass over a single unit
#[instrument(level = "debug", skip_all, fields(unit = %unit.name_any()))]
pub async fn reconcile(unit: Arc<WorkloadUnit>, ctx: Arc<Context>) -> Result<Action, ErrorResponse> {
    if unit.spec.node_name.is_some() || unit.is_deleting() || unit.phase().is_terminal() {
        return Ok(Action::await_change());
    }
    let Some(namespace) = unit.namespace() else {
        return Ok(Action::await_change());
    };

    let nodes: Api<Node> = Api::all(ctx.client.clone());
    let all_units: Api<WorkloadUnit> = Api::all(ctx.client.clone());
    let nodes = nodes.list(&ListParams::default()).await?.items;
    let units = all_units.list(&ListParams::default()).await?.items;

    let scoped: Api<WorkloadUnit> = Api::namespaced(ctx.client.clone(), &namespace);
    match select_node(&unit, &nodes, &units, &ctx.config) {
        None => {
            // Pending is a valid terminal-until-resolved state; record the
            // reason and check again later rather than erroring
            mark_unschedulable(&scoped, &unit).await?;
            Ok(Action::requeue(ctx.config.unschedulable_retry))
        }
        Some(node) => {
            let node_name = node.name_any();
            let mut bound = (*unit).clone();
            bound.spec.node_name = Some(node_name.clone());
            match scoped.replace(&bound).await {
                Ok(mut placed) => {
                    info!(unit = %unit.name_any(), node = %node_name, "bound unit");
                    let status = placed.status.get_or_insert_with(WorkloadUnitStatus::default);
                    status.phase = Phase::Scheduled;
                    status.reason = None;
                    status.message = None;
                    scoped.replace_status(&placed).await?;
                    Ok(Action::await_change())
                }
                Err(err) if err.reason == Reason::Conflict => {
                    // another scheduler instance won the bind; our next wake
                    // observes nodeName set and does nothing further
                    debug!(unit = %unit.name_any(), "lost binding race");
                    Ok(Action::await_change())
                }
                Err(err) => Err(err),
            }
        }
    }
}

async fn mark_unschedulable(api: &Api<WorkloadUnit>, unit: &WorkloadUnit) -> Result<(), ErrorResponse> {
    let already = unit
        .status
        .as_ref()
        .is_some_and(|s| s.reason.as_deref() == Some("Unschedulable"));
    if already {
        return Ok(());
    }
    let mut updated = unit.clone();
    let status = updated.status.get_or_insert_with(WorkloadUnitStatus::default);
    status.phase = Phase::Pending;
    status.reason = Some("Unschedulable".to_string());
    status.message = Some("no node satisfies the unit's requests and constraints".to_string());
    set_condition(
        &mut status.conditions,
        tiller_core::kinds::Condition::new("Schedulable", false, "NoFeasibleNode"),
    );
    match api.replace_status(&updated).await {
        Ok(_) => Ok(()),
        // racing with an agent or another scheduler; the next pass re-reads
        Err(err) if err.reason == Reason::Conflict => Ok(()),
        Err(err) => Err(err),
    }
}

/// Retry policy: defer to the loop's exponential backoff
pub fn error_policy(_unit: Arc<WorkloadUnit>, err: &ErrorResponse, _ctx: Arc<Context>) -> Action {
    warn!(error = %err, "scheduling pass failed");
    Action::await_change()
}

/// Runs a scheduler instance until the process ends
pub async fn run(client: Client, config: SchedulerConfig) {
    let api: Api<WorkloadUnit> = Api::all(client.clone());
    let ctx = Arc::new(Context { client, config });
    Controller::new(api).run(reconcile, error_policy, ctx).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_api::{Gateway, GatewayConfig, Identity};
    use tiller_core::kinds::{Condition, NodeStatus, ProcessSpec, CONDITION_READY};
    use tiller_core::OwnerReference;

    fn ready_node(name: &str, cpu: u64, domain: Option<&str>) -> Node {
        let mut node = Node::new(name);
        if let Some(d) = domain {
            node.metadata.labels.insert("failure-domain".into(), d.into());
        }
        node.status = Some(NodeStatus {
            allocatable: Resources::new(cpu, 8 << 30),
            conditions: vec![Condition::new(CONDITION_READY, true, "AgentReady")],
            heartbeat_time: None,
        });
        node
    }

    fn pending_unit(name: &str, cpu: u64) -> WorkloadUnit {
        let mut unit = WorkloadUnit::new(name);
        unit.metadata.namespace = Some("default".into());
        unit.spec.processes = vec![ProcessSpec {
            name: "main".into(),
            artifact: "registry/web:1".into(),
            requests: Resources::new(cpu, 1 << 30),
            ..Default::default()
        }];
        unit
    }

    fn bound_unit(name: &str, cpu: u64, node: &str, owner_uid: Option<&str>) -> WorkloadUnit {
        let mut unit = pending_unit(name, cpu);
        unit.spec.node_name = Some(node.to_string());
        if let Some(uid) = owner_uid {
            unit.metadata.owner_references = vec![OwnerReference {
                api_version: "apps/v1".into(),
                kind: "ReplicaGroup".into(),
                name: "web".into(),
                uid: uid.into(),
                controller: true,
            }];
        }
        unit
    }

    #[test]
    fn reserved_requests_block_overcommit() {
        // node has 1000m; 800m is already reserved by a bound (not yet
        // running) unit, so a 400m unit does not fit
        let nodes = vec![ready_node("node-a", 1000, None)];
        let units = vec![bound_unit("existing", 800, "node-a", None)];
        let unit = pending_unit("incoming", 400);
        assert!(select_node(&unit, &nodes, &units, &SchedulerConfig::default()).is_none());

        let fits = pending_unit("small", 200);
        assert!(select_node(&fits, &nodes, &units, &SchedulerConfig::default()).is_some());
    }

    #[test]
    fn not_ready_unschedulable_and_tainted_nodes_are_infeasible() {
        let mut cordoned = ready_node("node-a", 1000, None);
        cordoned.spec.unschedulable = true;
        let mut dead = ready_node("node-b", 1000, None);
        dead.status.as_mut().unwrap().conditions =
            vec![Condition::new(CONDITION_READY, false, "HeartbeatTimeout")];
        let mut tainted = ready_node("node-c", 1000, None);
        tainted.spec.taints = vec![tiller_core::kinds::Taint {
            key: "dedicated".into(),
            value: Some("batch".into()),
            effect: tiller_core::kinds::TaintEffect::NoSchedule,
        }];

        let unit = pending_unit("incoming", 100);
        let nodes = vec![cordoned, dead, tainted];
        assert!(select_node(&unit, &nodes, &units_none(), &SchedulerConfig::default()).is_none());
    }

    fn units_none() -> Vec<WorkloadUnit> {
        Vec::new()
    }

    #[test]
    fn spreads_siblings_across_failure_domains() {
        let nodes = vec![
            ready_node("node-a", 4000, Some("zone-1")),
            ready_node("node-b", 4000, Some("zone-2")),
        ];
        // a sibling of the same owner already sits in zone-1
        let units = vec![bound_unit("web-0", 100, "node-a", Some("rg-uid"))];
        let mut unit = pending_unit("web-1", 100);
        unit.metadata.owner_references = units[0].metadata.owner_references.clone();

        let chosen = select_node(&unit, &nodes, &units, &SchedulerConfig::default()).unwrap();
        assert_eq!(chosen.name_any(), "node-b");
    }

    #[test]
    fn score_ties_break_lexicographically() {
        let nodes = vec![ready_node("node-b", 1000, None), ready_node("node-a", 1000, None)];
        let unit = pending_unit("web-0", 100);
        let chosen = select_node(&unit, &nodes, &units_none(), &SchedulerConfig::default()).unwrap();
        assert_eq!(chosen.name_any(), "node-a");
    }

    #[tokio::test]
    async fn infeasible_unit_goes_pending_with_a_reason() {
        let client = tiller_api::Client::new(Gateway::new(GatewayConfig::default()), Identity::system("scheduler"));
        let units: Api<WorkloadUnit> = Api::namespaced(client.clone(), "default");
        let created = units.create(&pending_unit("web-0", 500)).await.unwrap();

        let ctx = Arc::new(Context {
            client: client.clone(),
            config: SchedulerConfig::default(),
        });
        let action = reconcile(Arc::new(created), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(SchedulerConfig::default().unschedulable_retry));

        let observed = units.get("web-0").await.unwrap();
        let status = observed.status.unwrap();
        assert_eq!(status.phase, Phase::Pending);
        assert_eq!(status.reason.as_deref(), Some("Unschedulable"));
        assert!(observed.spec.node_name.is_none());
    }

    #[tokio::test]
    async fn binds_to_the_only_feasible_node_and_reports_scheduled() {
        let client = tiller_api::Client::new(Gateway::new(GatewayConfig::default()), Identity::system("scheduler"));
        let nodes: Api<Node> = Api::all(client.clone());
        let mut node = ready_node("node-a", 1000, None);
        let status = node.status.take();
        let mut created_node = nodes.create(&node).await.unwrap();
        created_node.status = status;
        nodes.replace_status(&created_node).await.unwrap();

        let units: Api<WorkloadUnit> = Api::namespaced(client.clone(), "default");
        let created = units.create(&pending_unit("web-0", 500)).await.unwrap();

        let ctx = Arc::new(Context {
            client: client.clone(),
            config: SchedulerConfig::default(),
        });
        reconcile(Arc::new(created), ctx).await.unwrap();

        let bound = units.get("web-0").await.unwrap();
        assert_eq!(bound.spec.node_name.as_deref(), Some("node-a"));
        assert_eq!(bound.phase(), Phase::Scheduled);
    }

    #[tokio::test]
    async fn losing_the_binding_race_is_a_no_op() {
        let client = tiller_api::Client::new(Gateway::new(GatewayConfig::default()), Identity::system("scheduler"));
        let nodes: Api<Node> = Api::all(client.clone());
        for name in ["node-a", "node-b"] {
            let mut node = ready_node(name, 1000, None);
            let status = node.status.take();
            let mut created = nodes.create(&node).await.unwrap();
            created.status = status;
            nodes.replace_status(&created).await.unwrap();
        }

        let units: Api<WorkloadUnit> = Api::namespaced(client.clone(), "default");
        let created = units.create(&pending_unit("web-0", 500)).await.unwrap();

        // a competing instance binds to node-b between our snapshot and
        // our write
        let mut rival = created.clone();
        rival.spec.node_name = Some("node-b".to_string());
        units.replace(&rival).await.unwrap();

        // our pass holds the stale snapshot; its bind must lose cleanly
        let ctx = Arc::new(Context {
            client: client.clone(),
            config: SchedulerConfig::default(),
        });
        let action = reconcile(Arc::new(created), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());

        // exactly one bind survived, and the loser's retry observes it and
        // stops
        let observed = units.get("web-0").await.unwrap();
        assert_eq!(observed.spec.node_name.as_deref(), Some("node-b"));
        let retry = reconcile(Arc::new(observed.clone()), ctx).await.unwrap();
        assert_eq!(retry, Action::await_change());
        assert_eq!(units.get("web-0").await.unwrap(), observed);
    }
}
