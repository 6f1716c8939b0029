//! The node agent: registers its node, heartbeats, and converges local
//! processes to the scheduled assignment.
//!
//! The agent never talks to the scheduler or to controllers; it watches
//! for units bound to its node and reports back through status, exactly
//! like every other consumer of the gateway.
use crate::{
    artifacts::ArtifactFetcher,
    runtime::ProcessRuntime,
    unit::{run_unit, FINALIZER},
};
use ahash::HashMap;
use chrono::Utc;
use futures::StreamExt;
use std::{collections::BTreeMap, pin::pin, sync::Arc, time::Duration};
use tiller_api::{Api, Client};
use tiller_core::{
    kinds::{set_condition, Condition, Node, NodeStatus, Resources, WorkloadUnit, CONDITION_READY},
    ErrorResponse, ListParams, Reason, ResourceExt,
};
use tiller_runtime::{
    watcher::{watcher, Event},
    ObjectRef,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Static agent configuration, fixed at process start
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Name this agent registers its Node as
    pub node_name: String,
    /// Capacity advertised as allocatable
    pub capacity: Resources,
    /// Labels stamped onto the Node at registration (failure domain etc.)
    pub node_labels: BTreeMap<String, String>,
    /// Spacing of heartbeat status reports
    pub heartbeat_interval: Duration,
    /// Spacing of liveness/readiness probe rounds per unit
    pub probe_interval: Duration,
    /// Consecutive liveness failures that trigger a process restart
    pub liveness_threshold: u32,
    /// Start attempts before a unit goes `Failed`
    pub start_retries: u32,
    /// Fetch attempts per artifact before a unit goes `Failed`
    pub fetch_retries: u32,
    /// First delay of the start/fetch retry backoff
    pub retry_backoff: Duration,
    /// Polling interval while waiting out a graceful stop
    pub stop_poll_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: "node".to_string(),
            capacity: Resources::new(4000, 8 << 30),
            node_labels: BTreeMap::new(),
            heartbeat_interval: Duration::from_secs(10),
            probe_interval: Duration::from_secs(5),
            liveness_threshold: 3,
            start_retries: 3,
            fetch_retries: 3,
            retry_backoff: Duration::from_millis(500),
            stop_poll_interval: Duration::from_millis(200),
        }
    }
}

/// Shared state handed to every unit worker
pub(crate) struct AgentContext {
    pub(crate) client: Client,
    pub(crate) config: AgentConfig,
    pub(crate) runtime: Arc<dyn ProcessRuntime>,
    pub(crate) fetcher: Arc<dyn ArtifactFetcher>,
}

struct UnitWorker {
    tx: mpsc::Sender<WorkloadUnit>,
    task: tokio::task::JoinHandle<()>,
}

/// One node's agent process
pub struct Agent {
    ctx: Arc<AgentContext>,
}

impl Agent {
    /// An agent for the given node, runtime and artifact fetcher
    pub fn new(
        client: Client,
        config: AgentConfig,
        runtime: Arc<dyn ProcessRuntime>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        Self {
            ctx: Arc::new(AgentContext {
                client,
                config,
                runtime,
                fetcher,
            }),
        }
    }

    /// Registers the node and runs heartbeat and assignment loops until
    /// the process ends
    pub async fn run(self) {
        if let Err(err) = self.register_node().await {
            warn!(error = %err, "node registration failed, continuing to retry via heartbeat");
        }

        let heartbeat_ctx = self.ctx.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(heartbeat_ctx.config.heartbeat_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if let Err(err) = heartbeat(&heartbeat_ctx).await {
                    warn!(error = %err, "heartbeat failed");
                }
            }
        });

        self.assignment_loop().await;
        heartbeat_task.abort();
    }

    /// Create (or adopt) this agent's Node object and report capacity
    async fn register_node(&self) -> Result<(), ErrorResponse> {
        let nodes: Api<Node> = Api::all(self.ctx.client.clone());
        let name = &self.ctx.config.node_name;

        if nodes.get_opt(name).await?.is_none() {
            let mut node = Node::new(name);
            node.metadata.labels = self.ctx.config.node_labels.clone();
            match nodes.create(&node).await {
                Ok(_) => info!(node = %name, "registered node"),
                Err(err) if err.reason == Reason::AlreadyExists => {}
                Err(err) => return Err(err),
            }
        }
        heartbeat(&self.ctx).await
    }

    /// Watch for units bound to this node and fan them out to workers
    async fn assignment_loop(&self) {
        let units: Api<WorkloadUnit> = Api::all(self.ctx.client.clone());
        let mut events = pin!(watcher(units, ListParams::default()));
        let mut workers: HashMap<ObjectRef, UnitWorker> = HashMap::default();

        while let Some(event) = events.next().await {
            match event {
                Event::Applied(unit) => {
                    self.dispatch(&mut workers, unit);
                }
                Event::Deleted(unit) => {
                    // the store has erased it; the worker is done or will
                    // notice its channel closing
                    workers.remove(&ObjectRef::from_obj(&unit));
                }
                Event::Restarted(units) => {
                    let mut seen = Vec::new();
                    for unit in units {
                        seen.push(ObjectRef::from_obj(&unit));
                        self.dispatch(&mut workers, unit);
                    }
                    // workers for objects that vanished across the restart
                    workers.retain(|key, worker| {
                        let keep = seen.contains(key);
                        if !keep {
                            debug!(unit = %key, "dropping worker for vanished unit");
                            worker.task.abort();
                        }
                        keep
                    });
                }
            }
            workers.retain(|_, worker| !worker.task.is_finished());
        }
    }

    fn dispatch(&self, workers: &mut HashMap<ObjectRef, UnitWorker>, unit: WorkloadUnit) {
        if unit.spec.node_name.as_deref() != Some(self.ctx.config.node_name.as_str()) {
            return;
        }
        let key = ObjectRef::from_obj(&unit);
        if let Some(worker) = workers.get(&key) {
            // forward the snapshot; a full queue is fine, workers re-read
            // current state through the API before acting
            let _ = worker.tx.try_send(unit);
            return;
        }
        if unit.phase().is_terminal() && !unit.is_deleting() {
            // nothing to run; terminal units wait for their owner
            return;
        }

        info!(unit = %key, "assignment observed, starting worker");
        let (tx, rx) = mpsc::channel(8);
        let ctx = self.ctx.clone();
        let namespace = unit.namespace().unwrap_or_default();
        let name = unit.name_any();
        let task = tokio::spawn(run_unit(ctx, namespace, name, rx));
        let worker = UnitWorker { tx, task };
        // make sure the worker sees the snapshot that spawned it
        let _ = worker.tx.try_send(unit);
        workers.insert(key, worker);
    }
}

/// Report liveness and capacity on the node's status
async fn heartbeat(ctx: &AgentContext) -> Result<(), ErrorResponse> {
    let nodes: Api<Node> = Api::all(ctx.client.clone());
    let name = &ctx.config.node_name;
    for _ in 0..5 {
        let Some(mut node) = nodes.get_opt(name).await? else {
            return Ok(());
        };
        let status = node.status.get_or_insert_with(NodeStatus::default);
        status.allocatable = ctx.config.capacity;
        status.heartbeat_time = Some(Utc::now());
        set_condition(
            &mut status.conditions,
            Condition::new(CONDITION_READY, true, "AgentReady"),
        );
        match nodes.replace_status(&node).await {
            Ok(_) => return Ok(()),
            Err(err) if err.reason == Reason::Conflict => continue,
            Err(err) => return Err(err),
        }
    }
    Err(ErrorResponse::conflict(format!("kept losing heartbeat writes for {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFetcher, FakeRuntime};
    use tiller_api::{Gateway, GatewayConfig, Identity};
    use tiller_core::kinds::{Phase, ProbeSpec, ProcessSpec};

    fn fast_config(node: &str) -> AgentConfig {
        AgentConfig {
            node_name: node.to_string(),
            heartbeat_interval: Duration::from_millis(20),
            probe_interval: Duration::from_millis(20),
            liveness_threshold: 2,
            retry_backoff: Duration::from_millis(10),
            stop_poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn client() -> Client {
        Client::new(Gateway::new(GatewayConfig::default()), Identity::system("agent"))
    }

    fn bound_unit(name: &str, node: &str) -> WorkloadUnit {
        let mut unit = WorkloadUnit::new(name);
        unit.metadata.namespace = Some("default".into());
        unit.spec.node_name = Some(node.to_string());
        unit.spec.termination_grace_seconds = 1;
        unit.spec.processes = vec![ProcessSpec {
            name: "main".into(),
            artifact: "registry/web:1".into(),
            ..Default::default()
        }];
        unit.spec.liveness_probe = Some(ProbeSpec {
            action: "liveness".into(),
            timeout_seconds: 1,
        });
        unit.spec.readiness_probe = Some(ProbeSpec {
            action: "readiness".into(),
            timeout_seconds: 1,
        });
        unit
    }

    async fn eventually<F, Fut>(mut check: F, what: &str)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    struct Harness {
        client: Client,
        runtime: Arc<FakeRuntime>,
        _agent: tokio::task::JoinHandle<()>,
    }

    async fn start_agent(node: &str) -> Harness {
        let client = client();
        let runtime = Arc::new(FakeRuntime::default());
        let fetcher = Arc::new(FakeFetcher::default());
        let agent = Agent::new(
            client.clone(),
            fast_config(node),
            runtime.clone(),
            fetcher,
        );
        let handle = tokio::spawn(agent.run());
        Harness {
            client,
            runtime,
            _agent: handle,
        }
    }

    async fn get_unit(client: &Client, name: &str) -> Option<WorkloadUnit> {
        let units: Api<WorkloadUnit> = Api::namespaced(client.clone(), "default");
        units.get_opt(name).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn registers_and_heartbeats() {
        let harness = start_agent("node-a").await;
        let nodes: Api<Node> = Api::all(harness.client.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let node = nodes.get("node-a").await.unwrap();
        assert!(node.is_ready());
        assert!(node.status.as_ref().unwrap().heartbeat_time.is_some());
        assert_eq!(node.allocatable(), AgentConfig::default().capacity);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn assigned_unit_reaches_running_and_ready() {
        let harness = start_agent("node-a").await;
        let units: Api<WorkloadUnit> = Api::namespaced(harness.client.clone(), "default");
        units.create(&bound_unit("web-0", "node-a")).await.unwrap();

        let client = harness.client.clone();
        eventually(
            || async {
                get_unit(&client, "web-0")
                    .await
                    .is_some_and(|u| u.phase() == Phase::Running && u.is_ready())
            },
            "unit running and ready",
        )
        .await;

        let observed = get_unit(&harness.client, "web-0").await.unwrap();
        assert!(observed.status.as_ref().unwrap().unit_ip.is_some());
        assert!(observed.finalizers().iter().any(|f| f == FINALIZER));
        // a unit bound elsewhere is ignored
        units.create(&bound_unit("other-0", "node-b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(get_unit(&harness.client, "other-0").await.unwrap().status.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn readiness_failure_flips_the_condition_without_restarting() {
        let harness = start_agent("node-a").await;
        let units: Api<WorkloadUnit> = Api::namespaced(harness.client.clone(), "default");
        units.create(&bound_unit("web-0", "node-a")).await.unwrap();
        let client = harness.client.clone();
        eventually(
            || async { get_unit(&client, "web-0").await.is_some_and(|u| u.is_ready()) },
            "unit ready",
        )
        .await;

        harness.runtime.set_readiness("web-0", false);
        eventually(
            || async { !get_unit(&client, "web-0").await.unwrap().is_ready() },
            "readiness flip",
        )
        .await;
        let observed = get_unit(&harness.client, "web-0").await.unwrap();
        assert_eq!(observed.phase(), Phase::Running, "readiness never restarts");
        assert_eq!(observed.status.as_ref().unwrap().restart_count, 0);
        assert_eq!(harness.runtime.starts(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn liveness_failures_restart_the_processes() {
        let harness = start_agent("node-a").await;
        let units: Api<WorkloadUnit> = Api::namespaced(harness.client.clone(), "default");
        units.create(&bound_unit("web-0", "node-a")).await.unwrap();
        let client = harness.client.clone();
        eventually(
            || async { get_unit(&client, "web-0").await.is_some_and(|u| u.is_ready()) },
            "unit ready",
        )
        .await;

        harness.runtime.set_liveness("web-0", false);
        eventually(
            || async {
                get_unit(&client, "web-0")
                    .await
                    .unwrap()
                    .status
                    .map(|s| s.restart_count)
                    .unwrap_or(0)
                    >= 1
            },
            "liveness restart",
        )
        .await;
        assert!(harness.runtime.starts() >= 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deletion_reports_final_status_then_releases_the_object() {
        let harness = start_agent("node-a").await;
        let units: Api<WorkloadUnit> = Api::namespaced(harness.client.clone(), "default");
        units.create(&bound_unit("web-0", "node-a")).await.unwrap();
        let client = harness.client.clone();
        eventually(
            || async { get_unit(&client, "web-0").await.is_some_and(|u| u.is_ready()) },
            "unit ready",
        )
        .await;

        // deletion is gated by the teardown finalizer until the agent has
        // stopped the processes and reported
        units.delete("web-0").await.unwrap();
        eventually(
            || async { get_unit(&client, "web-0").await.is_none() },
            "object erased after teardown",
        )
        .await;
        // graceful stop sufficed; no force kill
        assert_eq!(harness.runtime.kills(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_failures_exhaust_into_failed_phase() {
        let harness = start_agent("node-a").await;
        harness.runtime.fail_next_starts(u32::MAX);
        let units: Api<WorkloadUnit> = Api::namespaced(harness.client.clone(), "default");
        units.create(&bound_unit("web-0", "node-a")).await.unwrap();

        let client = harness.client.clone();
        eventually(
            || async { get_unit(&client, "web-0").await.is_some_and(|u| u.phase() == Phase::Failed) },
            "failed phase",
        )
        .await;
        let observed = get_unit(&harness.client, "web-0").await.unwrap();
        assert_eq!(observed.status.as_ref().unwrap().reason.as_deref(), Some("StartFailed"));
        // the agent leaves replacement to the owning controller
        assert!(get_unit(&harness.client, "web-0").await.is_some());
    }
}
