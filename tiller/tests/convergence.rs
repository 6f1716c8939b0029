//! End-to-end convergence: every component loop running against one
//! in-process gateway, coordinating only through watched objects.
use std::{sync::Arc, time::Duration};
use tiller::{
    agent::{testing::FakeFetcher, testing::FakeRuntime, Agent, AgentConfig},
    api::GatewayConfig,
    controlplane::{endpoints, replica, scheduler},
    core::{
        kinds::{
            Node, ProcessSpec, ReplicaGroup, Resources, ServiceEndpoint, WorkloadTemplate,
            WorkloadUnit, WorkloadUnitSpec,
        },
        ListParams,
    },
    Api, Client, Gateway, Identity, ResourceExt,
};

fn bootstrap(gateway_config: GatewayConfig) -> Client {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Client::new(Gateway::new(gateway_config), Identity::system("test-harness"))
}

fn web_group(name: &str, replicas: u32) -> ReplicaGroup {
    let mut group = ReplicaGroup::new(name);
    group.metadata.namespace = Some("default".into());
    group.spec.replicas = replicas;
    group.spec.selector = [("app", "web")].into_iter().collect();
    group.spec.template = WorkloadTemplate {
        labels: [("app".to_string(), "web".to_string())].into(),
        spec: WorkloadUnitSpec {
            processes: vec![ProcessSpec {
                name: "main".into(),
                artifact: "registry/web:1".into(),
                requests: Resources::new(100, 64 << 20),
                ..Default::default()
            }],
            termination_grace_seconds: 1,
            ..Default::default()
        },
    };
    group
}

fn spawn_control_plane(client: &Client) {
    tokio::spawn(scheduler::run(
        client.with_identity(Identity::system("scheduler")),
        scheduler::SchedulerConfig {
            unschedulable_retry: Duration::from_millis(100),
            ..Default::default()
        },
    ));
    tokio::spawn(replica::run(client.with_identity(Identity::system("replica-controller"))));
    tokio::spawn(endpoints::run(
        client.with_identity(Identity::system("endpoint-controller")),
        endpoints::EndpointConfig {
            settle_window: Duration::from_millis(30),
            reevaluation_interval: Duration::from_millis(100),
        },
    ));
}

fn spawn_agent(client: &Client, node: &str) -> Arc<FakeRuntime> {
    let runtime = Arc::new(FakeRuntime::default());
    let agent = Agent::new(
        client.with_identity(Identity::system(&format!("agent-{node}"))),
        AgentConfig {
            node_name: node.to_string(),
            capacity: Resources::new(2000, 4 << 30),
            heartbeat_interval: Duration::from_millis(50),
            probe_interval: Duration::from_millis(20),
            retry_backoff: Duration::from_millis(10),
            stop_poll_interval: Duration::from_millis(10),
            ..Default::default()
        },
        runtime.clone(),
        Arc::new(FakeFetcher::default()),
    );
    tokio::spawn(agent.run());
    runtime
}

async fn eventually<F, Fut>(mut check: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn declared_state_converges_across_all_components() {
    let client = bootstrap(GatewayConfig::default());
    spawn_control_plane(&client);
    spawn_agent(&client, "node-a");

    let groups: Api<ReplicaGroup> = Api::namespaced(client.clone(), "default");
    let units: Api<WorkloadUnit> = Api::namespaced(client.clone(), "default");
    let endpoints_api: Api<ServiceEndpoint> = Api::namespaced(client.clone(), "default");

    let mut endpoint = ServiceEndpoint::new("web");
    endpoint.spec.selector = [("app", "web")].into_iter().collect();
    endpoint.spec.port = 8080;
    endpoints_api.create(&endpoint).await.unwrap();
    groups.create(&web_group("web", 3)).await.unwrap();

    // the replica controller creates 3 units, the scheduler binds them,
    // the agent runs them, the endpoint controller admits them as members
    eventually(
        || async {
            endpoints_api
                .get("web")
                .await
                .ok()
                .and_then(|e| e.status)
                .map(|s| s.members.len())
                == Some(3)
        },
        "3 ready endpoint members",
    )
    .await;

    let placed = units.list(&ListParams::default()).await.unwrap().items;
    assert_eq!(placed.len(), 3);
    for unit in &placed {
        assert_eq!(unit.spec.node_name.as_deref(), Some("node-a"));
        assert!(unit.is_ready());
    }

    // scale down and watch the surplus drain
    let mut scaled = groups.get("web").await.unwrap();
    scaled.spec.replicas = 1;
    groups.replace(&scaled).await.unwrap();
    eventually(
        || async {
            let remaining = units.list(&ListParams::default()).await.unwrap().items;
            remaining.iter().filter(|u| !u.is_deleting()).count() == 1
        },
        "scale down to 1 unit",
    )
    .await;
    eventually(
        || async {
            endpoints_api
                .get("web")
                .await
                .ok()
                .and_then(|e| e.status)
                .map(|s| s.members.len())
                == Some(1)
        },
        "endpoint membership follows the scale down",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_schedulers_never_overcommit_a_node() {
    let client = bootstrap(GatewayConfig::default());
    // two independent scheduler instances race over the same snapshot
    for i in 0..2 {
        tokio::spawn(scheduler::run(
            client.with_identity(Identity::system(&format!("scheduler-{i}"))),
            Default::default(),
        ));
    }
    spawn_agent(&client, "node-a");

    let nodes: Api<Node> = Api::all(client.clone());
    eventually(
        || async { nodes.get_opt("node-a").await.unwrap().is_some_and(|n| n.is_ready()) },
        "node registration",
    )
    .await;

    // the node fits two of these; the third must stay Pending
    let units: Api<WorkloadUnit> = Api::namespaced(client.clone(), "default");
    for name in ["big-0", "big-1", "big-2"] {
        let mut unit = WorkloadUnit::new(name);
        unit.spec.processes = vec![ProcessSpec {
            name: "main".into(),
            artifact: "registry/web:1".into(),
            requests: Resources::new(900, 64 << 20),
            ..Default::default()
        }];
        units.create(&unit).await.unwrap();
    }

    eventually(
        || async {
            let all = units.list(&ListParams::default()).await.unwrap().items;
            all.iter().filter(|u| u.spec.node_name.is_some()).count() == 2
        },
        "two units bound",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let all = units.list(&ListParams::default()).await.unwrap().items;
    let node = nodes.get("node-a").await.unwrap();
    let reserved: u64 = all
        .iter()
        .filter(|u| u.spec.node_name.is_some() && !u.phase().is_terminal())
        .map(|u| u.requests().cpu_millis)
        .sum();
    assert!(
        reserved <= node.allocatable().cpu_millis,
        "bound requests exceed allocatable capacity"
    );
    let pending: Vec<&WorkloadUnit> = all.iter().filter(|u| u.spec.node_name.is_none()).collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(
        pending[0].status.as_ref().and_then(|s| s.reason.as_deref()),
        Some("Unschedulable")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn convergence_survives_watch_history_compaction() {
    // a tiny history forces every watcher through the Expired → re-list
    // path while the system is busy
    let client = bootstrap(GatewayConfig {
        watch_history_limit: 4,
        ..Default::default()
    });
    spawn_control_plane(&client);
    spawn_agent(&client, "node-a");

    let groups: Api<ReplicaGroup> = Api::namespaced(client.clone(), "default");
    let units: Api<WorkloadUnit> = Api::namespaced(client.clone(), "default");
    groups.create(&web_group("web", 3)).await.unwrap();

    eventually(
        || async {
            let all = units.list(&ListParams::default()).await.unwrap().items;
            all.len() == 3 && all.iter().all(|u| u.is_ready())
        },
        "3 ready units despite compacted watches",
    )
    .await;
}
