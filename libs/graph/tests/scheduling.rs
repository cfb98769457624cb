//! End-to-end traversal scenarios over a small two-worker fleet.
//!
//! Each scenario builds the same three-level suite per worker net, with
//! the nodes of both workers bridged pairwise:
//!
//! ```text
//! install.netX  <-  deploy.netX  <-  tutorial.netX
//! (vm install)      (vm launch)      (stateless leaf)
//! ```

use std::sync::Arc;

use vtgrid_graph::{
    MockDoor, NodeHandle, ObjectKind, StateAction, TestGraph, TestNode, TestObject, TestResult,
    TestStatus, TestWorker,
};
use vtgrid_params::{params, Params};

fn fleet() -> (TestGraph, Arc<TestWorker>, Arc<TestWorker>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vtgrid_graph=debug".into()),
        )
        .with_test_writer()
        .try_init();

    let mut graph = TestGraph::new();
    let worker1 = graph.add_worker(
        TestWorker::new("net1", params! { "nets_host" => "c1" }).unwrap(),
    );
    let worker2 = graph.add_worker(
        TestWorker::new("net2", params! { "nets_host" => "c2" }).unwrap(),
    );
    (graph, worker1, worker2)
}

/// Build the install/deploy/tutorial chain for one worker net.
fn chain(graph: &mut TestGraph, net: &str) -> (NodeHandle, NodeHandle, NodeHandle) {
    let vm = graph.add_object(TestObject::new("vm1", "vm1", ObjectKind::Vm, Params::new()));
    let net_handle = graph.add_object(TestObject::new(net, net, ObjectKind::Net, Params::new()));
    if graph.object(net_handle).components().is_empty() {
        graph.compose_object(net_handle, vm);
    }

    let install = graph.add_node(TestNode::new(
        "1",
        format!("install.{net}"),
        params! {
            "nets" => net,
            "vms" => "vm1",
            "set_state_vm1" => "install",
            "set_location_vm1" => ":/mnt/shared/pool",
        },
    ));
    graph.set_node_objects(install, net_handle);

    let deploy = graph.add_node(TestNode::new(
        "2",
        format!("deploy.{net}"),
        params! {
            "nets" => net,
            "vms" => "vm1",
            "set_state_vm1" => "launch",
            "set_location_vm1" => ":/mnt/shared/pool",
            "shared_pool" => "/mnt/shared/pool",
            "swarm_pool" => "/mnt/local/pool",
            "unset_mode" => "fa",
        },
    ));
    graph.set_node_objects(deploy, net_handle);

    let tutorial = graph.add_node(TestNode::new(
        "3",
        format!("tutorial.{net}"),
        params! { "nets" => net, "vms" => "vm1" },
    ));
    graph.set_node_objects(tutorial, net_handle);

    graph.descend_from(deploy, install, &[vm]).unwrap();
    graph.descend_from(tutorial, deploy, &[vm]).unwrap();
    (install, deploy, tutorial)
}

/// Both chains plus the pairwise bridges between their nodes.
fn bridged_suite(
    graph: &mut TestGraph,
) -> ((NodeHandle, NodeHandle, NodeHandle), (NodeHandle, NodeHandle, NodeHandle)) {
    let one = chain(graph, "net1");
    let two = chain(graph, "net2");
    graph.bridge_nodes(one.0, two.0).unwrap();
    graph.bridge_nodes(one.1, two.1).unwrap();
    graph.bridge_nodes(one.2, two.2).unwrap();
    (one, two)
}

/// Run the node if its decision says so, mirroring what a worker slot
/// does: occupy, record a pass, publish the produced state, finish.
async fn run_if_decided(
    graph: &TestGraph,
    door: &MockDoor,
    handle: NodeHandle,
    worker: &TestWorker,
    produces: Option<&str>,
) -> bool {
    if !graph
        .default_run_decision(handle, worker, door)
        .await
        .unwrap()
    {
        return false;
    }
    let node = graph.node(handle);
    node.set_environment(worker);
    node.set_started(worker.id());
    node.record_result(TestResult::new(
        node.name(),
        TestStatus::Pass,
        worker.id().clone(),
    ));
    if let Some(state) = produces {
        door.mark_present(state);
    }
    node.set_finished(worker.id());
    node.vacate();
    true
}

#[tokio::test]
async fn one_worker_descends_runs_and_ascends() {
    let (mut graph, worker1, _) = fleet();
    let (install, deploy, tutorial) = chain(&mut graph, "net1");
    graph.validate().unwrap();

    let door = MockDoor::new();
    door.mark_missing("install");
    door.mark_missing("launch");

    // descend from the leaf to the deepest missing setup
    assert!(!graph.is_setup_ready(tutorial, &worker1));
    assert_eq!(graph.pick_parent(tutorial, &worker1).unwrap(), deploy);
    assert!(!graph.is_setup_ready(deploy, &worker1));
    assert_eq!(graph.pick_parent(deploy, &worker1).unwrap(), install);
    assert!(graph.is_setup_ready(install, &worker1));

    assert!(run_if_decided(&graph, &door, install, &worker1, Some("install")).await);
    graph.drop_parent(deploy, install, &worker1).unwrap();
    assert!(graph.is_setup_ready(deploy, &worker1));
    assert_eq!(graph.pick_child(install, &worker1).unwrap(), deploy);

    assert!(run_if_decided(&graph, &door, deploy, &worker1, Some("launch")).await);
    graph.drop_parent(tutorial, deploy, &worker1).unwrap();
    assert!(graph.is_setup_ready(tutorial, &worker1));
    assert_eq!(graph.pick_child(deploy, &worker1).unwrap(), tutorial);

    // the stateless leaf runs exactly once
    assert!(run_if_decided(&graph, &door, tutorial, &worker1, None).await);
    assert!(!run_if_decided(&graph, &door, tutorial, &worker1, None).await);
    assert_eq!(door.calls_for(StateAction::Check), 2);

    // ascend, releasing cleanup readiness bottom-up
    assert!(!graph.is_cleanup_ready(deploy, &worker1));
    graph.drop_child(deploy, tutorial, &worker1).unwrap();
    assert!(graph.is_cleanup_ready(deploy, &worker1));
    graph.drop_child(install, deploy, &worker1).unwrap();
    assert!(graph.is_ready(install, &worker1));
}

#[tokio::test]
async fn fleet_reuses_setup_across_workers() {
    let (mut graph, worker1, worker2) = fleet();
    let ((install1, deploy1, _), (install2, deploy2, _)) = bridged_suite(&mut graph);
    graph.validate().unwrap();

    let door = MockDoor::new();
    door.mark_missing("install");
    door.mark_missing("launch");

    // the first worker provides the install state
    assert_eq!(graph.pick_parent(deploy1, &worker1).unwrap(), install1);
    assert!(run_if_decided(&graph, &door, install1, &worker1, Some("install")).await);
    graph.drop_parent(deploy1, install1, &worker1).unwrap();
    assert_eq!(graph.pick_child(install1, &worker1).unwrap(), deploy1);

    // the second worker sees the finish through the bridge and skips
    assert_eq!(graph.pick_parent(deploy2, &worker2).unwrap(), install2);
    assert!(!run_if_decided(&graph, &door, install2, &worker2, None).await);
    graph.drop_parent(deploy2, install2, &worker2).unwrap();
    assert_eq!(graph.pick_child(install2, &worker2).unwrap(), deploy2);
    assert_eq!(door.calls_for(StateAction::Check), 1);

    // retrieval locations follow the worker that produced the result
    graph.pull_locations(deploy2).unwrap();
    let deploy_params = graph.node(deploy2).params();
    assert_eq!(
        deploy_params.objects("get_location_vm1"),
        vec![":/mnt/shared/pool", "net1:/mnt/local/pool"]
    );
    assert_eq!(deploy_params.get("nets_host_net1"), Some("c1"));
}

#[tokio::test]
async fn reversible_cleanup_waits_for_every_involved_worker() {
    let (mut graph, worker1, worker2) = fleet();
    let ((install1, deploy1, _), (install2, deploy2, _)) = bridged_suite(&mut graph);
    graph.validate().unwrap();

    let door = MockDoor::new();
    door.mark_missing("install");
    door.mark_missing("launch");

    // both workers descend through the install node, registering their
    // involvement with the bridged deploy pair
    graph.pick_parent(deploy1, &worker1).unwrap();
    assert!(run_if_decided(&graph, &door, install1, &worker1, Some("install")).await);
    graph.drop_parent(deploy1, install1, &worker1).unwrap();
    assert_eq!(graph.pick_child(install1, &worker1).unwrap(), deploy1);

    graph.pick_parent(deploy2, &worker2).unwrap();
    assert!(!run_if_decided(&graph, &door, install2, &worker2, None).await);
    graph.drop_parent(deploy2, install2, &worker2).unwrap();
    assert_eq!(graph.pick_child(install2, &worker2).unwrap(), deploy2);

    // the first worker finishes the deploy state; its reversible cleanup
    // still has to wait for the second worker
    assert!(run_if_decided(&graph, &door, deploy1, &worker1, Some("launch")).await);
    assert!(!graph.default_clean_decision(deploy1, &worker1).unwrap());

    assert!(!run_if_decided(&graph, &door, deploy2, &worker2, None).await);
    graph.node(deploy2).set_finished(worker2.id());
    assert!(graph.default_clean_decision(deploy1, &worker1).unwrap());
    assert!(graph.default_clean_decision(deploy2, &worker2).unwrap());
}
