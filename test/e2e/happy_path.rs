//! End-to-end happy path test.
//!
//! This test drives a two-worker suite against real state backends,
//! verifying:
//!
//! 1. Suite assembly (bridged install/deploy chains, per-net leaves)
//! 2. Worker net1 descends and provides the install and launch states
//! 3. Worker net2 sees both finishes over the bridges and skips
//! 4. Worker net2 pulls retrieval locations and syncs the launch state
//! 5. Reversible cleanup drops the launch state and keeps install
//! 6. A replay job scans the pool, reuses install, and rebuilds launch
//!
//! The graph side talks to the state backends through a [`ControlDoor`]
//! implementation backed by [`StateOps`], the same seam a live worker
//! uses to reach its host. Every host gets its own mock vm and disk
//! toolbox; the swarm pool directory is shared, so states travel between
//! hosts the way they do over a common pool mount.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p vtgrid-e2e --test happy_path
//! ```

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use vtgrid_graph::{
    ControlDoor, DoorError, NodeHandle, ObjectKind, StateAction, TestGraph, TestNode, TestObject,
    TestResult, TestStatus, TestWorker,
};
use vtgrid_params::{params, Params};
use vtgrid_states::{
    BackendRegistry, DiskTool, Drivers, FsPoolTransfer, MockDisk, MockVm, StateError, StateOps,
    VmControl,
};

/// Door wiring graph state control requests straight into the state
/// backends of one host.
///
/// Scan payloads carry `check_state_{family}_{object}` keys; each one is
/// answered with a restricted show over that object's family. Sync
/// payloads already carry fully suffixed `get_state`/`unset_state` keys,
/// so they only need the host configuration and chain merged underneath.
struct StatesDoor {
    ops: StateOps,
    base: Params,
}

impl StatesDoor {
    fn new(drivers: Drivers, base: Params) -> Self {
        StatesDoor {
            ops: StateOps::new(BackendRegistry::new(drivers)),
            base,
        }
    }

    /// Host configuration merged under a request payload.
    fn merged(&self, payload: &Params) -> Params {
        let mut work = self.base.clone();
        work.update(payload);
        work.insert("states_chain", "vms images");
        work
    }

    /// Store a freshly produced vm state, the way a finished test slot
    /// publishes its setup for the rest of the fleet.
    async fn publish(&self, vm: &str, state: &str) -> Result<(), StateError> {
        let mut work = self.merged(&Params::new());
        work.insert(format!("set_state_vms_{vm}"), state);
        self.ops.set(&work).await
    }
}

fn door_error(err: StateError) -> DoorError {
    match err {
        StateError::MissingChain(_)
        | StateError::UnknownFamily(_)
        | StateError::UnknownBackend { .. }
        | StateError::Params(_) => DoorError::Session(err.to_string()),
        other => DoorError::Script {
            status: 1,
            output: other.to_string(),
        },
    }
}

#[async_trait]
impl ControlDoor for StatesDoor {
    async fn run_state_control(
        &self,
        action: StateAction,
        params: &Params,
    ) -> Result<(), DoorError> {
        match action {
            StateAction::Check => {
                for (key, state) in params.iter() {
                    let Some(suffix) = key.strip_prefix("check_state_") else {
                        continue;
                    };
                    let Some((family, object)) = suffix.split_once('_') else {
                        return Err(DoorError::Session(format!(
                            "state key {key} lacks an object suffix"
                        )));
                    };
                    let mut probe = self.merged(params);
                    probe.insert("states_chain", family);
                    probe.insert(family, object);
                    probe.insert("show_state", state);
                    probe.insert(
                        "show_mode",
                        params.get_or(&format!("check_mode_{suffix}"), "rf"),
                    );
                    let listed = self.ops.show(&probe).await.map_err(door_error)?;
                    if listed.is_empty() {
                        return Err(DoorError::StateMissing(state.to_string()));
                    }
                }
                Ok(())
            }
            StateAction::Get => self.ops.get(&self.merged(params)).await.map_err(door_error),
            StateAction::Unset => self
                .ops
                .unset(&self.merged(params))
                .await
                .map_err(door_error),
        }
    }
}

/// One worker host: its own vm and disk toolbox behind a states door.
struct Host {
    disk: Arc<MockDisk>,
    vm: Arc<MockVm>,
    door: StatesDoor,
}

fn host(images_dir: &Path, swarm_pool: &Path) -> Host {
    let disk = Arc::new(MockDisk::new());
    let vm = Arc::new(MockVm::new());
    let drivers = Drivers {
        disk: disk.clone(),
        vm: vm.clone(),
        pool: Arc::new(FsPoolTransfer::new()),
    };
    let base = params! {
        "vms" => "vm1",
        "images" => "image1",
        "image_name" => "image1",
        "images_base_dir" => images_dir.display().to_string(),
        "swarm_pool" => swarm_pool.display().to_string(),
        "states_vms" => "ramfile",
        "states_images" => "qcow2ext",
    };
    Host {
        disk: disk.clone(),
        vm,
        door: StatesDoor::new(drivers, base),
    }
}

/// Build the install/deploy/leaf chain for one worker net.
fn chain(
    graph: &mut TestGraph,
    net: &str,
    seq: usize,
    leaf: &str,
    swarm_pool: &str,
    shared_pool: &str,
    reversible_cleanup: bool,
) -> (NodeHandle, NodeHandle, NodeHandle) {
    let vm = graph.add_object(TestObject::new("vm1", "vm1", ObjectKind::Vm, Params::new()));
    let net_handle = graph.add_object(TestObject::new(net, net, ObjectKind::Net, Params::new()));
    if graph.object(net_handle).components().is_empty() {
        graph.compose_object(net_handle, vm);
    }
    let location = format!(":{shared_pool}");

    let install = graph.add_node(TestNode::new(
        format!("{seq}1"),
        format!("install.{net}"),
        params! {
            "nets" => net,
            "vms" => "vm1",
            "images" => "image1",
            "image_name" => "image1",
            "set_state_vm1" => "install",
            "set_location_vm1" => location.as_str(),
        },
    ));
    graph.set_node_objects(install, net_handle);

    let mut deploy_params = params! {
        "nets" => net,
        "vms" => "vm1",
        "images" => "image1",
        "image_name" => "image1",
        "set_state_vm1" => "launch",
        "set_location_vm1" => location.as_str(),
        "shared_pool" => shared_pool,
        "swarm_pool" => swarm_pool,
    };
    if reversible_cleanup {
        deploy_params.insert("unset_mode", "fa");
    }
    let deploy = graph.add_node(TestNode::new(
        format!("{seq}2"),
        format!("deploy.{net}"),
        deploy_params,
    ));
    graph.set_node_objects(deploy, net_handle);

    let tutorial = graph.add_node(TestNode::new(
        format!("{seq}3"),
        format!("{leaf}.{net}"),
        params! { "nets" => net, "vms" => "vm1" },
    ));
    graph.set_node_objects(tutorial, net_handle);

    graph.descend_from(deploy, install, &[vm]).unwrap();
    graph.descend_from(tutorial, deploy, &[vm]).unwrap();
    (install, deploy, tutorial)
}

/// Run one node on its worker the way a slot does: occupy it, perform
/// the test work, store the produced state, and publish the result.
async fn run_node(
    graph: &TestGraph,
    handle: NodeHandle,
    worker: &TestWorker,
    host: &Host,
    produces: Option<&str>,
) {
    let node = graph.node(handle);
    node.set_environment(worker);
    node.set_started(worker.id());
    if let Some(state) = produces {
        host.vm.boot("vm1");
        host.door.publish("vm1", state).await.unwrap();
    }
    node.record_result(TestResult::new(
        node.name(),
        TestStatus::Pass,
        worker.id().clone(),
    ));
    node.set_finished(worker.id());
    node.vacate();
}

/// E2E happy path test covering a full two-worker job.
///
/// This test validates:
/// - Suite assembly and validation
/// - Run decisions driven by real state scans
/// - State storage through the ramfile and overlay backends
/// - Cross-worker state reuse over a shared swarm pool
/// - Retrieval location pulling and state sync
/// - Reversible cleanup of the launch state
#[tokio::test]
async fn e2e_happy_path_suite_to_states() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vtgrid_graph=debug,vtgrid_states=debug".into()),
        )
        .with_test_writer()
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let swarm = dir.path().join("swarm_pool");
    let shared = dir.path().join("shared_pool");
    let host1_images = dir.path().join("host1").join("images");
    let host2_images = dir.path().join("host2").join("images");
    let swarm_pool = swarm.display().to_string();
    let shared_pool = shared.display().to_string();

    // the install test expects a provisioned head image on its host
    std::fs::create_dir_all(&host1_images).unwrap();
    std::fs::write(host1_images.join("image1.qcow2"), b"qemu header").unwrap();

    let host1 = host(&host1_images, &swarm);
    let host2 = host(&host2_images, &swarm);

    // ===========================================================================
    // Step 1: Assemble the bridged suite
    // ===========================================================================
    let mut graph = TestGraph::new();
    let worker1 = graph.add_worker(
        TestWorker::new("net1", params! { "nets_host" => "c1" }).unwrap(),
    );
    let worker2 = graph.add_worker(
        TestWorker::new("net2", params! { "nets_host" => "c2" }).unwrap(),
    );

    let (install1, deploy1, tutorial1) =
        chain(&mut graph, "net1", 1, "tutorial1", &swarm_pool, &shared_pool, true);
    let (install2, deploy2, tutorial2) =
        chain(&mut graph, "net2", 2, "tutorial2", &swarm_pool, &shared_pool, false);
    graph.bridge_nodes(install1, install2).unwrap();
    graph.bridge_nodes(deploy1, deploy2).unwrap();
    graph.validate().unwrap();

    // ===========================================================================
    // Step 2: Worker net1 descends to the deepest missing setup
    // ===========================================================================
    assert!(!graph.is_setup_ready(tutorial1, &worker1));
    assert_eq!(graph.pick_parent(tutorial1, &worker1).unwrap(), deploy1);
    assert!(!graph.is_setup_ready(deploy1, &worker1));
    assert_eq!(graph.pick_parent(deploy1, &worker1).unwrap(), install1);
    assert!(graph.is_setup_ready(install1, &worker1));

    // ===========================================================================
    // Step 3: Install provides the base state
    // ===========================================================================
    assert!(
        graph
            .default_run_decision(install1, &worker1, &host1.door)
            .await
            .unwrap(),
        "no state exists anywhere yet, the install test must run"
    );
    run_node(&graph, install1, &worker1, &host1, Some("install")).await;

    let vm_tree = swarm.join("vm1");
    assert!(vm_tree.join("install.state").exists());
    assert!(vm_tree.join("image1").join("install.qcow2").exists());

    graph.drop_parent(deploy1, install1, &worker1).unwrap();
    assert!(graph.is_setup_ready(deploy1, &worker1));
    assert_eq!(graph.pick_child(install1, &worker1).unwrap(), deploy1);

    // ===========================================================================
    // Step 4: Deploy builds the launch state on top
    // ===========================================================================
    assert!(
        graph
            .default_run_decision(deploy1, &worker1, &host1.door)
            .await
            .unwrap()
    );
    run_node(&graph, deploy1, &worker1, &host1, Some("launch")).await;

    assert!(vm_tree.join("launch.state").exists());
    assert!(vm_tree.join("image1").join("launch.qcow2").exists());
    assert!(
        !host1.vm.is_alive("vm1").await.unwrap(),
        "storing a run state dump powers the vm off"
    );

    graph.drop_parent(tutorial1, deploy1, &worker1).unwrap();
    assert_eq!(graph.pick_child(deploy1, &worker1).unwrap(), tutorial1);

    // ===========================================================================
    // Step 5: The net1 leaf test runs
    // ===========================================================================
    assert!(
        graph
            .default_run_decision(tutorial1, &worker1, &host1.door)
            .await
            .unwrap()
    );
    run_node(&graph, tutorial1, &worker1, &host1, None).await;

    // ===========================================================================
    // Step 6: Worker net2 sees the bridged finishes and skips both setups
    // ===========================================================================
    assert_eq!(graph.pick_parent(tutorial2, &worker2).unwrap(), deploy2);
    assert_eq!(graph.pick_parent(deploy2, &worker2).unwrap(), install2);

    assert!(
        !graph
            .default_run_decision(install2, &worker2, &host2.door)
            .await
            .unwrap(),
        "net1 already finished the bridged install"
    );
    graph.node(install2).set_finished(worker2.id());
    graph.drop_parent(deploy2, install2, &worker2).unwrap();
    assert_eq!(graph.pick_child(install2, &worker2).unwrap(), deploy2);

    assert!(
        !graph
            .default_run_decision(deploy2, &worker2, &host2.door)
            .await
            .unwrap(),
        "net1 already finished the bridged deploy"
    );
    graph.node(deploy2).set_finished(worker2.id());
    graph.drop_parent(tutorial2, deploy2, &worker2).unwrap();
    assert_eq!(graph.pick_child(deploy2, &worker2).unwrap(), tutorial2);

    // ===========================================================================
    // Step 7: Worker net2 pulls locations and syncs the launch state
    // ===========================================================================
    graph.pull_locations(deploy2).unwrap();
    let deploy_params = graph.node(deploy2).params();
    assert_eq!(
        deploy_params.objects("get_location_vm1"),
        vec![format!(":{shared_pool}"), format!("net1:{swarm_pool}")]
    );
    assert_eq!(deploy_params.get("nets_host_net1"), Some("c1"));

    graph
        .sync_states(deploy2, &Params::new(), &host2.door)
        .await
        .unwrap();

    assert!(host2.vm.is_alive("vm1").await.unwrap());
    assert!(host2
        .vm
        .calls()
        .iter()
        .any(|call| call.starts_with("load-ram vm1") && call.ends_with("launch.state")));
    // the synced pointer on the second host is backed by the shared overlay
    assert_eq!(
        host2
            .disk
            .backing_of(&host2_images.join("image1.qcow2"))
            .await
            .unwrap(),
        Some(vm_tree.join("image1").join("launch.qcow2"))
    );

    // ===========================================================================
    // Step 8: The net2 leaf test runs on the synced environment
    // ===========================================================================
    assert!(
        graph
            .default_run_decision(tutorial2, &worker2, &host2.door)
            .await
            .unwrap()
    );
    run_node(&graph, tutorial2, &worker2, &host2, None).await;

    // ===========================================================================
    // Step 9: Ascend and clean up the reversible launch state
    // ===========================================================================
    assert!(!graph.is_cleanup_ready(deploy1, &worker1));
    graph.drop_child(deploy1, tutorial1, &worker1).unwrap();
    assert!(graph.is_cleanup_ready(deploy1, &worker1));
    graph.drop_child(install1, deploy1, &worker1).unwrap();
    graph.drop_child(deploy2, tutorial2, &worker2).unwrap();
    graph.drop_child(install2, deploy2, &worker2).unwrap();

    // nothing about the net2 copy is reversible, so it may clean at once;
    // the net1 copy waits until every involved worker has finished
    assert!(graph.default_clean_decision(deploy2, &worker2).unwrap());
    assert!(graph.default_clean_decision(deploy1, &worker1).unwrap());

    graph
        .sync_states(deploy1, &Params::new(), &host1.door)
        .await
        .unwrap();

    assert!(!vm_tree.join("launch.state").exists());
    assert!(!vm_tree.join("image1").join("launch.qcow2").exists());
    assert!(vm_tree.join("install.state").exists());
    assert!(vm_tree.join("image1").join("install.qcow2").exists());
    assert!(
        !host1_images.join("image1.qcow2").exists(),
        "dropping the launch state also drops the pointer built on it"
    );

    // ===========================================================================
    // Step 10: A replay job scans the pool before running anything
    // ===========================================================================
    // Nobody in the fresh job has finished a node, so the decisions go
    // through a real state scan: the surviving install state vetoes the
    // install test for good, while the cleaned launch state has to be
    // rebuilt.
    let mut replay = TestGraph::new();
    let replay1 = replay.add_worker(
        TestWorker::new("net1", params! { "nets_host" => "c1" }).unwrap(),
    );
    let (replay_install, replay_deploy, _) =
        chain(&mut replay, "net1", 3, "tutorial1", &swarm_pool, &shared_pool, true);
    replay.validate().unwrap();

    assert!(
        !replay
            .default_run_decision(replay_install, &replay1, &host1.door)
            .await
            .unwrap(),
        "the install state survived the previous job"
    );
    assert!(
        replay
            .default_run_decision(replay_deploy, &replay1, &host1.door)
            .await
            .unwrap(),
        "the launch state was cleaned and has to be rebuilt"
    );

    // ===========================================================================
    // Verify key invariants
    // ===========================================================================

    // the second host only ever consumed states, it never stored any
    assert!(host2.vm.calls().iter().all(|call| !call.starts_with("save-ram")));

    // a fresh scan still answers for install and reports launch as gone
    let check = |state: &str| {
        params! {
            "nets" => "net2",
            "vms" => "vm1",
            "check_state_vms_vm1" => state,
        }
    };
    assert!(host2
        .door
        .run_state_control(StateAction::Check, &check("install"))
        .await
        .is_ok());
    assert!(matches!(
        host2
            .door
            .run_state_control(StateAction::Check, &check("launch"))
            .await,
        Err(DoorError::StateMissing(state)) if state == "launch"
    ));

    // skip decisions stay stable on replay
    assert!(
        !graph
            .default_run_decision(install2, &worker2, &host2.door)
            .await
            .unwrap()
    );

    println!("E2E happy path test completed successfully!");
    println!("  Workers: {}, {}", worker1.id(), worker2.id());
    println!("  States provided by net1: install, launch");
    println!("  States reused by net2: install, launch");
    println!("  States after cleanup: install");
    println!("  Host 1 vm ops: {}", host1.vm.calls().len());
    println!("  Host 2 vm ops: {}", host2.vm.calls().len());
}
