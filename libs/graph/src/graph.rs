//! The test graph: arenas, composition, and traversal primitives.
//!
//! The graph owns every node, object, and worker behind cheap copyable
//! handles. Building happens through `&mut self` while parsing the suite;
//! traversal only needs `&self`, with per-node bookkeeping updated behind
//! the nodes' internal locks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::GraphError;
use crate::node::{prefix_priority, DependencyEdge, TestNode, TestResult};
use crate::object::{ObjectKind, TestObject};
use crate::prefix_tree::PrefixTree;
use crate::worker::{SwarmId, TestSwarm, TestWorker, WorkerId};

/// Index of a node within its graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeHandle(u32);

impl NodeHandle {
    pub(crate) fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of an object within its graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectHandle(u32);

impl ObjectHandle {
    pub(crate) fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A complete test graph over one parsed suite.
#[derive(Default)]
pub struct TestGraph {
    nodes: Vec<Arc<TestNode>>,
    objects: Vec<Arc<TestObject>>,
    object_index: HashMap<String, ObjectHandle>,
    workers: BTreeMap<WorkerId, Arc<TestWorker>>,
    swarms: BTreeMap<SwarmId, TestSwarm>,
    tree: PrefixTree<NodeHandle>,
}

impl TestGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker and file it under its swarm.
    pub fn add_worker(&mut self, worker: TestWorker) -> Arc<TestWorker> {
        let worker = Arc::new(worker);
        self.swarms
            .entry(worker.swarm().clone())
            .or_insert_with(|| TestSwarm {
                id: worker.swarm().clone(),
                workers: Vec::new(),
            })
            .workers
            .push(worker.id().clone());
        self.workers.insert(worker.id().clone(), worker.clone());
        worker
    }

    pub fn worker(&self, id: &WorkerId) -> Option<&Arc<TestWorker>> {
        self.workers.get(id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Arc<TestWorker>> {
        self.workers.values()
    }

    pub fn swarm(&self, id: &SwarmId) -> Option<&TestSwarm> {
        self.swarms.get(id)
    }

    pub fn swarms(&self) -> impl Iterator<Item = &TestSwarm> {
        self.swarms.values()
    }

    /// Add a node and index its name for prefix lookup.
    pub fn add_node(&mut self, node: TestNode) -> NodeHandle {
        let handle = NodeHandle::new(self.nodes.len());
        self.tree.insert(node.name(), handle);
        self.nodes.push(Arc::new(node));
        handle
    }

    /// The node behind a handle. Handles are only ever minted by this
    /// graph, so an out-of-range handle is a caller bug and panics.
    pub fn node(&self, handle: NodeHandle) -> &Arc<TestNode> {
        &self.nodes[handle.index()]
    }

    pub fn node_handles(&self) -> impl Iterator<Item = NodeHandle> {
        (0..self.nodes.len()).map(NodeHandle::new)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All nodes whose name contains the dotted `name` as a contiguous
    /// variant run.
    pub fn nodes_by_name(&self, name: &str) -> Vec<NodeHandle> {
        self.tree.get(name)
    }

    /// Add an object, or return the existing handle when its long suffix
    /// is already registered.
    pub fn add_object(&mut self, object: TestObject) -> ObjectHandle {
        if let Some(&existing) = self.object_index.get(object.id()) {
            debug!(object = %object.id(), "Object already registered, reusing it");
            return existing;
        }
        let handle = ObjectHandle::new(self.objects.len());
        self.object_index.insert(object.id().to_owned(), handle);
        self.objects.push(Arc::new(object));
        handle
    }

    pub fn object(&self, handle: ObjectHandle) -> &Arc<TestObject> {
        &self.objects[handle.index()]
    }

    pub fn object_by_id(&self, long_suffix: &str) -> Option<ObjectHandle> {
        self.object_index.get(long_suffix).copied()
    }

    /// Record that `component` is contained in `composite`.
    pub fn compose_object(&mut self, composite: ObjectHandle, component: ObjectHandle) {
        self.object(composite).add_component(component);
        self.object(component).add_composite(composite);
    }

    /// Attach a net and everything below it to a node.
    ///
    /// The attached list is net-first: the net, then each VM followed by
    /// its images. Images named by the VM parameters but not yet parsed
    /// are created on the fly.
    pub fn set_node_objects(&mut self, handle: NodeHandle, net: ObjectHandle) {
        let node_params = self.node(handle).params();
        let net_suffix = self.object(net).suffix().to_owned();
        let mut attached = vec![net];
        for vm_handle in self.object(net).components() {
            attached.push(vm_handle);
            let vm = self.object(vm_handle).clone();
            let vm_typed = vm.object_typed_params(&node_params);
            for image in vm_typed.objects("images") {
                let long_suffix = format!("{image}_{}", vm.suffix());
                let image_handle = match self.object_index.get(&long_suffix) {
                    Some(&existing) => existing,
                    None => {
                        let image_params = vm_typed.object_params(&image);
                        let created = self.add_object(TestObject::new(
                            image.clone(),
                            long_suffix,
                            ObjectKind::Image,
                            image_params,
                        ));
                        self.compose_object(vm_handle, created);
                        created
                    }
                };
                attached.push(image_handle);
            }
        }
        self.node(handle).attach_objects(attached, net_suffix);
    }

    /// Register that `child` depends on states provided by `parent`,
    /// justified by the given objects.
    pub fn descend_from(
        &self,
        child: NodeHandle,
        parent: NodeHandle,
        through: &[ObjectHandle],
    ) -> Result<(), GraphError> {
        if child == parent {
            return Err(GraphError::ReflexiveDependency(self.node(child).id()));
        }
        self.node(child).push_setup_edge(DependencyEdge {
            node: parent,
            objects: through.to_vec(),
        });
        self.node(parent).push_cleanup_edge(DependencyEdge {
            node: child,
            objects: through.to_vec(),
        });
        Ok(())
    }

    /// Bridge two nodes parsed from the same variant for different
    /// workers.
    ///
    /// Bridging is idempotent and makes the pair share results and
    /// traversal registers. Nodes whose bridged forms differ cannot be
    /// bridged.
    pub fn bridge_nodes(&self, handle: NodeHandle, other: NodeHandle) -> Result<(), GraphError> {
        if handle == other {
            return Ok(());
        }
        let node = self.node(handle);
        let sibling = self.node(other);
        if node.bridged_form() != sibling.bridged_form() {
            return Err(GraphError::NotEquivalent {
                node: node.id(),
                other: sibling.id(),
            });
        }
        if node.add_bridge(other) {
            sibling.add_bridge(handle);
            node.adopt_registers(sibling.registers());
            info!(node = %node.id(), other = %sibling.id(), "Bridged equivalent nodes");
        }
        Ok(())
    }

    /// Results of the node and all its bridged siblings.
    pub fn shared_results(&self, handle: NodeHandle) -> Vec<TestResult> {
        let node = self.node(handle);
        let mut results = node.results();
        for sibling in node.bridged() {
            results.extend(self.node(sibling).results());
        }
        results
    }

    /// Workers that recorded any shared result on the node.
    pub fn shared_result_workers(&self, handle: NodeHandle) -> BTreeSet<WorkerId> {
        self.shared_results(handle)
            .into_iter()
            .map(|result| result.worker)
            .collect()
    }

    /// Workers that started the node or a bridged sibling.
    pub fn shared_started_workers(&self, handle: NodeHandle) -> BTreeSet<WorkerId> {
        let node = self.node(handle);
        let mut workers: BTreeSet<WorkerId> = node.started_worker().into_iter().collect();
        for sibling in node.bridged() {
            workers.extend(self.node(sibling).started_worker());
        }
        workers
    }

    /// Workers that finished the node or a bridged sibling.
    pub fn shared_finished_workers(&self, handle: NodeHandle) -> BTreeSet<WorkerId> {
        let node = self.node(handle);
        let mut workers: BTreeSet<WorkerId> = node.finished_worker().into_iter().collect();
        for sibling in node.bridged() {
            workers.extend(self.node(sibling).finished_worker());
        }
        workers
    }

    /// Workers that ever descended to this node during setup traversal.
    pub fn involved_workers(&self, handle: NodeHandle) -> BTreeSet<WorkerId> {
        self.node(handle).registers().picked_by_setup.get_workers(None)
    }

    /// Whether the node or a bridged sibling is held by another worker.
    pub fn is_occupied_by_other(&self, handle: NodeHandle, worker: &TestWorker) -> bool {
        let node = self.node(handle);
        let occupied = |occupant: Option<WorkerId>| {
            occupant.is_some_and(|holder| holder != *worker.id())
        };
        if occupied(node.occupant()) {
            return true;
        }
        node.bridged()
            .into_iter()
            .any(|sibling| occupied(self.node(sibling).occupant()))
    }

    /// Whether the worker has dropped every setup neighbor of the node.
    pub fn is_setup_ready(&self, handle: NodeHandle, worker: &TestWorker) -> bool {
        let node = self.node(handle);
        let dropped = node.registers().dropped_setup;
        node.setup_edges().iter().all(|edge| {
            dropped
                .get_workers(Some(&self.node(edge.node).bridged_form()))
                .contains(worker.id())
        })
    }

    /// Whether the worker has dropped every cleanup neighbor of the node.
    pub fn is_cleanup_ready(&self, handle: NodeHandle, worker: &TestWorker) -> bool {
        let node = self.node(handle);
        let dropped = node.registers().dropped_cleanup;
        node.cleanup_edges().iter().all(|edge| {
            dropped
                .get_workers(Some(&self.node(edge.node).bridged_form()))
                .contains(worker.id())
        })
    }

    /// Whether the node is ready on both traversal sides for the worker.
    pub fn is_ready(&self, handle: NodeHandle, worker: &TestWorker) -> bool {
        self.is_setup_ready(handle, worker) && self.is_cleanup_ready(handle, worker)
    }

    /// Block until [`TestGraph::is_setup_ready`] holds for the worker.
    pub async fn wait_setup_ready(&self, handle: NodeHandle, worker: &TestWorker) {
        loop {
            let readiness = self.node(handle).readiness();
            let notified = readiness.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_setup_ready(handle, worker) {
                return;
            }
            notified.await;
        }
    }

    /// Block until [`TestGraph::is_cleanup_ready`] holds for the worker.
    pub async fn wait_cleanup_ready(&self, handle: NodeHandle, worker: &TestWorker) {
        loop {
            let readiness = self.node(handle).readiness();
            let notified = readiness.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cleanup_ready(handle, worker) {
                return;
            }
            notified.await;
        }
    }

    /// Pick the next setup neighbor the worker should descend to.
    ///
    /// Composed neighbors are preferred over flat ones, then neighbors few
    /// workers have picked so far, then lower test prefixes. The picked
    /// node's cleanup register is charged with this node's bridged form.
    pub fn pick_parent(
        &self,
        handle: NodeHandle,
        worker: &TestWorker,
    ) -> Result<NodeHandle, GraphError> {
        let node = self.node(handle);
        let registers = node.registers();
        let candidates =
            self.pickable_neighbors(&node.setup_edges(), &registers.dropped_setup, worker);
        let best = self
            .prefer_candidate(candidates, PickSide::Parent)?
            .ok_or_else(|| GraphError::NoCandidates {
                role: "parent",
                node: node.id(),
            })?;
        self.node(best)
            .registers()
            .picked_by_cleanup
            .register(&node.bridged_form(), worker.id());
        debug!(node = %node.id(), parent = %self.node(best).id(), worker = %worker.id(), "Picked parent");
        Ok(best)
    }

    /// Pick the next cleanup neighbor the worker should ascend to.
    pub fn pick_child(
        &self,
        handle: NodeHandle,
        worker: &TestWorker,
    ) -> Result<NodeHandle, GraphError> {
        let node = self.node(handle);
        let registers = node.registers();
        let candidates =
            self.pickable_neighbors(&node.cleanup_edges(), &registers.dropped_cleanup, worker);
        let best = self
            .prefer_candidate(candidates, PickSide::Child)?
            .ok_or_else(|| GraphError::NoCandidates {
                role: "child",
                node: node.id(),
            })?;
        self.node(best)
            .registers()
            .picked_by_setup
            .register(&node.bridged_form(), worker.id());
        debug!(node = %node.id(), child = %self.node(best).id(), worker = %worker.id(), "Picked child");
        Ok(best)
    }

    /// Mark the worker as done descending to `parent` from this node.
    pub fn drop_parent(
        &self,
        handle: NodeHandle,
        parent: NodeHandle,
        worker: &TestWorker,
    ) -> Result<(), GraphError> {
        let node = self.node(handle);
        if !node.setup_edges().iter().any(|edge| edge.node == parent) {
            return Err(GraphError::NotANeighbor {
                role: "parent",
                node: node.id(),
                candidate: self.node(parent).id(),
            });
        }
        node.registers()
            .dropped_setup
            .register(&self.node(parent).bridged_form(), worker.id());
        node.awaken();
        Ok(())
    }

    /// Mark the worker as done ascending to `child` from this node.
    pub fn drop_child(
        &self,
        handle: NodeHandle,
        child: NodeHandle,
        worker: &TestWorker,
    ) -> Result<(), GraphError> {
        let node = self.node(handle);
        if !node.cleanup_edges().iter().any(|edge| edge.node == child) {
            return Err(GraphError::NotANeighbor {
                role: "child",
                node: node.id(),
                candidate: self.node(child).id(),
            });
        }
        node.registers()
            .dropped_cleanup
            .register(&self.node(child).bridged_form(), worker.id());
        node.awaken();
        Ok(())
    }

    fn pickable_neighbors(
        &self,
        edges: &[DependencyEdge],
        dropped: &crate::EdgeRegister,
        worker: &TestWorker,
    ) -> Vec<NodeHandle> {
        edges
            .iter()
            .filter(|edge| {
                let neighbor = self.node(edge.node);
                neighbor.name().contains(worker.id().as_str())
                    || neighbor.is_flat()
                    || neighbor.is_shared_root()
            })
            .filter(|edge| {
                let form = self.node(edge.node).bridged_form();
                !dropped.get_workers(Some(&form)).contains(worker.id())
            })
            .map(|edge| edge.node)
            .collect()
    }

    fn prefer_candidate(
        &self,
        candidates: Vec<NodeHandle>,
        side: PickSide,
    ) -> Result<Option<NodeHandle>, GraphError> {
        let mut best: Option<NodeHandle> = None;
        for candidate in candidates {
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    if self.prefers(candidate, current, side)? {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        Ok(best)
    }

    /// Whether `a` should be picked over `b`.
    fn prefers(&self, a: NodeHandle, b: NodeHandle, side: PickSide) -> Result<bool, GraphError> {
        let (node_a, node_b) = (self.node(a), self.node(b));
        let (flat_a, flat_b) = (node_a.is_flat(), node_b.is_flat());
        if flat_a != flat_b {
            // composed nodes carry object state and go first
            return Ok(!flat_a);
        }
        let counter = |node: &TestNode| {
            let registers = node.registers();
            match side {
                PickSide::Parent => registers.picked_by_cleanup.get_counters(None, None),
                PickSide::Child => registers.picked_by_setup.get_counters(None, None),
            }
        };
        let (count_a, count_b) = (counter(node_a), counter(node_b));
        if count_a != count_b {
            return Ok(count_a < count_b);
        }
        Ok(prefix_priority(&node_a.long_prefix(), &node_b.long_prefix())? < 0)
    }
}

#[derive(Clone, Copy)]
enum PickSide {
    Parent,
    Child,
}
