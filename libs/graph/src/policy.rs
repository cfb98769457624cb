//! Traversal decision policies.
//!
//! Every policy answers one worker-scoped question about a node: has it
//! started or finished within the worker's pool scope, should the worker
//! scan for reusable states, run the test, rerun it, clean its states, or
//! reparse a flat variant. The policies only read node bookkeeping and ship
//! state probes through a [`ControlDoor`]; they never touch states
//! themselves.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, instrument, warn};
use vtgrid_params::Params;

use crate::door::{ControlDoor, DoorError, StateAction};
use crate::error::GraphError;
use crate::graph::{NodeHandle, TestGraph};
use crate::node::{count_statuses, StateLocation, TestStatus};
use crate::object::ObjectKind;
use crate::worker::{SpawnerKind, TestWorker, WorkerId};

/// Scope tokens assumed when a node does not pin `pool_scope`.
const FULL_POOL_SCOPE: [&str; 4] = ["own", "swarm", "cluster", "shared"];

fn pool_scope_of(params: &Params) -> Vec<String> {
    if params.contains_key("pool_scope") {
        params.objects("pool_scope")
    } else {
        FULL_POOL_SCOPE.map(str::to_owned).to_vec()
    }
}

fn parse_status_list(
    params: &Params,
    key: &str,
    defaults: &[TestStatus],
) -> Result<BTreeSet<TestStatus>, GraphError> {
    if !params.contains_key(key) {
        return Ok(defaults.iter().copied().collect());
    }
    let mut statuses = BTreeSet::new();
    for token in params.get_list(key, ',') {
        statuses.insert(token.parse::<TestStatus>()?);
    }
    Ok(statuses)
}

impl TestGraph {
    /// Restrict a worker set to what the node's pool scope lets the worker
    /// observe: container workers without `swarm` scope only see
    /// themselves, remote workers without `cluster` scope only their own
    /// swarm.
    fn scoped_workers(
        &self,
        handle: NodeHandle,
        worker: &TestWorker,
        workers: BTreeSet<WorkerId>,
    ) -> BTreeSet<WorkerId> {
        let params = self.node(handle).params();
        let scope = pool_scope_of(&params);
        let scoped = |token: &str| scope.iter().any(|entry| entry == token);
        if !scoped("swarm") && worker.spawner() == SpawnerKind::Lxc {
            workers.into_iter().filter(|id| id == worker.id()).collect()
        } else if !scoped("cluster") && worker.spawner() == SpawnerKind::Remote {
            workers
                .into_iter()
                .filter(|id| {
                    self.worker(id)
                        .is_some_and(|peer| peer.swarm() == worker.swarm())
                })
                .collect()
        } else {
            workers
        }
    }

    fn meets_threshold(
        &self,
        handle: NodeHandle,
        worker: &TestWorker,
        reached: &BTreeSet<WorkerId>,
        threshold: i64,
    ) -> Result<bool, GraphError> {
        if threshold >= 1 {
            Ok(reached.len() as i64 >= threshold)
        } else if threshold == -1 {
            let involved = self.scoped_workers(handle, worker, self.involved_workers(handle));
            Ok(involved.is_subset(reached))
        } else {
            Err(GraphError::InvalidThreshold(threshold))
        }
    }

    /// Whether at least `threshold` scoped workers started the node, or
    /// with a threshold of `-1`, whether every involved worker did.
    ///
    /// Flat nodes carry no environment and never count as started.
    pub fn is_started(
        &self,
        handle: NodeHandle,
        worker: &TestWorker,
        threshold: i64,
    ) -> Result<bool, GraphError> {
        if self.node(handle).is_flat() {
            return Ok(false);
        }
        let started = self.scoped_workers(handle, worker, self.shared_started_workers(handle));
        self.meets_threshold(handle, worker, &started, threshold)
    }

    /// Whether at least `threshold` scoped workers finished the node, or
    /// with a threshold of `-1`, whether every involved worker did.
    ///
    /// Flat nodes finish trivially.
    pub fn is_finished(
        &self,
        handle: NodeHandle,
        worker: &TestWorker,
        threshold: i64,
    ) -> Result<bool, GraphError> {
        if self.node(handle).is_flat() {
            return Ok(true);
        }
        let finished = self.scoped_workers(handle, worker, self.shared_finished_workers(handle));
        self.meets_threshold(handle, worker, &finished, threshold)
    }

    /// Whether the worker still has to scan for reusable states: nobody
    /// reachable within the node's pool scope has finished the node yet.
    pub fn should_scan(&self, handle: NodeHandle, worker: &TestWorker) -> bool {
        let finished = self.shared_finished_workers(handle);
        let scope = pool_scope_of(&self.node(handle).params());
        let scoped = |token: &str| scope.iter().any(|entry| entry == token);
        if !scoped("swarm") && worker.spawner() == SpawnerKind::Lxc {
            !finished.contains(worker.id())
        } else if !scoped("cluster") && worker.spawner() == SpawnerKind::Remote {
            !finished
                .iter()
                .filter_map(|id| self.worker(id))
                .any(|peer| peer.swarm() == worker.swarm())
        } else {
            finished.is_empty()
        }
    }

    /// Whether the node has retry budget left for another run.
    ///
    /// The retry vocabulary and budget come from `rerun_status`,
    /// `stop_status`, and `max_tries`, with replay jobs defaulting to two
    /// tries on fail/error/warn. Any shared result outside the rerun list,
    /// or inside the stop list, ends rerunning.
    pub fn should_rerun(
        &self,
        handle: NodeHandle,
        worker: Option<&TestWorker>,
    ) -> Result<bool, GraphError> {
        let node = self.node(handle);
        if node.rerun_blocked() {
            return Ok(false);
        }
        let params = node.params();
        if params.get_boolean("dry_run", false)? {
            return Ok(false);
        }
        if node.is_flat() || node.is_shared_root() {
            return Ok(false);
        }
        if let Some(worker) = worker {
            if !node.name().contains(worker.id().as_str()) {
                return Err(GraphError::UnauthorizedWorker {
                    worker: worker.id().clone(),
                    node: node.id(),
                });
            }
        }

        let replaying = params.get("replay").is_some_and(|job| !job.is_empty());
        let rerun_defaults: &[TestStatus] = if replaying {
            &[TestStatus::Fail, TestStatus::Error, TestStatus::Warn]
        } else {
            &TestStatus::VOCABULARY
        };
        let rerun_statuses = parse_status_list(&params, "rerun_status", rerun_defaults)?;
        let stop_statuses = parse_status_list(&params, "stop_status", &[])?;
        let max_tries = params.get_numeric("max_tries", if replaying { 2 } else { 1 })?;
        if max_tries < 0 {
            return Err(GraphError::NegativeMaxTries(max_tries));
        }

        let results = self.shared_results(handle);
        let statuses: Vec<TestStatus> = results.iter().map(|result| result.status).collect();
        if statuses.iter().any(|status| !rerun_statuses.contains(status)) {
            return Ok(false);
        }
        if statuses.iter().any(|status| stop_statuses.contains(status)) {
            return Ok(false);
        }
        let reruns_left = if max_tries == 1 {
            0
        } else {
            max_tries - statuses.len() as i64
        };
        debug!(
            node = %node.id(),
            statuses = ?count_statuses(&results),
            reruns_left,
            "Evaluated rerun budget"
        );
        Ok(reruns_left > 0)
    }

    /// Whether any of the node's objects produces a reusable state.
    pub fn produces_setup(&self, handle: NodeHandle) -> bool {
        let node = self.node(handle);
        let params = node.params();
        node.objects().iter().any(|&object| {
            let typed = self.object(object).object_typed_params(&params);
            !typed.get_or("set_state", "").is_empty()
        })
    }

    /// Decide whether the worker should run the node.
    ///
    /// Nodes that produce no setup run while they have no result or retry
    /// budget left. Setup-producing nodes are scanned through the door
    /// first and run only when a wanted state is missing; a state already
    /// present before any result permanently vetoes reruns, since it must
    /// predate this job.
    #[instrument(
        skip(self, handle, worker, door),
        fields(node = %self.node(handle).name(), worker = %worker.id())
    )]
    pub async fn default_run_decision(
        &self,
        handle: NodeHandle,
        worker: &TestWorker,
        door: &dyn ControlDoor,
    ) -> Result<bool, GraphError> {
        let node = self.node(handle);
        if !node.is_flat()
            && !node.is_shared_root()
            && !node.name().contains(worker.id().as_str())
        {
            return Err(GraphError::UnauthorizedWorker {
                worker: worker.id().clone(),
                node: node.id(),
            });
        }
        if !self.produces_setup(handle) {
            return Ok(self.shared_results(handle).is_empty()
                || self.should_rerun(handle, Some(worker))?);
        }

        let scanning = self.should_scan(handle, worker);
        let mut missing_setup = false;
        if scanning {
            missing_setup = self.scan_states(handle, door).await?;
            debug!(
                node = %node.id(),
                worker = %worker.id(),
                missing_setup,
                "Scanned for reusable setup"
            );
        }
        if self.shared_results(handle).is_empty() && !missing_setup {
            node.block_rerun();
        }
        let should_run = if scanning { missing_setup } else { false };
        Ok(should_run || self.should_rerun(handle, Some(worker))?)
    }

    /// Decide whether the worker should clean the node's states.
    ///
    /// Irreversible cleanup (any object not unset by force) always runs.
    /// Reversible cleanup waits until every involved worker finished and
    /// no shared result is still pending.
    #[instrument(
        skip(self, handle, worker),
        fields(node = %self.node(handle).name(), worker = %worker.id())
    )]
    pub fn default_clean_decision(
        &self,
        handle: NodeHandle,
        worker: &TestWorker,
    ) -> Result<bool, GraphError> {
        let node = self.node(handle);
        if !node.is_flat()
            && !node.is_shared_root()
            && !node.name().contains(worker.id().as_str())
        {
            return Err(GraphError::UnauthorizedWorker {
                worker: worker.id().clone(),
                node: node.id(),
            });
        }
        let params = node.params();
        let mut reversible = true;
        for &object in &node.objects() {
            let typed = self.object(object).object_typed_params(&params);
            let policy = typed
                .get("unset_mode_images")
                .or_else(|| typed.get("unset_mode_vms"))
                .or_else(|| typed.get("unset_mode"))
                .unwrap_or("ri");
            if !policy.starts_with('f') {
                reversible = false;
                break;
            }
        }
        if !reversible {
            return Ok(true);
        }
        let pending = self
            .shared_results(handle)
            .iter()
            .any(|result| result.status == TestStatus::Unknown);
        if pending {
            return Ok(false);
        }
        self.is_finished(handle, worker, -1)
    }

    /// Probe the door for every state this node would produce.
    ///
    /// Returns `true` when at least one wanted state is missing and the
    /// node therefore has to run. Nodes without stateful objects always
    /// have to run; permanent objects are never reinstalled.
    #[instrument(skip(self, handle, door), fields(node = %self.node(handle).name()))]
    pub async fn scan_states(
        &self,
        handle: NodeHandle,
        door: &dyn ControlDoor,
    ) -> Result<bool, GraphError> {
        let node = self.node(handle);
        let node_params = node.params();
        let mut probe = (*node_params).clone();
        let mut is_leaf = true;
        for &object_handle in &node.objects() {
            let object = self.object(object_handle);
            let typed = object.object_typed_params(&node_params);
            let state = typed.get_or("set_state", "");
            if state.is_empty() {
                continue;
            }
            is_leaf = false;
            if state == "install" && object.is_permanent() {
                debug!(node = %node.id(), object = %object.id(), "Permanent object is never reinstalled");
                return Ok(false);
            }
            let suffix = format!("_{}_{}", object.kind(), object.id());
            probe.insert(format!("check_state{suffix}"), state);
            probe.insert(format!("show_location{suffix}"), typed.require("set_location")?);
            probe.insert(
                format!("check_mode{suffix}"),
                typed.get_or("check_mode", "rf"),
            );
            if object.kind() == ObjectKind::Vm {
                probe.insert(format!("use_env{suffix}"), "no");
            }
            probe.insert(format!("soft_boot{suffix}"), "no");
        }
        if is_leaf {
            return Ok(true);
        }
        match door.run_state_control(StateAction::Check, &probe).await {
            Ok(()) => Ok(false),
            Err(DoorError::StateMissing(state)) => {
                debug!(node = %node.id(), state, "Wanted state is missing");
                Ok(true)
            }
            Err(source) => Err(GraphError::ScanFailed {
                node: node.id(),
                source,
            }),
        }
    }

    /// Retrieve or drop the node's states on the current environment,
    /// depending on each object's unset policy.
    ///
    /// Objects unset by force are dropped, objects unset by reuse are
    /// pulled in unless a source location already points at the occupying
    /// worker. Net states cannot be synced and transport failures are
    /// logged, not fatal; only a broken control session aborts.
    #[instrument(skip(self, handle, selection, door), fields(node = %self.node(handle).name()))]
    pub async fn sync_states(
        &self,
        handle: NodeHandle,
        selection: &Params,
        door: &dyn ControlDoor,
    ) -> Result<(), GraphError> {
        let node = self.node(handle);
        let node_params = node.params();
        let mut probe = (*node_params).clone();
        let stale: Vec<String> = probe
            .keys()
            .filter(|key| key.starts_with("get_state") || key.starts_with("unset_state"))
            .map(str::to_owned)
            .collect();
        for key in stale {
            probe.remove(&key);
        }

        let selected_vms = selection.objects("vms");
        let occupant = node.occupant();
        let mut should_act = false;
        let mut action = StateAction::Get;
        for &object_handle in &node.objects() {
            let object = self.object(object_handle);
            let typed = object.object_typed_params(&node_params);
            let state = typed.get_or("set_state", "");
            if state.is_empty() {
                continue;
            }
            let policy = typed.get_or("unset_mode", "ri").to_owned();
            if !policy.starts_with('f') && !policy.starts_with('r') {
                continue;
            }
            if object.kind() == ObjectKind::Net {
                warn!(object = %object.id(), "Net states cannot be synced, skipping");
                continue;
            }
            if state == "install" && object.is_permanent() {
                should_act = false;
                break;
            }
            let vm_name = match object.kind() {
                ObjectKind::Vm => object.suffix().to_owned(),
                _ => {
                    let Some(&vm) = object.composites().first() else {
                        continue;
                    };
                    self.object(vm).suffix().to_owned()
                }
            };
            if !selected_vms.is_empty() && !selected_vms.contains(&vm_name) {
                continue;
            }
            should_act = true;

            if object.kind() == ObjectKind::Vm {
                let vm = object.suffix();
                probe.insert(format!("images_{vm}"), typed.get_or("images", ""));
                for image in typed.objects("images") {
                    let image_params = typed.object_params(&image);
                    if let Some(name) = image_params.get("image_name") {
                        probe.insert(format!("image_name_{image}_{vm}"), name);
                    }
                    if let Some(format) = image_params.get("image_format") {
                        probe.insert(format!("image_format_{image}_{vm}"), format);
                    }
                    if image_params.get_boolean("create_image", false)? {
                        probe.insert(format!("remove_image_{image}_{vm}"), "yes");
                        probe.insert("skip_image_processing", "no");
                    }
                }
            }

            let suffix = format!("_{}_{}", object.kind(), object.id());
            let location = typed.require("set_location")?;
            if object.kind() == ObjectKind::Vm {
                probe.insert(format!("use_env{suffix}"), "no");
            }
            if policy.starts_with('f') {
                probe.insert(format!("unset_state{suffix}"), state);
                probe.insert(format!("unset_location{suffix}"), location);
                probe.insert(format!("unset_mode{suffix}"), policy.as_str());
                probe.insert(format!("pool_scope{suffix}"), "own");
                action = StateAction::Unset;
            } else {
                probe.insert(format!("get_state{suffix}"), state);
                probe.insert(format!("get_location{suffix}"), location);
                probe.insert(
                    format!("pool_scope{suffix}"),
                    typed.get_or("pool_scope", "swarm cluster shared"),
                );
                for source in location.split_whitespace() {
                    if let Ok(parsed) = source.parse::<StateLocation>() {
                        if parsed.worker.is_some() && parsed.worker == occupant {
                            // the state already lives here
                            should_act = false;
                            break;
                        }
                    }
                }
                action = StateAction::Get;
            }
        }

        if should_act {
            info!(node = %node.id(), action = %action, "Syncing states to the current environment");
            match door.run_state_control(action, &probe).await {
                Ok(()) => {}
                Err(err @ DoorError::Session(_)) => return Err(err.into()),
                Err(recoverable) => warn!(
                    node = %node.id(),
                    error = %recoverable,
                    "State sync failed, continuing without it"
                ),
            }
        }
        Ok(())
    }

    /// Point the node's retrieval locations at every worker that produced
    /// results on its setup neighbors, shared pool first.
    #[instrument(skip(self, handle), fields(node = %self.node(handle).name()))]
    pub fn pull_locations(&self, handle: NodeHandle) -> Result<(), GraphError> {
        let node = self.node(handle);
        let params = node.params();
        let shared_pool = params.require("shared_pool")?.to_owned();
        let swarm_pool = params.require("swarm_pool")?.to_owned();

        let mut pulled: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for edge in node.setup_edges() {
            let parent = self.node(edge.node);
            let providers = self.shared_result_workers(edge.node);
            for &object in &edge.objects {
                let key = format!("get_location_{}", self.object(object).id());
                let locations = pulled
                    .entry(key)
                    .or_insert_with(|| vec![StateLocation::shared(&shared_pool).to_string()]);
                for provider in &providers {
                    let source = self.worker(provider).ok_or_else(|| {
                        GraphError::UnknownResultWorker {
                            worker: provider.clone(),
                            node: parent.id(),
                        }
                    })?;
                    let location =
                        StateLocation::on_worker(provider.clone(), &swarm_pool).to_string();
                    if !locations.contains(&location) {
                        locations.push(location);
                    }
                    node.set_param(&format!("nets_host_{provider}"), source.host());
                    node.set_param(&format!("nets_gateway_{provider}"), source.gateway());
                }
            }
        }
        for (key, locations) in pulled {
            node.set_param(&key, &locations.join(" "));
        }
        Ok(())
    }

    /// Whether the flat node has already been unrolled into per-worker
    /// children for this worker.
    pub fn is_unrolled(
        &self,
        handle: NodeHandle,
        worker: &TestWorker,
    ) -> Result<bool, GraphError> {
        let node = self.node(handle);
        if !node.is_flat() {
            return Err(GraphError::NotFlat(node.id()));
        }
        Ok(node.cleanup_edges().iter().any(|edge| {
            let child = self.node(edge.node).id();
            child.contains(node.name()) && child.contains(worker.id().as_str())
        }))
    }

    /// Whether a flat node still needs parsing into runnable children.
    ///
    /// An unrolled node is reparsed only when no unrestricted worker could
    /// still ascend to it for cleanup.
    pub fn should_parse(
        &self,
        handle: NodeHandle,
        worker: &TestWorker,
    ) -> Result<bool, GraphError> {
        if !self.is_unrolled(handle, worker)? {
            return Ok(true);
        }
        let cleanup_capable = self
            .workers()
            .any(|peer| self.is_cleanup_ready(handle, peer) && !peer.is_restricted());
        Ok(!cleanup_capable)
    }

    /// Validate one node's object composition and neighbor sanity.
    pub fn validate_node(&self, handle: NodeHandle) -> Result<(), GraphError> {
        let node = self.node(handle);
        let params = node.params();
        let objects = node.objects();
        if !objects.is_empty() {
            let param_nets = params.objects("nets");
            if param_nets.len() != 1 {
                return Err(GraphError::MultipleNets {
                    node: node.id(),
                    found: param_nets.len(),
                });
            }
            let attached_nets = objects
                .iter()
                .filter(|&&object| self.object(object).kind() == ObjectKind::Net)
                .count();
            if attached_nets != 1 {
                return Err(GraphError::MultipleNets {
                    node: node.id(),
                    found: attached_nets,
                });
            }
            let first = self.object(objects[0]);
            if first.kind() != ObjectKind::Net {
                return Err(GraphError::NetNotFirst { node: node.id() });
            }
            if first.suffix() != param_nets[0] {
                return Err(GraphError::NetMismatch {
                    node: node.id(),
                    param: param_nets[0].clone(),
                    attr: first.suffix().to_owned(),
                });
            }
            let param_vms: BTreeSet<String> = params.objects("vms").into_iter().collect();
            let attached_vms: BTreeSet<String> = objects
                .iter()
                .map(|&object| self.object(object))
                .filter(|object| object.kind() == ObjectKind::Vm)
                .map(|object| object.suffix().to_owned())
                .collect();
            if param_vms != attached_vms {
                let join = |set: &BTreeSet<String>| {
                    set.iter().cloned().collect::<Vec<_>>().join(" ")
                };
                return Err(GraphError::VmSetMismatch {
                    node: node.id(),
                    param: join(&param_vms),
                    attr: join(&attached_vms),
                });
            }
        }
        let reflexive = node.setup_edges().iter().any(|edge| edge.node == handle)
            || node.cleanup_edges().iter().any(|edge| edge.node == handle);
        if reflexive {
            return Err(GraphError::ReflexiveDependency(node.id()));
        }
        Ok(())
    }

    /// Validate every node and reject dependency cycles.
    pub fn validate(&self) -> Result<(), GraphError> {
        for handle in self.node_handles() {
            self.validate_node(handle)?;
        }
        self.ensure_acyclic()
    }

    fn setup_neighbors(&self, handle: NodeHandle) -> Vec<NodeHandle> {
        self.node(handle)
            .setup_edges()
            .iter()
            .map(|edge| edge.node)
            .collect()
    }

    fn ensure_acyclic(&self) -> Result<(), GraphError> {
        // 0 = unvisited, 1 = on the traversal stack, 2 = done
        let mut state = vec![0u8; self.node_count()];
        for root in self.node_handles() {
            if state[root.index()] != 0 {
                continue;
            }
            state[root.index()] = 1;
            let mut stack: Vec<(NodeHandle, usize)> = vec![(root, 0)];
            while let Some(&(current, cursor)) = stack.last() {
                let neighbors = self.setup_neighbors(current);
                if cursor < neighbors.len() {
                    let top = stack.len() - 1;
                    stack[top].1 += 1;
                    let next = neighbors[cursor];
                    match state[next.index()] {
                        0 => {
                            state[next.index()] = 1;
                            stack.push((next, 0));
                        }
                        1 => {
                            return Err(GraphError::DependencyCycle(self.node(next).id()));
                        }
                        _ => {}
                    }
                } else {
                    state[current.index()] = 2;
                    stack.pop();
                }
            }
        }
        Ok(())
    }
}
