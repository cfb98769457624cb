//! Test nodes and their per-run bookkeeping.
//!
//! A node is one parsed test variant. Its identity comes in several forms:
//!
//! - **name**: the full dotted variant name, including the net suffix of
//!   the worker it was parsed for.
//! - **setless form**: the name with the leading main-restriction variant
//!   stripped, used for state keys.
//! - **bridged form**: the setless form with the net suffix masked out, so
//!   the same variant parsed for different workers compares equal.
//! - **long prefix**: the test ordinal joined with the VM set, used to
//!   prioritize between sibling nodes.
//!
//! All mutable bookkeeping sits behind short internal locks so the graph
//! can hand out shared references during traversal.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use vtgrid_params::Params;

use crate::edge_register::EdgeRegister;
use crate::error::GraphError;
use crate::graph::{NodeHandle, ObjectHandle};
use crate::worker::{TestWorker, WorkerId};

/// Mask replacing the net suffix inside a bridged form.
const NET_MASK: &str = "+";

/// Outcome vocabulary of a test run.
///
/// `Unknown` marks a pending row that a worker has claimed but not yet
/// resolved; it is not a valid token in retry status lists.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
    Warn,
    Skip,
    Cancel,
    Interrupted,
    Unknown,
}

impl TestStatus {
    /// Every status a retry list may name.
    pub const VOCABULARY: [TestStatus; 7] = [
        TestStatus::Pass,
        TestStatus::Fail,
        TestStatus::Error,
        TestStatus::Warn,
        TestStatus::Skip,
        TestStatus::Cancel,
        TestStatus::Interrupted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pass => "pass",
            TestStatus::Fail => "fail",
            TestStatus::Error => "error",
            TestStatus::Warn => "warn",
            TestStatus::Skip => "skip",
            TestStatus::Cancel => "cancel",
            TestStatus::Interrupted => "interrupted",
            TestStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestStatus {
    type Err = GraphError;

    /// Parse a retry list token; `unknown` is deliberately not accepted.
    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let lowered = token.trim().to_ascii_lowercase();
        TestStatus::VOCABULARY
            .iter()
            .copied()
            .find(|status| status.as_str() == lowered)
            .ok_or(GraphError::InvalidStatus(token.to_owned()))
    }
}

/// One recorded run of a node by one worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub status: TestStatus,
    pub worker: WorkerId,
    pub elapsed: Duration,
    pub recorded_at: DateTime<Utc>,
}

impl TestResult {
    pub fn new(name: impl Into<String>, status: TestStatus, worker: impl Into<WorkerId>) -> Self {
        Self {
            name: name.into(),
            status,
            worker: worker.into(),
            elapsed: Duration::ZERO,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}

/// Where a reusable state can be pulled from.
///
/// Rendered as `worker:path`; a location without a worker (`:path`) is the
/// shared pool reachable from everywhere.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateLocation {
    pub worker: Option<WorkerId>,
    pub path: String,
}

impl StateLocation {
    pub fn shared(path: impl Into<String>) -> Self {
        Self {
            worker: None,
            path: path.into(),
        }
    }

    pub fn on_worker(worker: impl Into<WorkerId>, path: impl Into<String>) -> Self {
        Self {
            worker: Some(worker.into()),
            path: path.into(),
        }
    }

    pub fn is_shared(&self) -> bool {
        self.worker.is_none()
    }
}

impl fmt::Display for StateLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.worker {
            Some(worker) => write!(f, "{worker}:{}", self.path),
            None => write!(f, ":{}", self.path),
        }
    }
}

impl FromStr for StateLocation {
    type Err = GraphError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        let (worker, path) = source
            .split_once(':')
            .ok_or_else(|| GraphError::InvalidLocation(source.to_owned()))?;
        Ok(Self {
            worker: (!worker.is_empty()).then(|| WorkerId::from(worker)),
            path: path.to_owned(),
        })
    }
}

/// An edge to a neighbor node, annotated with the objects that justify it.
#[derive(Clone, Debug)]
pub struct DependencyEdge {
    pub node: NodeHandle,
    pub objects: Vec<ObjectHandle>,
}

/// The four traversal registers of a node.
///
/// Cloning clones the register *handles*; bridged nodes hold clones of one
/// another's registers and therefore observe each other's traffic.
#[derive(Clone, Debug, Default)]
pub struct NodeRegisters {
    /// Parents this node was picked through, when descending for setup.
    pub picked_by_setup: EdgeRegister,
    /// Children this node was picked through, when ascending for cleanup.
    pub picked_by_cleanup: EdgeRegister,
    /// Setup neighbors a worker is done descending to.
    pub dropped_setup: EdgeRegister,
    /// Cleanup neighbors a worker is done ascending to.
    pub dropped_cleanup: EdgeRegister,
}

/// One parsed test variant within the graph.
pub struct TestNode {
    prefix: String,
    name: String,
    params: RwLock<Arc<Params>>,
    objects: Mutex<Vec<ObjectHandle>>,
    net_fragment: Mutex<Option<String>>,
    setup_edges: Mutex<Vec<DependencyEdge>>,
    cleanup_edges: Mutex<Vec<DependencyEdge>>,
    bridged: Mutex<Vec<NodeHandle>>,
    registers: Mutex<NodeRegisters>,
    results: Mutex<Vec<TestResult>>,
    worker: Mutex<Option<WorkerId>>,
    started_worker: Mutex<Option<WorkerId>>,
    finished_worker: Mutex<Option<WorkerId>>,
    rerun_blocked: AtomicBool,
    readiness: Arc<Notify>,
}

impl TestNode {
    /// Create a node for a parsed variant.
    ///
    /// The variant name is mirrored into the parameter database under
    /// `name`, which decision policies treat as authoritative.
    pub fn new(prefix: impl Into<String>, name: impl Into<String>, mut params: Params) -> Self {
        let name = name.into();
        params.insert("name", name.clone());
        Self {
            prefix: prefix.into(),
            name,
            params: RwLock::new(Arc::new(params)),
            objects: Mutex::new(Vec::new()),
            net_fragment: Mutex::new(None),
            setup_edges: Mutex::new(Vec::new()),
            cleanup_edges: Mutex::new(Vec::new()),
            bridged: Mutex::new(Vec::new()),
            registers: Mutex::new(NodeRegisters::default()),
            results: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
            started_worker: Mutex::new(None),
            finished_worker: Mutex::new(None),
            rerun_blocked: AtomicBool::new(false),
            readiness: Arc::new(Notify::new()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the node's parameter database.
    pub fn params(&self) -> Arc<Params> {
        self.params.read().unwrap().clone()
    }

    /// Insert or replace one parameter.
    pub fn set_param(&self, key: &str, value: &str) {
        let mut guard = self.params.write().unwrap();
        Arc::make_mut(&mut guard).insert(key, value);
    }

    /// The objects this node operates on, net first.
    pub fn objects(&self) -> Vec<ObjectHandle> {
        self.objects.lock().unwrap().clone()
    }

    pub(crate) fn attach_objects(&self, objects: Vec<ObjectHandle>, net_suffix: String) {
        *self.objects.lock().unwrap() = objects;
        *self.net_fragment.lock().unwrap() = Some(net_suffix);
    }

    /// Whether the node is a plain variant without objects.
    pub fn is_flat(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }

    /// Whether the node is the shared traversal root.
    pub fn is_shared_root(&self) -> bool {
        self.params()
            .get_boolean("shared_root", false)
            .unwrap_or(false)
    }

    /// The variant name with the leading main restriction stripped.
    pub fn setless_form(&self) -> String {
        let params = self.params();
        let mut longest: Option<usize> = None;
        for restriction in params.objects("main_restrictions") {
            let prefix = format!("{restriction}.");
            if self.name.starts_with(&prefix) {
                longest = Some(longest.map_or(prefix.len(), |known| known.max(prefix.len())));
            }
        }
        match longest {
            Some(cut) => self.name[cut..].to_owned(),
            None => self.name.clone(),
        }
    }

    /// The worker-independent equivalence key used for bridging.
    pub fn bridged_form(&self) -> String {
        let setless = self.setless_form();
        match self.net_fragment.lock().unwrap().as_deref() {
            Some(fragment) if !fragment.is_empty() => setless.replace(fragment, NET_MASK),
            _ => setless,
        }
    }

    /// The test prefix joined with the VM set, e.g. `5-vm1vm2`.
    pub fn long_prefix(&self) -> String {
        let vms = self.params().objects("vms").concat();
        format!("{}-{}", self.prefix, vms)
    }

    /// Unique node identifier within one graph.
    pub fn id(&self) -> String {
        format!("{}-{}", self.long_prefix(), self.name)
    }

    pub fn setup_edges(&self) -> Vec<DependencyEdge> {
        self.setup_edges.lock().unwrap().clone()
    }

    pub fn cleanup_edges(&self) -> Vec<DependencyEdge> {
        self.cleanup_edges.lock().unwrap().clone()
    }

    pub(crate) fn push_setup_edge(&self, edge: DependencyEdge) {
        self.setup_edges.lock().unwrap().push(edge);
    }

    pub(crate) fn push_cleanup_edge(&self, edge: DependencyEdge) {
        self.cleanup_edges.lock().unwrap().push(edge);
    }

    /// Nodes this one is bridged with.
    pub fn bridged(&self) -> Vec<NodeHandle> {
        self.bridged.lock().unwrap().clone()
    }

    pub(crate) fn add_bridge(&self, other: NodeHandle) -> bool {
        let mut bridged = self.bridged.lock().unwrap();
        if bridged.contains(&other) {
            return false;
        }
        bridged.push(other);
        true
    }

    /// Handles to the node's traversal registers.
    pub fn registers(&self) -> NodeRegisters {
        self.registers.lock().unwrap().clone()
    }

    pub(crate) fn adopt_registers(&self, registers: NodeRegisters) {
        *self.registers.lock().unwrap() = registers;
    }

    /// Results recorded on this node alone; bridged siblings are folded in
    /// by [`crate::TestGraph::shared_results`].
    pub fn results(&self) -> Vec<TestResult> {
        self.results.lock().unwrap().clone()
    }

    pub fn record_result(&self, result: TestResult) {
        self.results.lock().unwrap().push(result);
        self.awaken();
    }

    /// The worker currently holding the node, if any.
    pub fn occupant(&self) -> Option<WorkerId> {
        self.worker.lock().unwrap().clone()
    }

    /// Occupy the node and point its parameters at the worker's runtime.
    pub fn set_environment(&self, worker: &TestWorker) {
        {
            let mut guard = self.params.write().unwrap();
            let params = Arc::make_mut(&mut guard);
            params.insert("nets_gateway", worker.gateway());
            params.insert("nets_host", worker.host());
            params.insert("nets_spawner", worker.spawner().as_str());
        }
        *self.worker.lock().unwrap() = Some(worker.id().clone());
    }

    pub fn vacate(&self) {
        *self.worker.lock().unwrap() = None;
        self.awaken();
    }

    pub fn started_worker(&self) -> Option<WorkerId> {
        self.started_worker.lock().unwrap().clone()
    }

    pub fn finished_worker(&self) -> Option<WorkerId> {
        self.finished_worker.lock().unwrap().clone()
    }

    pub fn set_started(&self, worker: &WorkerId) {
        *self.started_worker.lock().unwrap() = Some(worker.clone());
        self.awaken();
    }

    pub fn set_finished(&self, worker: &WorkerId) {
        *self.finished_worker.lock().unwrap() = Some(worker.clone());
        self.awaken();
    }

    /// Whether reruns were vetoed for the rest of the job.
    pub fn rerun_blocked(&self) -> bool {
        self.rerun_blocked.load(Ordering::Acquire)
    }

    /// Veto all further reruns, e.g. when required states predate the job.
    pub fn block_rerun(&self) {
        self.rerun_blocked.store(true, Ordering::Release);
    }

    /// Notification handle fired whenever the node's bookkeeping advances.
    pub fn readiness(&self) -> Arc<Notify> {
        self.readiness.clone()
    }

    pub(crate) fn awaken(&self) {
        self.readiness.notify_waiters();
    }
}

impl fmt::Debug for TestNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestNode")
            .field("prefix", &self.prefix)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Order two test prefixes such as `5a-vm1` against each other.
///
/// The result is negative when `ours` should run first, positive when
/// `theirs` should, and zero for identical prefixes. Prefixes are compared
/// by their leading ordinal, then by their variant letter where a missing
/// letter always wins, then recursively on the remainder. Prefixes that
/// diverge some other way admit no order and yield an error.
pub fn prefix_priority(ours: &str, theirs: &str) -> Result<i32, GraphError> {
    if ours == theirs {
        return Ok(0);
    }
    let unordered = || GraphError::UnorderedPrefixes(ours.to_owned(), theirs.to_owned());

    let (our_ordinal, our_rest) = split_ordinal(ours);
    let (their_ordinal, their_rest) = split_ordinal(theirs);
    match (our_ordinal, their_ordinal) {
        (Some(a), Some(b)) if a != b => {
            return Ok((a - b).clamp(i32::MIN as i64, i32::MAX as i64) as i32);
        }
        (Some(_), Some(_)) | (None, None) => {}
        _ => return Err(unordered()),
    }

    let our_letter = our_rest.chars().next().filter(char::is_ascii_alphabetic);
    let their_letter = their_rest.chars().next().filter(char::is_ascii_alphabetic);
    match (our_letter, their_letter) {
        (None, None) => Err(unordered()),
        (None, Some(_)) => Ok(-1),
        (Some(_), None) => Ok(1),
        (Some(a), Some(b)) if a < b => Ok(-1),
        (Some(a), Some(b)) if a > b => Ok(1),
        (Some(a), Some(_)) => {
            prefix_priority(&our_rest[a.len_utf8()..], &their_rest[a.len_utf8()..])
        }
    }
}

fn split_ordinal(prefix: &str) -> (Option<i64>, &str) {
    let digits = prefix.len() - prefix.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return (None, prefix);
    }
    (prefix[..digits].parse().ok(), &prefix[digits..])
}

/// Sort a parameter-map view of statuses for deterministic reporting.
pub(crate) fn count_statuses(results: &[TestResult]) -> BTreeMap<TestStatus, usize> {
    let mut counts = BTreeMap::new();
    for result in results {
        *counts.entry(result.status).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use vtgrid_params::params;

    #[rstest]
    #[case("1-vm1", "1-vm1", 0)]
    #[case("3-vm1", "5-vm1", -2)]
    #[case("8-vm1", "5-vm1", 3)]
    #[case("5a-vm1", "5b-vm1", -1)]
    #[case("5b-vm1", "5a-vm1", 1)]
    #[case("5-vm1", "5a-vm1", -1)]
    #[case("5a-vm1", "5-vm1", 1)]
    #[case("5d2", "5d3", -1)]
    #[case("5d2a1", "5d2b1", -1)]
    fn prefix_priorities(#[case] ours: &str, #[case] theirs: &str, #[case] expected: i32) {
        assert_eq!(prefix_priority(ours, theirs).unwrap(), expected);
    }

    #[test]
    fn diverging_suffixes_admit_no_order() {
        let result = prefix_priority("5d2", "5d2-net1vm2");
        assert!(matches!(result, Err(GraphError::UnorderedPrefixes(_, _))));
    }

    #[test]
    fn identity_forms() {
        let node = TestNode::new(
            "5",
            "leaves.quicktest.tutorial1.net1",
            params! {
                "vms" => "vm1 vm2",
                "main_restrictions" => "leaves all",
            },
        );
        assert_eq!(node.setless_form(), "quicktest.tutorial1.net1");
        assert_eq!(node.long_prefix(), "5-vm1vm2");
        assert_eq!(node.id(), "5-vm1vm2-leaves.quicktest.tutorial1.net1");
        // without attached objects the bridged form stays setless
        assert_eq!(node.bridged_form(), "quicktest.tutorial1.net1");
    }

    #[test]
    fn longest_restriction_wins() {
        let node = TestNode::new(
            "1",
            "all.leaves.tutorial1",
            params! { "main_restrictions" => "all all.leaves" },
        );
        assert_eq!(node.setless_form(), "tutorial1");
    }

    #[test]
    fn name_is_mirrored_into_params() {
        let node = TestNode::new("1", "tutorial1.net1", Params::new());
        assert_eq!(node.params().get("name"), Some("tutorial1.net1"));
    }

    #[test]
    fn state_location_round_trip() {
        let shared: StateLocation = ":/mnt/shared/pool".parse().unwrap();
        assert!(shared.is_shared());
        assert_eq!(shared.to_string(), ":/mnt/shared/pool");

        let scoped: StateLocation = "net1:/mnt/local/pool".parse().unwrap();
        assert_eq!(scoped.worker, Some(WorkerId::from("net1")));
        assert_eq!(scoped.to_string(), "net1:/mnt/local/pool");

        assert!("no-colon-here".parse::<StateLocation>().is_err());
    }

    #[test]
    fn retry_tokens_reject_unknown() {
        assert_eq!("FAIL".parse::<TestStatus>().unwrap(), TestStatus::Fail);
        assert!("unknown".parse::<TestStatus>().is_err());
        assert!("maybe".parse::<TestStatus>().is_err());
    }

    #[test]
    fn results_serialize_with_lowercase_statuses() {
        let result = TestResult::new("tutorial1.net1", TestStatus::Pass, "net1")
            .with_elapsed(Duration::from_secs(3));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "pass");
        assert_eq!(json["worker"], "net1");
        let back: TestResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.status, TestStatus::Pass);
        assert_eq!(back.elapsed, Duration::from_secs(3));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn priority_is_antisymmetric(
                ours in "[0-9]{1,2}[a-d]?[0-9]{0,2}",
                theirs in "[0-9]{1,2}[a-d]?[0-9]{0,2}",
            ) {
                match (prefix_priority(&ours, &theirs), prefix_priority(&theirs, &ours)) {
                    (Ok(forward), Ok(backward)) => prop_assert_eq!(forward, -backward),
                    (Err(_), Err(_)) => {}
                    (forward, backward) => {
                        prop_assert!(false, "asymmetric: {:?} vs {:?}", forward, backward)
                    }
                }
            }

            #[test]
            fn priority_of_self_is_zero(prefix in "[0-9]{1,2}[a-d]?[0-9]{0,2}") {
                prop_assert_eq!(prefix_priority(&prefix, &prefix).unwrap(), 0);
            }
        }
    }
}
