//! Error types for graph construction and traversal.

use thiserror::Error;
use vtgrid_params::ParamsError;

use crate::door::DoorError;
use crate::worker::WorkerId;

/// Errors raised while building or traversing the test graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A worker tried to decide on a node it is not entitled to run.
    #[error("worker {worker} is not entitled to operate on node {node}")]
    UnauthorizedWorker { worker: WorkerId, node: String },

    /// A retry status list holds a token outside the result vocabulary.
    #[error("invalid test status: {0:?}")]
    InvalidStatus(String),

    /// The `max_tries` parameter is negative.
    #[error("max_tries cannot be negative, got {0}")]
    NegativeMaxTries(i64),

    /// A started/finished query used a threshold outside `-1` and `1..`.
    #[error("unsupported worker threshold {0}")]
    InvalidThreshold(i64),

    /// Every pickable neighbor on one side has already been dropped.
    #[error("no remaining {role} candidates for node {node}")]
    NoCandidates { role: &'static str, node: String },

    /// A node was dropped that is not a neighbor on the given side.
    #[error("node {candidate} is not a {role} of node {node}")]
    NotANeighbor {
        role: &'static str,
        node: String,
        candidate: String,
    },

    /// Two nodes with different bridged forms cannot be bridged.
    #[error("cannot bridge {node} with non-equivalent node {other}")]
    NotEquivalent { node: String, other: String },

    /// A flat-only query was asked of a composed node.
    #[error("node {0} is not flat")]
    NotFlat(String),

    /// Two test prefixes admit no priority order.
    #[error("test prefixes {0:?} and {1:?} cannot be prioritized")]
    UnorderedPrefixes(String, String),

    /// A recorded result points at a worker the graph does not know.
    #[error("result worker {worker} of node {node} is not in the worker table")]
    UnknownResultWorker { worker: WorkerId, node: String },

    /// A state scan through the control door broke down.
    #[error("state scan of node {node} failed")]
    ScanFailed { node: String, source: DoorError },

    /// A control door call failed in a non-recoverable way.
    #[error(transparent)]
    Door(#[from] DoorError),

    /// A parameter lookup or conversion failed.
    #[error(transparent)]
    Params(#[from] ParamsError),

    /// An unrecognized worker spawner token.
    #[error("unsupported spawner kind: {0:?}")]
    InvalidSpawner(String),

    /// A state location string without the `worker:path` shape.
    #[error("malformed state location: {0:?}")]
    InvalidLocation(String),

    /// A composed node must reference exactly one net.
    #[error("node {node} must reference exactly one net, found {found}")]
    MultipleNets { node: String, found: usize },

    /// The net must be the first object of a composed node.
    #[error("the net of node {node} is not its first object")]
    NetNotFirst { node: String },

    /// The parametric net differs from the attached net object.
    #[error("node {node} is parsed for net {param} but attached to net {attr}")]
    NetMismatch {
        node: String,
        param: String,
        attr: String,
    },

    /// The parametric VM set differs from the attached VM objects.
    #[error("node {node} is parsed for vms [{param}] but attached to [{attr}]")]
    VmSetMismatch {
        node: String,
        param: String,
        attr: String,
    },

    /// A node listed among its own dependencies.
    #[error("node {0} depends on itself")]
    ReflexiveDependency(String),

    /// The dependency relation contains a cycle.
    #[error("dependency cycle detected through node {0}")]
    DependencyCycle(String),
}
