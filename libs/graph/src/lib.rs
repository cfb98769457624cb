//! Cartesian test graph for VM integration suites.
//!
//! A test suite is compiled into a graph of [`TestNode`]s connected by
//! dependency edges: a node's *setup* neighbors provide the states it needs
//! and its *cleanup* neighbors consume the states it produces. A fleet of
//! [`TestWorker`]s traverses the graph concurrently, each worker deciding per
//! node whether to run, skip, or clean through the decision policies on
//! [`TestGraph`]. Key concepts:
//!
//! - **Node**: one runnable test variant plus its parameter database and
//!   per-worker bookkeeping (results, occupancy, traversal registers).
//! - **Object**: a net, VM, or image the node operates on; objects form
//!   their own composition hierarchy (nets contain VMs contain images).
//! - **Worker**: an environment slot (container, remote host, or local
//!   process) identified by its net suffix, grouped into swarms.
//! - **Bridging**: nodes parsed by different workers from the same variant
//!   are *bridged* so results and traversal registers are shared between
//!   them.
//! - **Door**: the [`ControlDoor`] trait ships state control requests to the
//!   environment actually hosting the states.
//!
//! # Invariants
//!
//! - The graph is acyclic and a node is never its own neighbor; both are
//!   enforced by [`TestGraph::validate`].
//! - Bridged nodes share one set of traversal registers, so picking and
//!   dropping through any bridged sibling is observed by all of them.
//! - Node bookkeeping is updated behind short internal locks and never
//!   across await points.

mod door;
mod edge_register;
mod error;
mod graph;
mod node;
mod object;
mod policy;
mod prefix_tree;
mod worker;

pub use door::{ControlDoor, DoorError, MockDoor, StateAction};
pub use edge_register::EdgeRegister;
pub use error::GraphError;
pub use graph::{NodeHandle, ObjectHandle, TestGraph};
pub use node::{
    prefix_priority, DependencyEdge, NodeRegisters, StateLocation, TestNode, TestResult,
    TestStatus,
};
pub use object::{ObjectKind, TestObject};
pub use prefix_tree::PrefixTree;
pub use worker::{SpawnerKind, SwarmId, TestSwarm, TestWorker, WorkerId};
