//! Pluggable state backends for VM integration suites.
//!
//! Tests reuse each other's setup through *states*: saved snapshots of an
//! image, a vm, or a network that can be stored once and switched to many
//! times. [`StateOps`] walks the object chain of a test parameter set and
//! applies one of the six state operations to every object on it, with a
//! [`StateBackend`] implementation carrying out the per-object work. Key
//! concepts:
//!
//! - **Object chain**: nets contain vms contain images; components are
//!   visited before the composites built from them, each with parameters
//!   resolved for that object.
//! - **Mode string**: a compact policy of two to four characters deciding
//!   how an operation treats present states, missing states, and the
//!   object root (see [`ModeString`]).
//! - **Root**: the precondition of having states at all, such as the
//!   backing image existing or the vm being available.
//! - **Backend**: where states live, from internal snapshot tables
//!   (`qcow2`, `qcow2vt`) over external overlay files (`qcow2ext`,
//!   `ramfile`) to a shared pool mirror (`pool`).
//! - **Drivers**: the imperative boundary toward disk tooling and vm
//!   controllers, mockable for tests.
//!
//! # Invariants
//!
//! - Backends never consult ambient configuration; everything an
//!   operation needs arrives in the [`StateRequest`].
//! - Only the `abort` policy choice surfaces as an error; `reuse` and
//!   `ignore` end an object quietly.
//! - Vm images are switched off and back on around disk manipulation,
//!   keeping state storage and vm lifecycle consistent.

mod backend;
mod driver;
mod error;
mod net;
mod ops;
mod policy;
mod pool;
mod qcow2;
mod ramfile;

pub use backend::{BackendRegistry, Drivers, ObjectKind, StateBackend, StateRequest};
pub use driver::{DiskTool, DriverError, MockDisk, MockVm, Snapshot, VmControl};
pub use error::StateError;
pub use net::NetBackend;
pub use ops::StateOps;
pub use policy::{ModeString, PolicyChar};
pub use pool::{FsPoolTransfer, MockTransfer, PoolBackend, PoolTransfer};
pub use qcow2::{QcowBackend, QcowExtBackend, QcowVtBackend};
pub use ramfile::RamfileBackend;
