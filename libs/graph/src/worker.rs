//! Workers, swarms, and their identifiers.
//!
//! A worker is one environment slot that can run tests: a container on the
//! local host, a remote host reached through a swarm gateway, or a plain
//! process. Workers are named after the net suffix they serve (`net1`,
//! `cluster1/net6`) and grouped into swarms by gateway.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use vtgrid_params::Params;

use crate::error::GraphError;

macro_rules! define_name_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

define_name_id! {
    /// Identifier of one test worker, typically its net suffix.
    WorkerId
}

define_name_id! {
    /// Identifier of a worker swarm, `localhost` for container swarms.
    SwarmId
}

/// How a worker's environment is brought up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnerKind {
    /// A container slot on the local host.
    Lxc,
    /// A slot on a remote host behind a swarm gateway.
    Remote,
    /// A plain process slot, mostly for self-contained runs.
    Process,
}

impl SpawnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpawnerKind::Lxc => "lxc",
            SpawnerKind::Remote => "remote",
            SpawnerKind::Process => "process",
        }
    }
}

impl fmt::Display for SpawnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SpawnerKind {
    type Err = GraphError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token {
            "lxc" => Ok(SpawnerKind::Lxc),
            "remote" => Ok(SpawnerKind::Remote),
            "process" => Ok(SpawnerKind::Process),
            other => Err(GraphError::InvalidSpawner(other.to_owned())),
        }
    }
}

/// One environment slot able to traverse the graph.
pub struct TestWorker {
    id: WorkerId,
    swarm: SwarmId,
    gateway: String,
    host: String,
    spawner: SpawnerKind,
    params: Params,
    restricted_objects: Mutex<BTreeSet<String>>,
}

impl TestWorker {
    /// Build a worker from its parameter database.
    ///
    /// The swarm is derived from `nets_gateway`: workers without a gateway
    /// form the `localhost` swarm.
    pub fn new(id: impl Into<WorkerId>, params: Params) -> Result<Self, GraphError> {
        let gateway = params.get_or("nets_gateway", "").to_owned();
        let host = params.get_or("nets_host", "").to_owned();
        let spawner: SpawnerKind = params.get_or("nets_spawner", "lxc").parse()?;
        let swarm = if gateway.is_empty() {
            SwarmId::from("localhost")
        } else {
            SwarmId::new(gateway.clone())
        };
        Ok(Self {
            id: id.into(),
            swarm,
            gateway,
            host,
            spawner,
            params,
            restricted_objects: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn swarm(&self) -> &SwarmId {
        &self.swarm
    }

    pub fn gateway(&self) -> &str {
        &self.gateway
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn spawner(&self) -> SpawnerKind {
        self.spawner
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// The `gateway/host` pair identifying the worker's runtime entry.
    pub fn runtime_entry(&self) -> String {
        format!("{}/{}", self.gateway, self.host)
    }

    /// Exclude an object suffix from everything this worker may run.
    pub fn restrict_object(&self, suffix: impl Into<String>) {
        self.restricted_objects.lock().unwrap().insert(suffix.into());
    }

    /// Whether any object is excluded for this worker.
    pub fn is_restricted(&self) -> bool {
        !self.restricted_objects.lock().unwrap().is_empty()
    }

    /// Whether the given object suffix is excluded for this worker.
    pub fn is_restricted_for(&self, suffix: &str) -> bool {
        self.restricted_objects.lock().unwrap().contains(suffix)
    }
}

impl fmt::Debug for TestWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestWorker")
            .field("id", &self.id)
            .field("swarm", &self.swarm)
            .field("spawner", &self.spawner)
            .finish_non_exhaustive()
    }
}

/// A group of workers behind one gateway.
#[derive(Clone, Debug)]
pub struct TestSwarm {
    pub id: SwarmId,
    pub workers: Vec<WorkerId>,
}
