//! Backend contract, request envelope, and the dispatch registry.
//!
//! Concepts:
//!
//! - **Object family**: the closed set of object kinds states attach to,
//!   networks containing vms containing images.
//! - **State request**: the envelope a backend operates on, carrying the
//!   slash-joined name and family chains of the addressed object plus its
//!   fully resolved parameters.
//! - **Registry**: a closed table mapping the per-family `states`
//!   parameter value to a backend implementation, all wired over one set
//!   of imperative drivers.
//!
//! # Invariants
//! - Backends read operation details (`get_state`, `set_switch`, pool
//!   roots) from the request parameters, never from ambient config.
//! - The registry is built once; an unknown backend name is a
//!   configuration error, not a fallback.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use vtgrid_params::Params;

use crate::driver::{DiskTool, VmControl};
use crate::error::StateError;
use crate::net::NetBackend;
use crate::pool::{PoolBackend, PoolTransfer};
use crate::qcow2::{QcowBackend, QcowExtBackend, QcowVtBackend};
use crate::ramfile::RamfileBackend;

/// Families of stateful objects a backend can serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObjectKind {
    Net,
    Vm,
    Image,
}

impl ObjectKind {
    pub fn from_token(token: &str) -> Result<Self, StateError> {
        match token {
            "nets" => Ok(ObjectKind::Net),
            "vms" => Ok(ObjectKind::Vm),
            "images" => Ok(ObjectKind::Image),
            other => Err(StateError::UnknownFamily(other.to_string())),
        }
    }

    pub fn as_token(&self) -> &'static str {
        match self {
            ObjectKind::Net => "nets",
            ObjectKind::Vm => "vms",
            ObjectKind::Image => "images",
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_token())
    }
}

/// Envelope describing the object a state operation addresses.
///
/// `object_name` and `object_type` are slash-joined chains from the
/// outermost composite down to the object itself, mirroring the
/// parametric walk that produced the request. The parameters are fully
/// resolved for the object, with its family suffixes already peeled.
#[derive(Clone, Debug)]
pub struct StateRequest {
    object_name: String,
    object_type: String,
    params: Params,
}

impl StateRequest {
    pub fn new(
        object_name: impl Into<String>,
        object_type: impl Into<String>,
        params: Params,
    ) -> Self {
        StateRequest {
            object_name: object_name.into(),
            object_type: object_type.into(),
            params,
        }
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Family of the object itself, the innermost chain element.
    pub fn kind(&self) -> Result<ObjectKind, StateError> {
        let token = self
            .object_type
            .rsplit('/')
            .next()
            .unwrap_or(&self.object_type);
        ObjectKind::from_token(token)
    }

    /// Name of the vm on the chain, falling back to the `vms` parameter
    /// for requests restricted below the vm level.
    pub fn vm_name(&self) -> Result<String, StateError> {
        for (family, name) in self
            .object_type
            .split('/')
            .zip(self.object_name.split('/'))
        {
            if family == "vms" {
                return Ok(name.to_string());
            }
        }
        Ok(self.params.require("vms")?.to_string())
    }

    /// Directory identity of the object under a state pool. Composites
    /// stamp this into their parameters so components share it.
    pub fn object_id(&self) -> String {
        if let Some(id) = self.params.get("object_id") {
            return id.to_string();
        }
        let mut parts: Vec<&str> = self.object_name.split('/').collect();
        parts.reverse();
        parts.join("_")
    }

    /// Same chains with replaced parameters.
    pub fn with_params(&self, params: Params) -> StateRequest {
        StateRequest {
            object_name: self.object_name.clone(),
            object_type: self.object_type.clone(),
            params,
        }
    }

    /// Derived request for a nested component of this object.
    pub fn nested(&self, kind: ObjectKind, name: &str, params: Params) -> StateRequest {
        StateRequest {
            object_name: format!("{}/{}", self.object_name, name),
            object_type: format!("{}/{}", self.object_type, kind.as_token()),
            params,
        }
    }
}

/// Uniform contract every state backend implements.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// List the states the backend holds for the requested object.
    async fn show(&self, req: &StateRequest) -> Result<Vec<String>, StateError>;

    /// Switch the object to a stored state, discarding current changes.
    async fn get(&self, req: &StateRequest) -> Result<(), StateError>;

    /// Store the current changes of the object as a state.
    async fn set(&self, req: &StateRequest) -> Result<(), StateError>;

    /// Remove a stored state.
    async fn unset(&self, req: &StateRequest) -> Result<(), StateError>;

    /// Whether the object root, the object itself, is available.
    async fn check_root(&self, req: &StateRequest) -> Result<bool, StateError>;

    /// Provide the object root.
    async fn initialize(&self, req: &StateRequest) -> Result<(), StateError>;

    /// Withdraw the object root.
    async fn finalize(&self, req: &StateRequest) -> Result<(), StateError>;

    /// Whether a state of this name is present, by prefix match over the
    /// listed states.
    async fn check(&self, req: &StateRequest, state: &str) -> Result<bool, StateError> {
        Ok(self
            .show(req)
            .await?
            .iter()
            .any(|listed| listed.starts_with(state)))
    }

    /// Whether stored states back each other, so an overwrite must never
    /// remove the previous state first.
    fn is_sourced(&self) -> bool {
        false
    }
}

/// Walk the images of a vm request and intersect their state listings.
///
/// With `ram_first` the first image is asked for states holding a run
/// state, since that is where one would be stored.
pub(crate) async fn composed_image_states(
    images: &Arc<dyn StateBackend>,
    req: &StateRequest,
    ram_first: bool,
) -> Result<std::collections::BTreeSet<String>, StateError> {
    let params = req.params();
    let mut shared: Option<std::collections::BTreeSet<String>> = None;
    for (index, image) in params.objects("images").iter().enumerate() {
        let mut image_params = params.object_params(image);
        image_params.insert("images", image.as_str());
        let require_ram = if ram_first && index == 0 { "yes" } else { "no" };
        image_params.insert("require_ram", require_ram);
        let image_req = req.nested(ObjectKind::Image, image, image_params);
        let listed: std::collections::BTreeSet<String> =
            images.show(&image_req).await?.into_iter().collect();
        shared = Some(match shared {
            None => listed,
            Some(previous) => previous.intersection(&listed).cloned().collect(),
        });
    }
    Ok(shared.unwrap_or_default())
}

/// Imperative toolbox shared by all backends.
#[derive(Clone)]
pub struct Drivers {
    pub disk: Arc<dyn DiskTool>,
    pub vm: Arc<dyn VmControl>,
    pub pool: Arc<dyn PoolTransfer>,
}

/// Closed dispatch table from per-family backend names to implementations.
pub struct BackendRegistry {
    drivers: Drivers,
    nets: BTreeMap<&'static str, Arc<dyn StateBackend>>,
    vms: BTreeMap<&'static str, Arc<dyn StateBackend>>,
    images: BTreeMap<&'static str, Arc<dyn StateBackend>>,
}

impl BackendRegistry {
    /// Wire the built-in backends over one set of drivers.
    ///
    /// Image states come as internal snapshots (`qcow2`), external
    /// overlay files under the swarm pool (`qcow2ext`), or pool-mirrored
    /// overlays (`pool`). Vm states come as synchronized internal
    /// snapshots (`qcow2vt`) or as run state dumps next to external
    /// overlays (`ramfile`). Network states are rebuilt on demand (`net`).
    pub fn new(drivers: Drivers) -> Self {
        let internal: Arc<dyn StateBackend> =
            Arc::new(QcowBackend::new(drivers.disk.clone(), drivers.vm.clone()));
        let external: Arc<dyn StateBackend> = Arc::new(QcowExtBackend::new(
            drivers.disk.clone(),
            drivers.vm.clone(),
        ));
        let pool: Arc<dyn StateBackend> =
            Arc::new(PoolBackend::new(external.clone(), drivers.pool.clone()));
        let vt: Arc<dyn StateBackend> =
            Arc::new(QcowVtBackend::new(internal.clone(), drivers.vm.clone()));
        let ramfile: Arc<dyn StateBackend> =
            Arc::new(RamfileBackend::new(external.clone(), drivers.vm.clone()));
        let net: Arc<dyn StateBackend> = Arc::new(NetBackend::new());

        let mut images = BTreeMap::new();
        images.insert("qcow2", internal);
        images.insert("qcow2ext", external);
        images.insert("pool", pool);
        let mut vms = BTreeMap::new();
        vms.insert("qcow2vt", vt);
        vms.insert("ramfile", ramfile);
        let mut nets = BTreeMap::new();
        nets.insert("net", net);

        BackendRegistry {
            drivers,
            nets,
            vms,
            images,
        }
    }

    pub fn drivers(&self) -> &Drivers {
        &self.drivers
    }

    /// Resolve the backend an object's `states` parameter selects.
    pub fn select(
        &self,
        kind: ObjectKind,
        name: &str,
    ) -> Result<Arc<dyn StateBackend>, StateError> {
        let table = match kind {
            ObjectKind::Net => &self.nets,
            ObjectKind::Vm => &self.vms,
            ObjectKind::Image => &self.images,
        };
        table
            .get(name)
            .cloned()
            .ok_or_else(|| StateError::UnknownBackend {
                family: kind.as_token(),
                name: name.to_string(),
            })
    }
}
