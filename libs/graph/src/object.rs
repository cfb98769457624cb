//! Test objects: the nets, VMs, and images tests operate on.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use vtgrid_params::Params;

use crate::graph::ObjectHandle;

/// The composition level of a test object.
///
/// Nets contain VMs, VMs contain images. The string forms match the
/// parameter sections the object reads its configuration from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Net,
    Vm,
    Image,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Net => "nets",
            ObjectKind::Vm => "vms",
            ObjectKind::Image => "images",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A net, VM, or image participating in the graph.
///
/// The `suffix` is the bare object name (`vm1`, `image1`), the
/// `long_suffix` prepends the containing objects (`image1_vm1`) and is
/// unique per graph.
pub struct TestObject {
    suffix: String,
    long_suffix: String,
    kind: ObjectKind,
    params: Params,
    components: Mutex<Vec<ObjectHandle>>,
    composites: Mutex<Vec<ObjectHandle>>,
}

impl TestObject {
    pub fn new(
        suffix: impl Into<String>,
        long_suffix: impl Into<String>,
        kind: ObjectKind,
        params: Params,
    ) -> Self {
        Self {
            suffix: suffix.into(),
            long_suffix: long_suffix.into(),
            kind,
            params,
            components: Mutex::new(Vec::new()),
            composites: Mutex::new(Vec::new()),
        }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// The unique object identifier, its long suffix.
    pub fn id(&self) -> &str {
        &self.long_suffix
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// The object's own configuration.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Objects contained in this one (VMs of a net, images of a VM).
    pub fn components(&self) -> Vec<ObjectHandle> {
        self.components.lock().unwrap().clone()
    }

    /// Objects this one is contained in.
    pub fn composites(&self) -> Vec<ObjectHandle> {
        self.composites.lock().unwrap().clone()
    }

    pub(crate) fn add_component(&self, handle: ObjectHandle) {
        self.components.lock().unwrap().push(handle);
    }

    pub(crate) fn add_composite(&self, handle: ObjectHandle) {
        self.composites.lock().unwrap().push(handle);
    }

    /// Resolve a node's parameters down to this object's view.
    ///
    /// Suffix markers are peeled outermost-first, so an image resolves the
    /// VM overrides before its own.
    pub fn object_typed_params(&self, node_params: &Params) -> Params {
        let mut resolved = node_params.clone();
        for token in self.long_suffix.split('_').rev() {
            resolved = resolved.object_params(token);
        }
        resolved
    }

    /// Whether the object survives cleanup as permanent infrastructure.
    pub fn is_permanent(&self) -> bool {
        self.params.get_boolean("permanent_vm", false).unwrap_or(false)
    }
}

impl fmt::Debug for TestObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestObject")
            .field("id", &self.long_suffix)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
