//! State operation ladders over parametric object chains.
//!
//! Concepts:
//!
//! - **Object chain**: the `states_chain` parameter names the object
//!   families an operation walks, e.g. `nets vms images`. Components are
//!   visited before the composites containing them, each with parameters
//!   resolved for that object.
//! - **Mode ladder**: every operation consults its [`ModeString`] at the
//!   branch matching what it found, deciding between aborting, reusing,
//!   forcing, and ignoring.
//! - **Existence probe**: whether a state exists is answered by a `show`
//!   restricted to the object's own chain, with the operation's root
//!   pair steering the object preconditions.
//!
//! # Invariants
//! - Only the `abort` choice surfaces as an error; `ignore` and `reuse`
//!   end the object quietly.
//! - A mode character is validated at the branch actually taken, so an
//!   illegal character in a branch never reached stays harmless.

use tracing::{debug, info, instrument, warn};
use vtgrid_params::Params;

use crate::backend::{BackendRegistry, ObjectKind, StateRequest};
use crate::error::StateError;
use crate::policy::{ModeString, PolicyChar};

/// Orchestrates state operations across backends and object chains.
pub struct StateOps {
    registry: BackendRegistry,
}

impl StateOps {
    pub fn new(registry: BackendRegistry) -> Self {
        StateOps { registry }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// List the states of the objects on the chain, returning the listing
    /// of the last evaluated object.
    ///
    /// The listing applies the root precondition ladder of `show_mode`
    /// and keeps only states matching `show_state` by name prefix, with
    /// `root` standing for the object itself. Meaningful mostly for
    /// chains restricted to a single object.
    #[instrument(skip(self, params), fields(chain = %params.get_or("states_chain", "")))]
    pub async fn show(&self, params: &Params) -> Result<Vec<String>, StateError> {
        let mut states = Vec::new();
        for req in object_requests(params)? {
            if let Some(listed) = self.show_object(&req).await? {
                states = listed;
            }
        }
        Ok(states)
    }

    /// Switch every object on the chain to its `get_state`.
    #[instrument(skip(self, params), fields(chain = %params.get_or("states_chain", "")))]
    pub async fn get(&self, params: &Params) -> Result<(), StateError> {
        for req in object_requests(params)? {
            self.get_object(&req).await?;
        }
        Ok(())
    }

    /// Store the current changes of every object on the chain as its
    /// `set_state`.
    #[instrument(skip(self, params), fields(chain = %params.get_or("states_chain", "")))]
    pub async fn set(&self, params: &Params) -> Result<(), StateError> {
        for req in object_requests(params)? {
            self.set_object(&req).await?;
        }
        Ok(())
    }

    /// Remove the `unset_state` of every object on the chain.
    #[instrument(skip(self, params), fields(chain = %params.get_or("states_chain", "")))]
    pub async fn unset(&self, params: &Params) -> Result<(), StateError> {
        for req in object_requests(params)? {
            self.unset_object(&req).await?;
        }
        Ok(())
    }

    /// Store a nested state on top of an existing one, refusing to
    /// overwrite a previous push.
    #[instrument(skip(self, params), fields(chain = %params.get_or("states_chain", "")))]
    pub async fn push(&self, params: &Params) -> Result<(), StateError> {
        for req in object_requests(params)? {
            let params = req.params();
            let Some(state) = requested_state(params, "push_state") else {
                continue;
            };
            let mut set_params = params.clone();
            set_params.insert("set_state", state.as_str());
            set_params.insert("set_mode", params.get_or("push_mode", "afrf"));
            self.set_object(&req.with_params(set_params)).await?;
        }
        Ok(())
    }

    /// Retrieve and then drop a previously pushed state.
    ///
    /// An explicitly configured `pop_mode` steers both halves; the
    /// defaults retrieve passively and remove tolerantly.
    #[instrument(skip(self, params), fields(chain = %params.get_or("states_chain", "")))]
    pub async fn pop(&self, params: &Params) -> Result<(), StateError> {
        for req in object_requests(params)? {
            let params = req.params();
            let Some(state) = requested_state(params, "pop_state") else {
                continue;
            };
            let mut get_params = params.clone();
            get_params.insert("get_state", state.as_str());
            get_params.insert("get_mode", params.get_or("pop_mode", "rara"));
            self.get_object(&req.with_params(get_params)).await?;

            let mut unset_params = params.clone();
            unset_params.insert("unset_state", state.as_str());
            unset_params.insert("unset_mode", params.get_or("pop_mode", "fari"));
            self.unset_object(&req.with_params(unset_params)).await?;
        }
        Ok(())
    }

    /// List one object, or None when it was skipped rather than listed.
    async fn show_object(&self, req: &StateRequest) -> Result<Option<Vec<String>>, StateError> {
        let params = req.params();
        if excluded(req)? {
            return Ok(None);
        }
        let kind = req.kind()?;
        let Some(state) = requested_state(params, "show_state") else {
            debug!(object = %req.object_name(), "No state requested for the object");
            return Ok(None);
        };
        let mode = mode_from(params, "show_mode", "ra")?;
        let backend = self.registry.select(kind, params.require("states")?)?;

        let mut root = backend.check_root(req).await?;
        if !root {
            match mode.absent() {
                PolicyChar::Abort => {
                    return Err(StateError::Abort(format!(
                        "Unmet preconditions for {} and no permission to provide them",
                        req.object_name()
                    )));
                }
                PolicyChar::Ignore => {
                    warn!(
                        object = %req.object_name(),
                        "No states to list given the missing preconditions"
                    );
                    return Ok(Some(Vec::new()));
                }
                PolicyChar::Force => {
                    info!(object = %req.object_name(), "Creating the missing preconditions");
                    let mut root_params = params.clone();
                    root_params.insert("pool_scope", "own");
                    backend.initialize(&req.with_params(root_params)).await?;
                    root = true;
                }
                PolicyChar::Reuse => {
                    return Err(invalid_policy(&mode, "missing preconditions", "abort, ignore, force"));
                }
            }
        } else {
            match mode.present() {
                PolicyChar::Abort => {
                    return Err(StateError::Abort(format!(
                        "Unwanted preconditions for {} and no permission to drop them",
                        req.object_name()
                    )));
                }
                PolicyChar::Reuse => {}
                PolicyChar::Force => {
                    info!(object = %req.object_name(), "Removing the present preconditions");
                    if kind == ObjectKind::Vm {
                        // the root of a vm is the running vm itself
                        let graceful = params.get_or("soft_boot", "yes") != "no";
                        self.registry
                            .drivers()
                            .vm
                            .stop(&req.vm_name()?, graceful)
                            .await?;
                    } else {
                        let mut root_params = params.clone();
                        root_params.insert("pool_scope", "own");
                        backend.finalize(&req.with_params(root_params)).await?;
                    }
                    root = false;
                }
                PolicyChar::Ignore => {
                    return Err(invalid_policy(&mode, "present preconditions", "abort, reuse, force"));
                }
            }
        }

        let mut states = Vec::new();
        if root {
            states.push("root".to_string());
            states.extend(backend.show(req).await?);
        }
        states.retain(|listed| listed.starts_with(state.as_str()));
        debug!(
            object = %req.object_name(),
            found = states.len(),
            state = %state,
            "Listed matching states"
        );
        Ok(Some(states))
    }

    async fn get_object(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        if excluded(req)? {
            return Ok(());
        }
        let Some(state) = requested_state(params, "get_state") else {
            debug!(object = %req.object_name(), "No state to retrieve for the object");
            return Ok(());
        };
        let mode = mode_from(params, "get_mode", "rara")?;
        if !self.state_exists(req, "get", &state, &mode).await? {
            match mode.absent() {
                PolicyChar::Abort => {
                    return Err(StateError::Abort(format!(
                        "State {state} of {} is missing and the policy stays passive",
                        req.object_name()
                    )));
                }
                PolicyChar::Ignore => {
                    warn!(state = %state, object = %req.object_name(), "Ignoring the missing state");
                    return Ok(());
                }
                _ => {
                    return Err(invalid_policy(&mode, "missing states during retrieval", "abort, ignore"));
                }
            }
        } else {
            match mode.present() {
                PolicyChar::Abort => {
                    return Err(StateError::Abort(format!(
                        "State {state} of {} is already present and the policy stays passive",
                        req.object_name()
                    )));
                }
                PolicyChar::Reuse => {}
                PolicyChar::Ignore => {
                    warn!(state = %state, object = %req.object_name(), "Ignoring the present state");
                    return Ok(());
                }
                PolicyChar::Force => {
                    return Err(invalid_policy(&mode, "present states during retrieval", "abort, reuse, ignore"));
                }
            }
        }
        let backend = self.registry.select(req.kind()?, params.require("states")?)?;
        backend.get(req).await
    }

    async fn set_object(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        if excluded(req)? {
            return Ok(());
        }
        let Some(state) = requested_state(params, "set_state") else {
            debug!(object = %req.object_name(), "No state to store for the object");
            return Ok(());
        };
        let mode = mode_from(params, "set_mode", "ffrf")?;
        let exists = self.state_exists(req, "set", &state, &mode).await?;
        let backend = self.registry.select(req.kind()?, params.require("states")?)?;
        if exists {
            match mode.present() {
                PolicyChar::Abort => {
                    return Err(StateError::Abort(format!(
                        "State {state} of {} already exists and may not be overwritten",
                        req.object_name()
                    )));
                }
                PolicyChar::Reuse => {
                    info!(state = %state, "Keeping the already existing state untouched");
                    return Ok(());
                }
                PolicyChar::Force => {
                    if backend.is_sourced() {
                        warn!(
                            state = %state,
                            "Preserving the existing state during overwrite since stored states back each other"
                        );
                    } else {
                        info!(state = %state, "Removing the existing state before overwriting");
                        let mut unset_params = params.clone();
                        unset_params.insert("unset_state", state.as_str());
                        backend.unset(&req.with_params(unset_params)).await?;
                    }
                }
                PolicyChar::Ignore => {
                    return Err(invalid_policy(&mode, "present states during storage", "abort, reuse, force"));
                }
            }
        } else {
            match mode.absent() {
                PolicyChar::Abort => {
                    return Err(StateError::Abort(format!(
                        "State {state} of {} does not exist and may not be created",
                        req.object_name()
                    )));
                }
                PolicyChar::Force => {
                    info!(state = %state, object = %req.object_name(), "Creating a new state");
                }
                _ => {
                    return Err(invalid_policy(&mode, "missing states during storage", "abort, force"));
                }
            }
        }
        backend.set(req).await
    }

    async fn unset_object(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        if excluded(req)? {
            return Ok(());
        }
        let Some(state) = requested_state(params, "unset_state") else {
            debug!(object = %req.object_name(), "No state to remove for the object");
            return Ok(());
        };
        let mode = mode_from(params, "unset_mode", "firi")?;
        if !self.state_exists(req, "unset", &state, &mode).await? {
            match mode.absent() {
                PolicyChar::Abort => {
                    return Err(StateError::Abort(format!(
                        "State {state} of {} to remove is missing",
                        req.object_name()
                    )));
                }
                PolicyChar::Ignore => {
                    warn!(state = %state, object = %req.object_name(), "Ignoring the missing state for cleanup");
                    return Ok(());
                }
                _ => {
                    return Err(invalid_policy(&mode, "missing states during removal", "abort, ignore"));
                }
            }
        } else {
            match mode.present() {
                PolicyChar::Reuse => {
                    info!(state = %state, "Preserving the state for later runs");
                    return Ok(());
                }
                PolicyChar::Force => {}
                _ => {
                    return Err(invalid_policy(&mode, "present states during removal", "reuse, force"));
                }
            }
        }
        let backend = self.registry.select(req.kind()?, params.require("states")?)?;
        backend.unset(req).await
    }

    /// Probe whether a state exists, by a listing restricted to the
    /// object's own chain with the operation's root pair in charge of the
    /// preconditions.
    async fn state_exists(
        &self,
        req: &StateRequest,
        op: &str,
        state: &str,
        mode: &ModeString,
    ) -> Result<bool, StateError> {
        let mut probe = req.params().clone();
        probe.insert("show_state", state);
        probe.insert("show_mode", mode.root_mode().as_str());
        probe.insert("soft_boot", if op == "set" { "yes" } else { "no" });
        for (family, name) in req
            .object_type()
            .split('/')
            .zip(req.object_name().split('/'))
        {
            probe.insert(family, name);
        }
        let own_family = req
            .object_type()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        probe.insert("states_chain", own_family);
        Ok(!self.show(&probe).await?.is_empty())
    }
}

/// Materialize the parametric walk of the object chain, components
/// before the composites containing them.
fn object_requests(params: &Params) -> Result<Vec<StateRequest>, StateError> {
    let chain = params.objects("states_chain");
    if chain.is_empty() {
        return Err(StateError::MissingChain(
            params.get_or("name", "<anonymous>").to_string(),
        ));
    }
    // a restricted walk keeps the identity stamped by the full walk
    let stamped = params.get("object_id").is_some();
    let mut requests = Vec::new();
    descend(params, &chain, 0, stamped, &mut Vec::new(), &mut requests)?;
    Ok(requests)
}

fn descend(
    params: &Params,
    chain: &[String],
    level: usize,
    stamped: bool,
    names: &mut Vec<String>,
    out: &mut Vec<StateRequest>,
) -> Result<(), StateError> {
    let family = &chain[level];
    let kind = ObjectKind::from_token(family)?;
    for name in params.objects(family) {
        let mut scoped = params.object_params(&name);
        scoped.insert(family.as_str(), name.as_str());
        names.push(name.clone());
        if kind != ObjectKind::Image && !stamped {
            // components store their states under the composite's identity
            let mut id_parts: Vec<&str> = names.iter().map(String::as_str).collect();
            id_parts.reverse();
            scoped.insert("object_id", id_parts.join("_"));
        }
        if level + 1 < chain.len() {
            descend(&scoped, chain, level + 1, stamped, names, out)?;
        }
        // family-wide parameters resolve last and never propagate down
        let resolved = scoped.object_params(family);
        out.push(StateRequest::new(
            names.join("/"),
            chain[..=level].join("/"),
            resolved,
        ));
        names.pop();
    }
    Ok(())
}

/// Whether the walk passes the object by, either because its type is
/// listed in `skip_types` or because its image is configured read-only.
fn excluded(req: &StateRequest) -> Result<bool, StateError> {
    let params = req.params();
    if params
        .objects("skip_types")
        .iter()
        .any(|skipped| skipped.as_str() == req.object_type())
    {
        debug!(object = %req.object_name(), "Skipping excluded object type");
        return Ok(true);
    }
    if req.kind()? == ObjectKind::Image && params.get_boolean("image_readonly", false)? {
        warn!(object = %req.object_name(), "Skipping the states of a read-only image");
        return Ok(true);
    }
    Ok(false)
}

fn requested_state(params: &Params, key: &str) -> Option<String> {
    params
        .get(key)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn mode_from(params: &Params, key: &str, default: &str) -> Result<ModeString, StateError> {
    ModeString::parse(params.get_or(key, default))
}

fn invalid_policy(mode: &ModeString, branch: &'static str, allowed: &'static str) -> StateError {
    StateError::InvalidPolicy {
        mode: mode.to_string(),
        branch,
        allowed,
    }
}
