//! QCOW2 image and vm state backends.
//!
//! Three backends share the qemu-img tooling:
//!
//! - [`QcowBackend`] keeps image states as rows of the image's own
//!   internal snapshot table.
//! - [`QcowExtBackend`] keeps image states as standalone overlay files
//!   under the swarm state pool, with the image itself reduced to a head
//!   pointer backed by one of them.
//! - [`QcowVtBackend`] keeps vm states as internal snapshots synchronized
//!   across all images of the vm, the first image also holding the run
//!   state.
//!
//! # Invariants
//! - Image operations power the vm off and back on around the disk
//!   manipulation, as steered by the `{op}_switch` flag.
//! - An external state is only overwritten inside its own backing chain:
//!   committing into an ancestor or replacing a sibling, never rewriting
//!   an unrelated file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};
use vtgrid_params::Params;

use crate::backend::{composed_image_states, ObjectKind, StateBackend, StateRequest};
use crate::driver::{DiskTool, VmControl};
use crate::error::StateError;

/// How to handle a running vm around an image state operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SwitchFlag {
    Soft,
    Hard,
    None,
}

pub(crate) fn switch_flag(params: &Params, op: &str) -> Result<SwitchFlag, StateError> {
    match params.get_or(&format!("{op}_switch"), "soft") {
        "soft" => Ok(SwitchFlag::Soft),
        "hard" => Ok(SwitchFlag::Hard),
        "none" => Ok(SwitchFlag::None),
        other => Err(StateError::InvalidSwitch(other.to_string())),
    }
}

/// Absolute path of the image the parameters describe.
pub(crate) fn image_path(params: &Params) -> Result<PathBuf, StateError> {
    let name = params.require("image_name")?;
    let path = if Path::new(name).is_absolute() {
        PathBuf::from(name)
    } else {
        Path::new(params.require("images_base_dir")?).join(name)
    };
    match params.get_or("image_format", "qcow2") {
        "" | "raw" => Ok(path),
        "qcow2" => {
            let mut os = path.into_os_string();
            os.push(".qcow2");
            Ok(PathBuf::from(os))
        }
        other => Err(StateError::UnsupportedFormat {
            image: name.to_string(),
            format: other.to_string(),
        }),
    }
}

pub(crate) async fn switch_off(
    vm: &Arc<dyn VmControl>,
    flag: SwitchFlag,
    vm_name: &str,
) -> Result<(), StateError> {
    if !vm.is_alive(vm_name).await? {
        debug!(vm = vm_name, "No running vm to switch off");
        return Ok(());
    }
    if flag == SwitchFlag::None {
        return Err(StateError::LiveVm(vm_name.to_string()));
    }
    info!(vm = vm_name, "Switching the running vm off for an image state operation");
    vm.stop(vm_name, flag == SwitchFlag::Soft).await?;
    Ok(())
}

pub(crate) async fn switch_on(
    vm: &Arc<dyn VmControl>,
    flag: SwitchFlag,
    vm_name: &str,
) -> Result<(), StateError> {
    if flag == SwitchFlag::None {
        return Ok(());
    }
    if vm.is_alive(vm_name).await? {
        debug!(vm = vm_name, "The vm is already running");
        return Ok(());
    }
    info!(vm = vm_name, "Starting the vm back up after the image state operation");
    vm.start(vm_name).await?;
    Ok(())
}

/// Image states as internal QCOW2 snapshots.
pub struct QcowBackend {
    disk: Arc<dyn DiskTool>,
    vm: Arc<dyn VmControl>,
}

impl QcowBackend {
    pub fn new(disk: Arc<dyn DiskTool>, vm: Arc<dyn VmControl>) -> Self {
        QcowBackend { disk, vm }
    }

    async fn stop_for_root(&self, req: &StateRequest) -> Result<(), StateError> {
        let vm_name = req.vm_name()?;
        if self.vm.is_alive(&vm_name).await? {
            let graceful = req.params().get_or("soft_boot", "yes") != "no";
            self.vm.stop(&vm_name, graceful).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateBackend for QcowBackend {
    async fn show(&self, req: &StateRequest) -> Result<Vec<String>, StateError> {
        let params = req.params();
        let path = image_path(params)?;
        debug!(image = %path.display(), "Showing internal snapshot states");
        let require_ram = params.get_boolean("require_ram", false)?;
        let rows = self.disk.snapshot_list(&path).await?;
        Ok(rows
            .into_iter()
            .filter(|row| {
                if require_ram {
                    row.vm_size > 0
                } else {
                    row.vm_size == 0
                }
            })
            .map(|row| row.tag)
            .collect())
    }

    async fn get(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        let state = params.require("get_state")?;
        let vm_name = req.vm_name()?;
        let flag = switch_flag(params, "get")?;
        info!(
            state = %state,
            vm = %vm_name,
            image = %params.require("images")?,
            "Reusing image state"
        );
        switch_off(&self.vm, flag, &vm_name).await?;
        self.disk.snapshot_apply(&image_path(params)?, state).await?;
        switch_on(&self.vm, flag, &vm_name).await
    }

    async fn set(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        let state = params.require("set_state")?;
        let vm_name = req.vm_name()?;
        let flag = switch_flag(params, "set")?;
        info!(
            state = %state,
            vm = %vm_name,
            image = %params.require("images")?,
            "Storing image state"
        );
        switch_off(&self.vm, flag, &vm_name).await?;
        self.disk.snapshot_create(&image_path(params)?, state).await?;
        switch_on(&self.vm, flag, &vm_name).await
    }

    async fn unset(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        let state = params.require("unset_state")?;
        let vm_name = req.vm_name()?;
        let flag = switch_flag(params, "unset")?;
        info!(
            state = %state,
            vm = %vm_name,
            image = %params.require("images")?,
            "Removing image state"
        );
        switch_off(&self.vm, flag, &vm_name).await?;
        self.disk.snapshot_delete(&image_path(params)?, state).await?;
        switch_on(&self.vm, flag, &vm_name).await
    }

    async fn check_root(&self, req: &StateRequest) -> Result<bool, StateError> {
        let path = image_path(req.params())?;
        let present = fs::try_exists(&path).await?;
        debug!(
            image = %path.display(),
            present,
            "Checked for the backing image of the object"
        );
        Ok(present)
    }

    async fn initialize(&self, req: &StateRequest) -> Result<(), StateError> {
        self.stop_for_root(req).await?;
        let path = image_path(req.params())?;
        if !fs::try_exists(&path).await? {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            info!(image = %path.display(), "Creating the backing image");
            self.disk.create_image(&path).await?;
        }
        Ok(())
    }

    async fn finalize(&self, req: &StateRequest) -> Result<(), StateError> {
        self.stop_for_root(req).await?;
        let path = image_path(req.params())?;
        info!(image = %path.display(), "Removing the backing image");
        self.disk.remove_image(&path).await?;
        if let Some(parent) = path.parent() {
            if let Err(err) = fs::remove_dir(parent).await {
                debug!(error = %err, "Image directory not yet empty");
            }
        }
        Ok(())
    }
}

/// Image states as external QCOW2 overlay files under the swarm pool.
pub struct QcowExtBackend {
    disk: Arc<dyn DiskTool>,
    vm: Arc<dyn VmControl>,
}

impl QcowExtBackend {
    pub fn new(disk: Arc<dyn DiskTool>, vm: Arc<dyn VmControl>) -> Self {
        QcowExtBackend { disk, vm }
    }

    /// Directory holding the overlay states of one image.
    fn state_tree(req: &StateRequest) -> Result<PathBuf, StateError> {
        let params = req.params();
        Ok(Path::new(params.require("swarm_pool")?)
            .join(req.object_id())
            .join(params.require("images")?))
    }

    /// Drop the head pointer image and the qemu scratch files around it.
    async fn clean_pointer(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        debug!("Cleaning the previous pointer and auxiliary data");
        let pointer = image_path(params)?;
        match fs::remove_file(&pointer).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let marker = format!("_{}_qcow2_", params.require("image_name")?);
        if let Ok(mut entries) = fs::read_dir(params.require("images_base_dir")?).await {
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_name().to_string_lossy().contains(&marker) {
                    fs::remove_file(entry.path()).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StateBackend for QcowExtBackend {
    async fn show(&self, req: &StateRequest) -> Result<Vec<String>, StateError> {
        let tree = Self::state_tree(req)?;
        debug!(tree = %tree.display(), "Showing external overlay states");
        if !fs::try_exists(&tree).await? {
            return Ok(Vec::new());
        }
        let mut states = Vec::new();
        let mut entries = fs::read_dir(&tree).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(state) = name.strip_suffix(".qcow2") {
                let size = entry.metadata().await?.len();
                debug!(state, size, "Detected overlay state");
                states.push(state.to_string());
            }
        }
        Ok(states)
    }

    async fn get(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        let state = params.require("get_state")?;
        let vm_name = req.vm_name()?;
        let flag = switch_flag(params, "get")?;
        info!(
            state = %state,
            vm = %vm_name,
            image = %params.require("images")?,
            "Reusing external image state"
        );
        switch_off(&self.vm, flag, &vm_name).await?;
        self.clean_pointer(req).await?;
        fs::create_dir_all(params.require("images_base_dir")?).await?;
        let backing = Self::state_tree(req)?.join(format!("{state}.qcow2"));
        self.disk
            .create_backed(&image_path(params)?, &backing)
            .await?;
        switch_on(&self.vm, flag, &vm_name).await
    }

    async fn set(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        let state = params.require("set_state")?;
        let vm_name = req.vm_name()?;
        let flag = switch_flag(params, "set")?;
        info!(
            state = %state,
            vm = %vm_name,
            image = %params.require("images")?,
            "Storing external image state"
        );
        switch_off(&self.vm, flag, &vm_name).await?;

        let pointer = image_path(params)?;
        if !fs::try_exists(&pointer).await? {
            return Err(StateError::MissingPointer {
                image: params.require("images")?.to_string(),
                state: state.to_string(),
            });
        }
        let state_file = Self::state_tree(req)?.join(format!("{state}.qcow2"));
        let backing = self.disk.backing_of(&pointer).await?;
        if fs::try_exists(&state_file).await? {
            if backing.as_deref() == Some(state_file.as_path()) {
                info!(state = %state, "Overwriting the backing state by committing the pointer");
                self.disk.commit(&pointer).await?;
            } else if self.disk.backing_of(&state_file).await? == backing {
                info!(state = %state, "Overwriting the sibling state by forward replacement");
                fs::remove_file(&state_file).await?;
                fs::copy(&pointer, &state_file).await?;
            } else {
                return Err(StateError::UnsafeOverwrite {
                    image: params.require("images")?.to_string(),
                    state: state.to_string(),
                });
            }
        } else {
            fs::copy(&pointer, &state_file).await?;
        }
        switch_on(&self.vm, flag, &vm_name).await
    }

    async fn unset(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        let state = params.require("unset_state")?;
        let vm_name = req.vm_name()?;
        let flag = switch_flag(params, "unset")?;
        info!(
            state = %state,
            vm = %vm_name,
            image = %params.require("images")?,
            "Removing external image state"
        );
        switch_off(&self.vm, flag, &vm_name).await?;
        self.clean_pointer(req).await?;
        if let Err(err) = fs::remove_dir(params.require("images_base_dir")?).await {
            debug!(error = %err, "Images base directory not yet empty");
        }
        fs::remove_file(Self::state_tree(req)?.join(format!("{state}.qcow2"))).await?;
        switch_on(&self.vm, flag, &vm_name).await
    }

    async fn check_root(&self, req: &StateRequest) -> Result<bool, StateError> {
        let tree = Self::state_tree(req)?;
        if !fs::try_exists(&tree).await? {
            info!(tree = %tree.display(), "The overlay directory for the image is missing");
            return Ok(false);
        }
        Ok(true)
    }

    async fn initialize(&self, req: &StateRequest) -> Result<(), StateError> {
        let tree = Self::state_tree(req)?;
        info!(tree = %tree.display(), "Creating the overlay directory for the image");
        fs::create_dir_all(&tree).await?;
        Ok(())
    }

    async fn finalize(&self, req: &StateRequest) -> Result<(), StateError> {
        let tree = Self::state_tree(req)?;
        info!(tree = %tree.display(), "Removing the overlay directory for the image");
        fs::remove_dir(&tree).await?;
        Ok(())
    }

    fn is_sourced(&self) -> bool {
        true
    }
}

/// Vm states as internal snapshots synchronized across all vm images.
pub struct QcowVtBackend {
    images: Arc<dyn StateBackend>,
    vm: Arc<dyn VmControl>,
}

impl QcowVtBackend {
    pub fn new(images: Arc<dyn StateBackend>, vm: Arc<dyn VmControl>) -> Self {
        QcowVtBackend { images, vm }
    }
}

#[async_trait]
impl StateBackend for QcowVtBackend {
    async fn show(&self, req: &StateRequest) -> Result<Vec<String>, StateError> {
        debug!(vm = %req.vm_name()?, "Showing vm snapshot states");
        let shared = composed_image_states(&self.images, req, true).await?;
        Ok(shared.into_iter().collect())
    }

    async fn get(&self, req: &StateRequest) -> Result<(), StateError> {
        let vm_name = req.vm_name()?;
        let state = req.params().require("get_state")?;
        info!(state = %state, vm = %vm_name, "Reusing vm state");
        if !self.vm.is_alive(&vm_name).await? {
            self.vm.start(&vm_name).await?;
        }
        self.vm.pause(&vm_name).await?;
        self.vm.revert(&vm_name, state).await?;
        self.vm.resume(&vm_name).await?;
        Ok(())
    }

    async fn set(&self, req: &StateRequest) -> Result<(), StateError> {
        let vm_name = req.vm_name()?;
        let state = req.params().require("set_state")?;
        info!(state = %state, vm = %vm_name, "Storing vm state");
        if !self.vm.is_alive(&vm_name).await? {
            return Err(StateError::DeadVm(vm_name));
        }
        self.vm.pause(&vm_name).await?;
        self.vm.checkpoint(&vm_name, state).await?;
        self.vm.resume(&vm_name).await?;
        Ok(())
    }

    async fn unset(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        info!(
            state = %params.require("unset_state")?,
            vm = %req.vm_name()?,
            "Removing vm state"
        );
        for image in params.objects("images") {
            let mut image_params = params.object_params(&image);
            image_params.insert("images", image.as_str());
            image_params.insert("unset_switch", "none");
            self.images
                .unset(&req.nested(ObjectKind::Image, &image, image_params))
                .await?;
        }
        Ok(())
    }

    async fn check_root(&self, req: &StateRequest) -> Result<bool, StateError> {
        let params = req.params();
        debug!(vm = %req.vm_name()?, "Checking whether the vm preconditions are satisfied");
        for image in params.objects("images") {
            let mut image_params = params.object_params(&image);
            image_params.insert("images", image.as_str());
            let image_req = req.nested(ObjectKind::Image, &image, image_params);
            if !self.images.check_root(&image_req).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn initialize(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        info!(vm = %req.vm_name()?, "Initializing the vm preconditions");
        for image in params.objects("images") {
            let mut image_params = params.object_params(&image);
            image_params.insert("images", image.as_str());
            self.images
                .initialize(&req.nested(ObjectKind::Image, &image, image_params))
                .await?;
        }
        Ok(())
    }

    async fn finalize(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        info!(vm = %req.vm_name()?, "Finalizing the vm preconditions");
        for image in params.objects("images") {
            let mut image_params = params.object_params(&image);
            image_params.insert("images", image.as_str());
            self.images
                .finalize(&req.nested(ObjectKind::Image, &image, image_params))
                .await?;
        }
        Ok(())
    }
}
