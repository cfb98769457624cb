//! Vm states as run state dumps paired with per-image overlay states.
//!
//! A complete vm state is a `.state` file under the vm's swarm pool
//! directory plus one overlay state of the same name for every image of
//! the vm. Listing only reports names for which both halves exist.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};

use crate::backend::{composed_image_states, ObjectKind, StateBackend, StateRequest};
use crate::driver::VmControl;
use crate::error::StateError;

/// Vm states as ram dump files next to external image overlays.
pub struct RamfileBackend {
    images: Arc<dyn StateBackend>,
    vm: Arc<dyn VmControl>,
}

impl RamfileBackend {
    pub fn new(images: Arc<dyn StateBackend>, vm: Arc<dyn VmControl>) -> Self {
        RamfileBackend { images, vm }
    }

    /// Directory holding the run state dumps of one vm.
    fn vm_tree(req: &StateRequest) -> Result<PathBuf, StateError> {
        Ok(Path::new(req.params().require("swarm_pool")?).join(req.object_id()))
    }
}

#[async_trait]
impl StateBackend for RamfileBackend {
    async fn show(&self, req: &StateRequest) -> Result<Vec<String>, StateError> {
        let tree = Self::vm_tree(req)?;
        debug!(tree = %tree.display(), "Showing run state dumps");
        if !fs::try_exists(&tree).await? {
            return Ok(Vec::new());
        }
        let image_states = composed_image_states(&self.images, req, false).await?;
        let mut states = Vec::new();
        let mut entries = fs::read_dir(&tree).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(state) = name.strip_suffix(".state") else {
                continue;
            };
            let size = entry.metadata().await?.len();
            debug!(state, size, "Detected run state dump");
            if image_states.contains(state) {
                debug!(state, "The dump is half of a complete vm state");
                states.push(state.to_string());
            }
        }
        states.sort();
        Ok(states)
    }

    async fn get(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        let vm_name = req.vm_name()?;
        let state = params.require("get_state")?;
        info!(state = %state, vm = %vm_name, "Reusing vm state");
        if self.vm.is_alive(&vm_name).await? {
            self.vm.stop(&vm_name, false).await?;
        }
        for image in params.objects("images") {
            let mut image_params = params.object_params(&image);
            image_params.insert("images", image.as_str());
            image_params.insert("get_switch", "none");
            self.images
                .get(&req.nested(ObjectKind::Image, &image, image_params))
                .await?;
        }
        let file = Self::vm_tree(req)?.join(format!("{state}.state"));
        self.vm.load_ram(&vm_name, &file).await?;
        self.vm.resume(&vm_name).await?;
        Ok(())
    }

    async fn set(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        let vm_name = req.vm_name()?;
        let state = params.require("set_state")?;
        info!(state = %state, vm = %vm_name, "Storing vm state");
        if !self.vm.is_alive(&vm_name).await? {
            return Err(StateError::DeadVm(vm_name));
        }
        self.vm.pause(&vm_name).await?;
        let file = Self::vm_tree(req)?.join(format!("{state}.state"));
        if fs::try_exists(&file).await? {
            fs::remove_file(&file).await?;
        }
        self.vm.save_ram(&vm_name, &file).await?;
        self.vm.stop(&vm_name, false).await?;
        for image in params.objects("images") {
            let mut image_params = params.object_params(&image);
            image_params.insert("images", image.as_str());
            image_params.insert("set_switch", "none");
            self.images
                .set(&req.nested(ObjectKind::Image, &image, image_params))
                .await?;
        }
        Ok(())
    }

    async fn unset(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        let state = params.require("unset_state")?;
        info!(state = %state, vm = %req.vm_name()?, "Removing vm state");
        for image in params.objects("images") {
            let mut image_params = params.object_params(&image);
            image_params.insert("images", image.as_str());
            image_params.insert("unset_switch", "none");
            self.images
                .unset(&req.nested(ObjectKind::Image, &image, image_params))
                .await?;
        }
        fs::remove_file(Self::vm_tree(req)?.join(format!("{state}.state"))).await?;
        Ok(())
    }

    async fn check_root(&self, req: &StateRequest) -> Result<bool, StateError> {
        let tree = Self::vm_tree(req)?;
        if !fs::try_exists(&tree).await? {
            info!(
                vm = %req.vm_name()?,
                "The run state directory for the vm is missing"
            );
            return Ok(false);
        }
        let params = req.params();
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
        for image in params.objects("images") {
            let mut image_params = params.object_params(&image);
            image_params.insert("images", image.as_str());
            self.images
                .initialize(&req.nested(ObjectKind::Image, &image, image_params))
                .await?;
        }
        let tree = Self::vm_tree(req)?;
        info!(tree = %tree.display(), "Creating the run state directory for the vm");
        fs::create_dir_all(&tree).await?;
        Ok(())
    }

    async fn finalize(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        for image in params.objects("images") {
            let mut image_params = params.object_params(&image);
            image_params.insert("images", image.as_str());
            self.images
                .finalize(&req.nested(ObjectKind::Image, &image, image_params))
                .await?;
        }
        let tree = Self::vm_tree(req)?;
        info!(tree = %tree.display(), "Removing the run state directory for the vm");
        fs::remove_dir(&tree).await?;
        Ok(())
    }

    fn is_sourced(&self) -> bool {
        true
    }
}
