//! Mirroring of image states between a worker and a shared state pool.
//!
//! Concepts:
//!
//! - **Transfer scope**: the `pool_scope` parameter lists how far state
//!   traffic may reach, from narrow to wide: `own` (this worker only),
//!   `swarm` (the swarm pool the external backend already writes to),
//!   `cluster` and `shared` (a pool root reachable by every worker).
//! - **Digest comparison**: before reusing a locally cached state the
//!   mirror compares content digests with the pool copy and refetches on
//!   any difference.
//!
//! # Invariants
//! - A scope without `cluster` or `shared` never touches the pool root.
//! - Local manipulation is delegated wholesale to the wrapped backend;
//!   the mirror only moves files before or after it.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info};
use vtgrid_params::Params;

use crate::backend::{StateBackend, StateRequest};
use crate::driver::DriverError;
use crate::error::StateError;

const FULL_POOL_SCOPE: [&str; 4] = ["own", "swarm", "cluster", "shared"];

/// Transport moving state files between pool roots.
#[async_trait]
pub trait PoolTransfer: Send + Sync {
    /// List file names under a pool directory; absent directories list
    /// as empty.
    async fn list(&self, dir: &Path) -> Result<Vec<String>, DriverError>;

    /// Content digest of a file, or None when it is absent.
    async fn digest(&self, file: &Path) -> Result<Option<String>, DriverError>;

    /// Copy a pool file to a local path.
    async fn fetch(&self, remote: &Path, local: &Path) -> Result<(), DriverError>;

    /// Copy a local file to a pool path.
    async fn store(&self, local: &Path, remote: &Path) -> Result<(), DriverError>;

    /// Remove a pool file if present.
    async fn remove(&self, remote: &Path) -> Result<(), DriverError>;
}

/// Pool transfer over a locally reachable filesystem, such as a shared
/// mount.
#[derive(Debug, Default)]
pub struct FsPoolTransfer;

impl FsPoolTransfer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PoolTransfer for FsPoolTransfer {
    async fn list(&self, dir: &Path) -> Result<Vec<String>, DriverError> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn digest(&self, file: &Path) -> Result<Option<String>, DriverError> {
        match fs::read(file).await {
            Ok(bytes) => Ok(Some(hex::encode(Sha256::digest(&bytes)))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn fetch(&self, remote: &Path, local: &Path) -> Result<(), DriverError> {
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(remote, local).await?;
        Ok(())
    }

    async fn store(&self, local: &Path, remote: &Path) -> Result<(), DriverError> {
        if let Some(parent) = remote.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(local, remote).await?;
        Ok(())
    }

    async fn remove(&self, remote: &Path) -> Result<(), DriverError> {
        match fs::remove_file(remote).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory pool holding the remote files as byte blobs.
///
/// Mutating calls are journaled; queries are not. The local half of a
/// fetch or store stays on the real filesystem, matching how the wrapped
/// backends see their files.
#[derive(Debug, Default)]
pub struct MockTransfer {
    entries: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
    calls: Mutex<Vec<String>>,
}

impl MockTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a pool file as if another worker had stored it.
    pub fn insert(&self, remote: impl Into<PathBuf>, content: &[u8]) {
        self.entries
            .lock()
            .unwrap()
            .insert(remote.into(), content.to_vec());
    }

    pub fn contains(&self, remote: &Path) -> bool {
        self.entries.lock().unwrap().contains_key(remote)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, line: String) {
        self.calls.lock().unwrap().push(line);
    }
}

#[async_trait]
impl PoolTransfer for MockTransfer {
    async fn list(&self, dir: &Path) -> Result<Vec<String>, DriverError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .keys()
            .filter(|path| path.parent() == Some(dir))
            .filter_map(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect())
    }

    async fn digest(&self, file: &Path) -> Result<Option<String>, DriverError> {
        if let Some(bytes) = self.entries.lock().unwrap().get(file) {
            return Ok(Some(hex::encode(Sha256::digest(bytes))));
        }
        match fs::read(file).await {
            Ok(bytes) => Ok(Some(hex::encode(Sha256::digest(&bytes)))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn fetch(&self, remote: &Path, local: &Path) -> Result<(), DriverError> {
        self.record(format!("fetch {} {}", remote.display(), local.display()));
        let bytes = {
            let entries = self.entries.lock().unwrap();
            entries
                .get(remote)
                .cloned()
                .ok_or_else(|| DriverError::Unknown(remote.display().to_string()))?
        };
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(local, bytes).await?;
        Ok(())
    }

    async fn store(&self, local: &Path, remote: &Path) -> Result<(), DriverError> {
        self.record(format!("store {} {}", local.display(), remote.display()));
        let bytes = fs::read(local).await?;
        self.entries
            .lock()
            .unwrap()
            .insert(remote.to_path_buf(), bytes);
        Ok(())
    }

    async fn remove(&self, remote: &Path) -> Result<(), DriverError> {
        self.record(format!("remove {}", remote.display()));
        self.entries.lock().unwrap().remove(remote);
        Ok(())
    }
}

/// Image states mirrored between the swarm pool and a shared pool root.
///
/// Wraps the external overlay backend for all local manipulation and
/// moves state files through a [`PoolTransfer`] according to the
/// configured scope.
pub struct PoolBackend {
    local: Arc<dyn StateBackend>,
    transfer: Arc<dyn PoolTransfer>,
}

impl PoolBackend {
    pub fn new(local: Arc<dyn StateBackend>, transfer: Arc<dyn PoolTransfer>) -> Self {
        PoolBackend { local, transfer }
    }

    fn scope(params: &Params) -> Vec<String> {
        let scope = params.objects("pool_scope");
        if scope.is_empty() {
            FULL_POOL_SCOPE.iter().map(|word| word.to_string()).collect()
        } else {
            scope
        }
    }

    fn reaches_shared(params: &Params) -> bool {
        Self::scope(params)
            .iter()
            .any(|word| word == "cluster" || word == "shared")
    }

    /// Directory of the image's states under the shared pool root.
    fn shared_tree(req: &StateRequest) -> Result<PathBuf, StateError> {
        let params = req.params();
        Ok(Path::new(params.require("shared_pool")?)
            .join(req.object_id())
            .join(params.require("images")?))
    }

    fn shared_file(req: &StateRequest, state: &str) -> Result<PathBuf, StateError> {
        Ok(Self::shared_tree(req)?.join(format!("{state}.qcow2")))
    }

    /// Path of the same state file under the swarm pool.
    fn local_file(req: &StateRequest, state: &str) -> Result<PathBuf, StateError> {
        let params = req.params();
        Ok(Path::new(params.require("swarm_pool")?)
            .join(req.object_id())
            .join(params.require("images")?)
            .join(format!("{state}.qcow2")))
    }
}

#[async_trait]
impl StateBackend for PoolBackend {
    async fn show(&self, req: &StateRequest) -> Result<Vec<String>, StateError> {
        let mut states: Vec<String> = self.local.show(req).await?;
        if Self::reaches_shared(req.params()) {
            let dir = Self::shared_tree(req)?;
            for name in self.transfer.list(&dir).await? {
                if let Some(state) = name.strip_suffix(".qcow2") {
                    if !states.iter().any(|known| known == state) {
                        debug!(state, "Detected pool-only state");
                        states.push(state.to_string());
                    }
                }
            }
        }
        states.sort();
        Ok(states)
    }

    async fn get(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        let state = params.require("get_state")?;
        if Self::reaches_shared(params) {
            let local = Self::local_file(req, state)?;
            let remote = Self::shared_file(req, state)?;
            if let Some(remote_digest) = self.transfer.digest(&remote).await? {
                let local_digest = self.transfer.digest(&local).await?;
                if local_digest.as_deref() != Some(remote_digest.as_str()) {
                    info!(state = %state, "Fetching the state from the shared pool");
                    self.transfer.fetch(&remote, &local).await?;
                }
            }
        }
        self.local.get(req).await
    }

    async fn set(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        let state = params.require("set_state")?.to_string();
        self.local.set(req).await?;
        if Self::reaches_shared(params) {
            info!(state = %state, "Publishing the state to the shared pool");
            let local = Self::local_file(req, &state)?;
            let remote = Self::shared_file(req, &state)?;
            self.transfer.store(&local, &remote).await?;
        }
        Ok(())
    }

    async fn unset(&self, req: &StateRequest) -> Result<(), StateError> {
        let params = req.params();
        let state = params.require("unset_state")?.to_string();
        self.local.unset(req).await?;
        if Self::reaches_shared(params) {
            debug!(state = %state, "Dropping the state from the shared pool");
            self.transfer
                .remove(&Self::shared_file(req, &state)?)
                .await?;
        }
        Ok(())
    }

    async fn check_root(&self, req: &StateRequest) -> Result<bool, StateError> {
        self.local.check_root(req).await
    }

    async fn initialize(&self, req: &StateRequest) -> Result<(), StateError> {
        self.local.initialize(req).await
    }

    async fn finalize(&self, req: &StateRequest) -> Result<(), StateError> {
        self.local.finalize(req).await
    }

    fn is_sourced(&self) -> bool {
        true
    }
}
