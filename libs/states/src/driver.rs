//! Imperative boundary toward disk image tooling and vm controllers.
//!
//! State backends never shell out themselves. Every imperative step goes
//! through a [`DiskTool`] or [`VmControl`] implementation, which keeps the
//! backends testable and lets deployments swap the underlying machinery
//! (qemu-img and a monitor socket, a libvirt connection, or the in-memory
//! mocks below) without touching state semantics.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by an imperative driver call.
#[derive(Debug, Error)]
pub enum DriverError {
    /// An external tool completed with a failing status.
    #[error("{program} exited with {status}: {stderr}")]
    Tool {
        program: &'static str,
        status: i32,
        stderr: String,
    },

    /// The requested object is not known to the controller.
    #[error("no such object {0}")]
    Unknown(String),

    /// Input or output toward the tool failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One row of an image snapshot table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    /// Snapshot tag.
    pub tag: String,
    /// Size of the stored run state; zero for disk-only snapshots.
    pub vm_size: u64,
}

/// Disk image tooling as needed for snapshot bookkeeping.
#[async_trait]
pub trait DiskTool: Send + Sync {
    /// List the snapshot table of an image.
    async fn snapshot_list(&self, image: &Path) -> Result<Vec<Snapshot>, DriverError>;

    /// Apply an internal snapshot onto the image head.
    async fn snapshot_apply(&self, image: &Path, tag: &str) -> Result<(), DriverError>;

    /// Record the image head as an internal snapshot.
    async fn snapshot_create(&self, image: &Path, tag: &str) -> Result<(), DriverError>;

    /// Drop an internal snapshot row.
    async fn snapshot_delete(&self, image: &Path, tag: &str) -> Result<(), DriverError>;

    /// Create an empty image.
    async fn create_image(&self, image: &Path) -> Result<(), DriverError>;

    /// Create an image backed by another file.
    async fn create_backed(&self, image: &Path, backing: &Path) -> Result<(), DriverError>;

    /// Remove an image file. Removing an absent image is not an error.
    async fn remove_image(&self, image: &Path) -> Result<(), DriverError>;

    /// Squash an image into its backing file.
    async fn commit(&self, image: &Path) -> Result<(), DriverError>;

    /// Resolve the backing file of an image, if any.
    async fn backing_of(&self, image: &Path) -> Result<Option<PathBuf>, DriverError>;
}

/// Vm lifecycle and run state control.
#[async_trait]
pub trait VmControl: Send + Sync {
    async fn is_alive(&self, vm: &str) -> Result<bool, DriverError>;

    async fn start(&self, vm: &str) -> Result<(), DriverError>;

    /// Power a vm off, gracefully through the guest or by force.
    async fn stop(&self, vm: &str, graceful: bool) -> Result<(), DriverError>;

    async fn pause(&self, vm: &str) -> Result<(), DriverError>;

    async fn resume(&self, vm: &str) -> Result<(), DriverError>;

    /// Record a live checkpoint of disks and run state under a tag.
    async fn checkpoint(&self, vm: &str, tag: &str) -> Result<(), DriverError>;

    /// Revert a live vm to a checkpoint tag.
    async fn revert(&self, vm: &str, tag: &str) -> Result<(), DriverError>;

    /// Dump the run state of a live vm into a file.
    async fn save_ram(&self, vm: &str, file: &Path) -> Result<(), DriverError>;

    /// Load the run state of a vm from a file, leaving it paused.
    async fn load_ram(&self, vm: &str, file: &Path) -> Result<(), DriverError>;
}

/// In-memory disk tool holding snapshot tables and backing links, with
/// real files standing in for images so existence checks stay honest.
///
/// Mutating calls are journaled; queries are not.
#[derive(Debug, Default)]
pub struct MockDisk {
    tables: Mutex<BTreeMap<PathBuf, Vec<Snapshot>>>,
    backings: Mutex<BTreeMap<PathBuf, PathBuf>>,
    calls: Mutex<Vec<String>>,
}

impl MockDisk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a snapshot row as if a previous run had created it.
    pub fn insert_snapshot(&self, image: impl Into<PathBuf>, tag: &str, vm_size: u64) {
        let mut tables = self.tables.lock().unwrap();
        tables.entry(image.into()).or_default().push(Snapshot {
            tag: tag.to_string(),
            vm_size,
        });
    }

    pub fn snapshots(&self, image: &Path) -> Vec<Snapshot> {
        let tables = self.tables.lock().unwrap();
        tables.get(image).cloned().unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, line: String) {
        self.calls.lock().unwrap().push(line);
    }

    fn missing_tag(tag: &str) -> DriverError {
        DriverError::Tool {
            program: "qemu-img",
            status: 1,
            stderr: format!("snapshot {tag} not found"),
        }
    }
}

#[async_trait]
impl DiskTool for MockDisk {
    async fn snapshot_list(&self, image: &Path) -> Result<Vec<Snapshot>, DriverError> {
        Ok(self.snapshots(image))
    }

    async fn snapshot_apply(&self, image: &Path, tag: &str) -> Result<(), DriverError> {
        self.record(format!("snapshot-apply {} {tag}", image.display()));
        let tables = self.tables.lock().unwrap();
        let known = tables
            .get(image)
            .is_some_and(|rows| rows.iter().any(|row| row.tag == tag));
        if !known {
            return Err(Self::missing_tag(tag));
        }
        Ok(())
    }

    async fn snapshot_create(&self, image: &Path, tag: &str) -> Result<(), DriverError> {
        self.record(format!("snapshot-create {} {tag}", image.display()));
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(image.to_path_buf()).or_default();
        rows.retain(|row| row.tag != tag);
        rows.push(Snapshot {
            tag: tag.to_string(),
            vm_size: 0,
        });
        Ok(())
    }

    async fn snapshot_delete(&self, image: &Path, tag: &str) -> Result<(), DriverError> {
        self.record(format!("snapshot-delete {} {tag}", image.display()));
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(image.to_path_buf()).or_default();
        let before = rows.len();
        rows.retain(|row| row.tag != tag);
        if rows.len() == before {
            return Err(Self::missing_tag(tag));
        }
        Ok(())
    }

    async fn create_image(&self, image: &Path) -> Result<(), DriverError> {
        self.record(format!("create {}", image.display()));
        if let Some(parent) = image.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(image, b"disk")?;
        Ok(())
    }

    async fn create_backed(&self, image: &Path, backing: &Path) -> Result<(), DriverError> {
        self.record(format!(
            "create-backed {} {}",
            image.display(),
            backing.display()
        ));
        if let Some(parent) = image.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(image, format!("backed by {}", backing.display()))?;
        let mut backings = self.backings.lock().unwrap();
        backings.insert(image.to_path_buf(), backing.to_path_buf());
        Ok(())
    }

    async fn remove_image(&self, image: &Path) -> Result<(), DriverError> {
        self.record(format!("remove {}", image.display()));
        match std::fs::remove_file(image) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let mut backings = self.backings.lock().unwrap();
        backings.remove(image);
        Ok(())
    }

    async fn commit(&self, image: &Path) -> Result<(), DriverError> {
        self.record(format!("commit {}", image.display()));
        let backings = self.backings.lock().unwrap();
        if !backings.contains_key(image) {
            return Err(DriverError::Tool {
                program: "qemu-img",
                status: 1,
                stderr: format!("{} has no backing file", image.display()),
            });
        }
        Ok(())
    }

    async fn backing_of(&self, image: &Path) -> Result<Option<PathBuf>, DriverError> {
        let backings = self.backings.lock().unwrap();
        Ok(backings.get(image).cloned())
    }
}

/// Scripted vm controller tracking liveness in memory.
///
/// Mutating calls are journaled; queries are not. Run state dumps land in
/// real files so directory listings stay honest.
#[derive(Debug, Default)]
pub struct MockVm {
    alive: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl MockVm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a vm as already running.
    pub fn boot(&self, vm: &str) {
        self.alive.lock().unwrap().insert(vm.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, line: String) {
        self.calls.lock().unwrap().push(line);
    }
}

#[async_trait]
impl VmControl for MockVm {
    async fn is_alive(&self, vm: &str) -> Result<bool, DriverError> {
        Ok(self.alive.lock().unwrap().contains(vm))
    }

    async fn start(&self, vm: &str) -> Result<(), DriverError> {
        self.record(format!("start {vm}"));
        self.alive.lock().unwrap().insert(vm.to_string());
        Ok(())
    }

    async fn stop(&self, vm: &str, graceful: bool) -> Result<(), DriverError> {
        let how = if graceful { "graceful" } else { "forced" };
        self.record(format!("stop {vm} {how}"));
        self.alive.lock().unwrap().remove(vm);
        Ok(())
    }

    async fn pause(&self, vm: &str) -> Result<(), DriverError> {
        self.record(format!("pause {vm}"));
        Ok(())
    }

    async fn resume(&self, vm: &str) -> Result<(), DriverError> {
        self.record(format!("resume {vm}"));
        Ok(())
    }

    async fn checkpoint(&self, vm: &str, tag: &str) -> Result<(), DriverError> {
        self.record(format!("checkpoint {vm} {tag}"));
        Ok(())
    }

    async fn revert(&self, vm: &str, tag: &str) -> Result<(), DriverError> {
        self.record(format!("revert {vm} {tag}"));
        Ok(())
    }

    async fn save_ram(&self, vm: &str, file: &Path) -> Result<(), DriverError> {
        self.record(format!("save-ram {vm} {}", file.display()));
        std::fs::write(file, b"ram")?;
        Ok(())
    }

    async fn load_ram(&self, vm: &str, file: &Path) -> Result<(), DriverError> {
        self.record(format!("load-ram {vm} {}", file.display()));
        std::fs::metadata(file)?;
        self.alive.lock().unwrap().insert(vm.to_string());
        Ok(())
    }
}
