//! Durable on-disk queue of async metadata updates.
//!
//! Layout on each device:
//!
//! ```text
//! <device>/async_pending/<suffix>/<id>   queued, awaiting delivery
//! <device>/async_failed/<id>             gave up after max attempts; kept for operators
//! <device>/tmp/<uuid>                    staging for atomic writes
//! ```
//!
//! Every write goes to `tmp`, is fsynced, then renamed into place, so a
//! record is either fully present or absent after a crash.

use super::AsyncUpdate;
use crate::error::{Result, TesseraError};
use crate::storage::{DiskStore, ObjectStore};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

const PENDING_DIR: &str = "async_pending";
const FAILED_DIR: &str = "async_failed";
const TMP_DIR: &str = "tmp";

/// Queue of [`AsyncUpdate`] records spread over local devices.
#[derive(Debug, Clone)]
pub struct AsyncQueue {
    devices: DiskStore,
}

impl AsyncQueue {
    pub fn new(devices_root: impl Into<PathBuf>, mount_check: bool) -> Self {
        Self {
            devices: DiskStore::new(devices_root, mount_check),
        }
    }

    pub fn is_mounted(&self, device: &str) -> bool {
        self.devices.is_mounted(device)
    }

    fn record_path(&self, device: &str, update: &AsyncUpdate) -> Result<PathBuf> {
        let id = update.id.simple().to_string();
        let suffix = &id[id.len() - 3..];
        Ok(self
            .devices
            .device_dir(device)?
            .join(PENDING_DIR)
            .join(suffix)
            .join(&id))
    }

    fn write(&self, device: &str, dest: &Path, update: &AsyncUpdate) -> Result<()> {
        let tmp_dir = self.devices.device_dir(device)?.join(TMP_DIR);
        let bytes = serde_json::to_vec(update)?;
        crate::storage::disk::write_atomic(&tmp_dir, dest, &bytes)
    }

    /// Persist a new record. Returns once it is durable.
    pub fn enqueue(&self, device: &str, update: &AsyncUpdate) -> Result<PathBuf> {
        let path = self.record_path(device, update)?;
        self.write(device, &path, update)?;
        debug!(device, id = %update.id, target = %update.target, "Queued async update");
        Ok(path)
    }

    /// Paths of every queued record on a device.
    pub fn pending(&self, device: &str) -> Result<Vec<PathBuf>> {
        let base = self.devices.device_dir(device)?.join(PENDING_DIR);
        let mut paths = Vec::new();
        for suffix in crate::storage::disk::read_dir_names(&base)? {
            let dir = base.join(&suffix);
            if !dir.is_dir() {
                continue;
            }
            for name in crate::storage::disk::read_dir_names(&dir)? {
                paths.push(dir.join(name));
            }
        }
        Ok(paths)
    }

    pub fn load(&self, path: &Path) -> Result<AsyncUpdate> {
        let bytes = fs::read(path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                TesseraError::NotFound(path.display().to_string())
            } else {
                e.into()
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Atomically replace a queued record (after a failed attempt).
    pub fn update(&self, device: &str, path: &Path, update: &AsyncUpdate) -> Result<()> {
        self.write(device, path, update)
    }

    /// Remove a delivered record.
    pub fn complete(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(dir) = path.parent() {
            // only succeeds once the suffix directory is empty
            let _ = fs::remove_dir(dir);
        }
        Ok(())
    }

    /// Move a record that exhausted its attempts to the failed directory.
    ///
    /// The failed copy is written before the queued one is removed.
    pub fn dead_letter(&self, device: &str, path: &Path, update: &AsyncUpdate) -> Result<PathBuf> {
        let dest = self
            .devices
            .device_dir(device)?
            .join(FAILED_DIR)
            .join(update.id.simple().to_string());
        self.write(device, &dest, update)?;
        self.complete(path)?;
        error!(
            device,
            id = %update.id,
            target = %update.target,
            attempts = update.attempt_count,
            failed_path = %dest.display(),
            "Async update exceeded max attempts; moved to failed queue"
        );
        Ok(dest)
    }

    /// Move an undecodable record aside untouched.
    pub fn set_aside(&self, device: &str, path: &Path) -> Result<PathBuf> {
        let dir = self.devices.device_dir(device)?.join(FAILED_DIR);
        fs::create_dir_all(&dir)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let dest = dir.join(format!("{}.corrupt", name));
        fs::rename(path, &dest)?;
        error!(device, path = %path.display(), dest = %dest.display(), "Set aside undecodable async update");
        Ok(dest)
    }

    /// Records that were given up on.
    pub fn dead_letters(&self, device: &str) -> Result<Vec<AsyncUpdate>> {
        let dir = self.devices.device_dir(device)?.join(FAILED_DIR);
        let mut records = Vec::new();
        for name in crate::storage::disk::read_dir_names(&dir)? {
            if name.ends_with(".corrupt") {
                continue;
            }
            records.push(self.load(&dir.join(name))?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updater::{UpdateOperation, UpdateTarget};
    use tempfile::TempDir;

    fn setup() -> (TempDir, AsyncQueue) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sda")).unwrap();
        let queue = AsyncQueue::new(dir.path(), false);
        (dir, queue)
    }

    fn update() -> AsyncUpdate {
        AsyncUpdate::new(
            UpdateTarget::Container {
                account: "AUTH_test".into(),
                container: "photos".into(),
            },
            12,
            Vec::new(),
            UpdateOperation::Put,
        )
        .with_payload("x-object-count", "3")
    }

    #[test]
    fn test_enqueue_load_complete() {
        let (_dir, queue) = setup();
        let update = update();
        let path = queue.enqueue("sda", &update).unwrap();

        assert_eq!(queue.pending("sda").unwrap(), vec![path.clone()]);
        assert_eq!(queue.load(&path).unwrap(), update);

        queue.complete(&path).unwrap();
        assert!(queue.pending("sda").unwrap().is_empty());
    }

    #[test]
    fn test_update_rewrites_in_place() {
        let (_dir, queue) = setup();
        let mut update = update();
        let path = queue.enqueue("sda", &update).unwrap();
        update.attempt_count = 4;
        queue.update("sda", &path, &update).unwrap();
        assert_eq!(queue.load(&path).unwrap().attempt_count, 4);
        assert_eq!(queue.pending("sda").unwrap().len(), 1);
    }

    #[test]
    fn test_dead_letter() {
        let (_dir, queue) = setup();
        let update = update();
        let path = queue.enqueue("sda", &update).unwrap();
        queue.dead_letter("sda", &path, &update).unwrap();
        assert!(queue.pending("sda").unwrap().is_empty());
        assert_eq!(queue.dead_letters("sda").unwrap(), vec![update]);
    }

    #[test]
    fn test_unmounted_device() {
        let (_dir, queue) = setup();
        assert!(matches!(
            queue.enqueue("sdz", &update()),
            Err(TesseraError::NotMounted(_))
        ));
    }
}
