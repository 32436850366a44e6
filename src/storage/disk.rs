//! Filesystem-backed object store.

use super::{ObjectStore, QuarantineReason, QuarantineRecord};
use crate::error::{Result, TesseraError};
use crate::types::{
    policy_dir, ObjectFile, ObjectHash, ObjectMeta, ObjectPath, PartitionId, PolicyId, Suffix,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const DATA_EXT: &str = "data";
const TMP_DIR: &str = "tmp";
const QUARANTINE_DIR: &str = "quarantined";

/// On-disk record: metadata and bytes in one file so a rename commits both.
#[derive(Debug, Serialize, Deserialize)]
struct DiskRecord {
    meta: ObjectMeta,
    data: Vec<u8>,
}

/// Object store over a directory of device mounts.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
    mount_check: bool,
}

impl DiskStore {
    /// Create a store rooted at `root` (one sub-directory per device).
    pub fn new(root: impl Into<PathBuf>, mount_check: bool) -> Self {
        Self {
            root: root.into(),
            mount_check,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a mounted device.
    pub fn device_dir(&self, device: &str) -> Result<PathBuf> {
        if !self.is_mounted(device) {
            return Err(TesseraError::NotMounted(device.to_string()));
        }
        Ok(self.root.join(device))
    }

    fn partition_dir(&self, device: &str, policy: PolicyId, partition: PartitionId) -> Result<PathBuf> {
        Ok(self
            .device_dir(device)?
            .join(policy_dir(policy))
            .join(partition.to_string()))
    }

    fn object_file(&self, path: &ObjectPath) -> Result<PathBuf> {
        Ok(self
            .partition_dir(&path.device, path.policy, path.partition)?
            .join(path.suffix().as_str())
            .join(format!("{}.{}", path.hash, DATA_EXT)))
    }

    fn load_record(&self, path: &ObjectPath) -> Result<DiskRecord> {
        let file = self.object_file(path)?;
        let bytes = fs::read(&file).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                TesseraError::NotFound(path.to_string())
            } else {
                e.into()
            }
        })?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

/// Write `bytes` to a fresh file under `tmp_dir`, fsync, then rename to `dest`.
pub(crate) fn write_atomic(tmp_dir: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    fs::create_dir_all(tmp_dir)?;
    let tmp = tmp_dir.join(uuid::Uuid::new_v4().to_string());
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Err(e) = fs::rename(&tmp, dest) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Entries of a directory, or nothing if it does not exist.
pub(crate) fn read_dir_names(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

fn is_mount_point(path: &Path) -> bool {
    let (Ok(meta), Some(parent)) = (fs::metadata(path), path.parent()) else {
        return false;
    };
    match fs::metadata(parent) {
        Ok(parent_meta) => meta.dev() != parent_meta.dev() || meta.ino() == parent_meta.ino(),
        Err(_) => false,
    }
}

impl ObjectStore for DiskStore {
    fn is_mounted(&self, device: &str) -> bool {
        let path = self.root.join(device);
        if self.mount_check {
            is_mount_point(&path)
        } else {
            path.is_dir()
        }
    }

    fn list_partitions(&self, device: &str, policy: PolicyId) -> Result<Vec<PartitionId>> {
        let dir = self.device_dir(device)?.join(policy_dir(policy));
        let mut parts: Vec<PartitionId> = read_dir_names(&dir)?
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        parts.sort_unstable();
        Ok(parts)
    }

    fn list_suffixes(
        &self,
        device: &str,
        policy: PolicyId,
        partition: PartitionId,
    ) -> Result<Vec<Suffix>> {
        let dir = self.partition_dir(device, policy, partition)?;
        Ok(read_dir_names(&dir)?
            .iter()
            .filter_map(|name| Suffix::parse(name).ok())
            .collect())
    }

    fn list_hashes(
        &self,
        device: &str,
        policy: PolicyId,
        partition: PartitionId,
        suffix: &Suffix,
    ) -> Result<Vec<ObjectHash>> {
        let dir = self
            .partition_dir(device, policy, partition)?
            .join(suffix.as_str());
        Ok(read_dir_names(&dir)?
            .iter()
            .filter_map(|name| name.strip_suffix(".data"))
            .filter_map(|stem| ObjectHash::parse(stem).ok())
            .collect())
    }

    fn read(&self, path: &ObjectPath) -> Result<ObjectFile> {
        let record = self.load_record(path)?;
        Ok(ObjectFile {
            path: path.clone(),
            meta: record.meta,
            data: record.data,
        })
    }

    fn atomic_write(&self, path: &ObjectPath, meta: &ObjectMeta, data: &[u8]) -> Result<()> {
        let dest = self.object_file(path)?;
        let tmp_dir = self.device_dir(&path.device)?.join(TMP_DIR);
        let bytes = bincode::serialize(&DiskRecord {
            meta: meta.clone(),
            data: data.to_vec(),
        })?;
        write_atomic(&tmp_dir, &dest, &bytes)?;
        debug!(path = %path, size = data.len(), "Committed object");
        Ok(())
    }

    fn quarantine(&self, path: &ObjectPath, reason: QuarantineReason) -> Result<QuarantineRecord> {
        let source = self.object_file(path)?;
        if !source.exists() {
            return Err(TesseraError::NotFound(path.to_string()));
        }
        let qdir = self
            .device_dir(&path.device)?
            .join(QUARANTINE_DIR)
            .join(policy_dir(path.policy));
        fs::create_dir_all(&qdir)?;

        let mut dest = qdir.join(format!("{}.{}", path.hash, DATA_EXT));
        if dest.exists() {
            dest = qdir.join(format!("{}.{}.{}", path.hash, DATA_EXT, uuid::Uuid::new_v4()));
        }
        fs::rename(&source, &dest)?;

        let record = QuarantineRecord {
            original_path: path.clone(),
            quarantine_path: dest.clone(),
            reason,
            detected_at: Utc::now(),
        };
        let mut record_path = dest.clone().into_os_string();
        record_path.push(".json");
        fs::write(PathBuf::from(record_path), serde_json::to_vec_pretty(&record)?)?;

        warn!(
            path = %path,
            quarantine_path = %dest.display(),
            reason = %record.reason,
            "Quarantined object"
        );
        Ok(record)
    }

    fn list_quarantined(&self, device: &str) -> Result<Vec<QuarantineRecord>> {
        let base = self.device_dir(device)?.join(QUARANTINE_DIR);
        let mut records = Vec::new();
        for policy in read_dir_names(&base)? {
            let dir = base.join(&policy);
            for name in read_dir_names(&dir)? {
                if !name.ends_with(".json") {
                    continue;
                }
                let bytes = fs::read(dir.join(&name))?;
                records.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(records)
    }

    fn delete_partition(&self, device: &str, policy: PolicyId, partition: PartitionId) -> Result<()> {
        let dir = self.partition_dir(device, policy, partition)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(device, policy, partition, "Deleted partition");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HashPathSalt;
    use tempfile::TempDir;

    fn setup() -> (TempDir, DiskStore) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sda")).unwrap();
        let store = DiskStore::new(dir.path(), false);
        (dir, store)
    }

    fn object(name: &str) -> (ObjectPath, ObjectMeta, Vec<u8>) {
        let hash = ObjectHash::compute(&HashPathSalt::default(), "AUTH_a", Some("c"), Some(name));
        let data = format!("payload of {}", name).into_bytes();
        let meta = ObjectMeta::for_data(format!("/AUTH_a/c/{}", name), Utc::now(), &data);
        (ObjectPath::new("sda", 0, 17, hash), meta, data)
    }

    #[test]
    fn test_write_read_list() {
        let (_dir, store) = setup();
        let (path, meta, data) = object("o1");
        store.atomic_write(&path, &meta, &data).unwrap();

        let file = store.read(&path).unwrap();
        assert_eq!(file.data, data);
        assert_eq!(file.meta, meta);

        assert_eq!(store.list_partitions("sda", 0).unwrap(), vec![17]);
        assert_eq!(store.list_suffixes("sda", 0, 17).unwrap(), vec![path.suffix()]);
        let objects = store.list_objects("sda", 0, 17, &path.suffix()).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].hash, path.hash);

        // no temp files left behind
        assert!(read_dir_names(&store.root().join("sda").join(TMP_DIR)).unwrap().is_empty());
    }

    #[test]
    fn test_missing_object_is_not_found() {
        let (_dir, store) = setup();
        let (path, _, _) = object("nope");
        assert!(matches!(store.read(&path), Err(TesseraError::NotFound(_))));
    }

    #[test]
    fn test_unmounted_device() {
        let (_dir, store) = setup();
        assert!(!store.is_mounted("sdb"));
        assert!(matches!(
            store.list_partitions("sdb", 0),
            Err(TesseraError::NotMounted(_))
        ));
    }

    #[test]
    fn test_mount_check_rejects_plain_directory() {
        let (dir, _) = setup();
        let store = DiskStore::new(dir.path(), true);
        assert!(!store.is_mounted("sda"));
    }

    #[test]
    fn test_quarantine_makes_object_absent() {
        let (_dir, store) = setup();
        let (path, meta, data) = object("bad");
        store.atomic_write(&path, &meta, &data).unwrap();

        let record = store
            .quarantine(&path, QuarantineReason::Unreadable("test".into()))
            .unwrap();
        assert!(record.quarantine_path.exists());
        assert!(matches!(store.read(&path), Err(TesseraError::NotFound(_))));
        assert!(store.list_objects("sda", 0, 17, &path.suffix()).unwrap().is_empty());

        let records = store.list_quarantined("sda").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_path, path);
    }

    #[test]
    fn test_garbage_record_is_unreadable_but_listed() {
        let (_dir, store) = setup();
        let (path, meta, data) = object("junk");
        store.atomic_write(&path, &meta, &data).unwrap();
        fs::write(store.object_file(&path).unwrap(), b"\xff\xff").unwrap();

        assert!(matches!(store.read(&path), Err(TesseraError::Serialization(_))));
        assert_eq!(
            store.list_hashes("sda", 0, 17, &path.suffix()).unwrap(),
            vec![path.hash.clone()]
        );
        assert!(store.list_objects("sda", 0, 17, &path.suffix()).unwrap().is_empty());
    }

    #[test]
    fn test_delete_partition() {
        let (_dir, store) = setup();
        let (path, meta, data) = object("o1");
        store.atomic_write(&path, &meta, &data).unwrap();
        store.delete_partition("sda", 0, 17).unwrap();
        assert!(store.list_partitions("sda", 0).unwrap().is_empty());
        store.delete_partition("sda", 0, 17).unwrap();
    }
}
