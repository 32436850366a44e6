//! In-memory object store for tests and simulations.

use super::{ObjectStore, QuarantineReason, QuarantineRecord};
use crate::error::{Result, TesseraError};
use crate::types::{ObjectFile, ObjectHash, ObjectMeta, ObjectPath, PartitionId, PolicyId, Suffix};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

type Key = (String, PolicyId, PartitionId, ObjectHash);

#[derive(Debug, Clone)]
enum Blob {
    Stored { meta: ObjectMeta, data: Vec<u8> },
    Unreadable,
}

#[derive(Debug, Default)]
struct Inner {
    devices: BTreeSet<String>,
    unmounted: HashSet<String>,
    objects: BTreeMap<Key, Blob>,
    quarantined: Vec<QuarantineRecord>,
}

/// Object store kept entirely in memory.
///
/// Devices must be registered with [`MemoryStore::add_device`] and can be
/// unmounted to simulate failed disks.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        for device in devices {
            store.add_device(device);
        }
        store
    }

    pub fn add_device(&self, device: impl Into<String>) {
        self.inner.write().devices.insert(device.into());
    }

    pub fn unmount(&self, device: &str) {
        self.inner.write().unmounted.insert(device.to_string());
    }

    pub fn mount(&self, device: &str) {
        self.inner.write().unmounted.remove(device);
    }

    /// Overwrite an object's bytes without touching its metadata.
    pub fn corrupt(&self, path: &ObjectPath, data: Vec<u8>) {
        let mut inner = self.inner.write();
        if let Some(Blob::Stored { data: stored, .. }) = inner.objects.get_mut(&key(path)) {
            *stored = data;
        }
    }

    /// Replace an object with an undecodable one.
    pub fn make_unreadable(&self, path: &ObjectPath) {
        self.inner.write().objects.insert(key(path), Blob::Unreadable);
    }

    /// Number of object entries on a device.
    pub fn object_count(&self, device: &str) -> usize {
        self.inner
            .read()
            .objects
            .keys()
            .filter(|(d, ..)| d == device)
            .count()
    }

    /// Total committed writes since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn check_mounted(&self, inner: &Inner, device: &str) -> Result<()> {
        if inner.devices.contains(device) && !inner.unmounted.contains(device) {
            Ok(())
        } else {
            Err(TesseraError::NotMounted(device.to_string()))
        }
    }
}

fn key(path: &ObjectPath) -> Key {
    (
        path.device.clone(),
        path.policy,
        path.partition,
        path.hash.clone(),
    )
}

impl ObjectStore for MemoryStore {
    fn is_mounted(&self, device: &str) -> bool {
        let inner = self.inner.read();
        self.check_mounted(&inner, device).is_ok()
    }

    fn list_partitions(&self, device: &str, policy: PolicyId) -> Result<Vec<PartitionId>> {
        let inner = self.inner.read();
        self.check_mounted(&inner, device)?;
        let parts: BTreeSet<PartitionId> = inner
            .objects
            .keys()
            .filter(|(d, p, ..)| d == device && *p == policy)
            .map(|(_, _, part, _)| *part)
            .collect();
        Ok(parts.into_iter().collect())
    }

    fn list_suffixes(
        &self,
        device: &str,
        policy: PolicyId,
        partition: PartitionId,
    ) -> Result<Vec<Suffix>> {
        let inner = self.inner.read();
        self.check_mounted(&inner, device)?;
        let suffixes: BTreeSet<Suffix> = inner
            .objects
            .keys()
            .filter(|(d, p, part, _)| d == device && *p == policy && *part == partition)
            .map(|(.., hash)| hash.suffix())
            .collect();
        Ok(suffixes.into_iter().collect())
    }

    fn list_hashes(
        &self,
        device: &str,
        policy: PolicyId,
        partition: PartitionId,
        suffix: &Suffix,
    ) -> Result<Vec<ObjectHash>> {
        let inner = self.inner.read();
        self.check_mounted(&inner, device)?;
        Ok(inner
            .objects
            .keys()
            .filter(|(d, p, part, hash)| {
                d == device && *p == policy && *part == partition && hash.suffix() == *suffix
            })
            .map(|(.., hash)| hash.clone())
            .collect())
    }

    fn read(&self, path: &ObjectPath) -> Result<ObjectFile> {
        let inner = self.inner.read();
        self.check_mounted(&inner, &path.device)?;
        match inner.objects.get(&key(path)) {
            Some(Blob::Stored { meta, data }) => Ok(ObjectFile {
                path: path.clone(),
                meta: meta.clone(),
                data: data.clone(),
            }),
            Some(Blob::Unreadable) => Err(TesseraError::Serialization(format!(
                "undecodable record at {}",
                path
            ))),
            None => Err(TesseraError::NotFound(path.to_string())),
        }
    }

    fn atomic_write(&self, path: &ObjectPath, meta: &ObjectMeta, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        self.check_mounted(&inner, &path.device)?;
        inner.objects.insert(
            key(path),
            Blob::Stored {
                meta: meta.clone(),
                data: data.to_vec(),
            },
        );
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn quarantine(&self, path: &ObjectPath, reason: QuarantineReason) -> Result<QuarantineRecord> {
        let mut inner = self.inner.write();
        self.check_mounted(&inner, &path.device)?;
        if inner.objects.remove(&key(path)).is_none() {
            return Err(TesseraError::NotFound(path.to_string()));
        }
        let record = QuarantineRecord {
            original_path: path.clone(),
            quarantine_path: PathBuf::from(format!("{}/quarantined/{}", path.device, path.hash)),
            reason,
            detected_at: Utc::now(),
        };
        inner.quarantined.push(record.clone());
        Ok(record)
    }

    fn list_quarantined(&self, device: &str) -> Result<Vec<QuarantineRecord>> {
        let inner = self.inner.read();
        self.check_mounted(&inner, device)?;
        Ok(inner
            .quarantined
            .iter()
            .filter(|r| r.original_path.device == device)
            .cloned()
            .collect())
    }

    fn delete_partition(&self, device: &str, policy: PolicyId, partition: PartitionId) -> Result<()> {
        let mut inner = self.inner.write();
        self.check_mounted(&inner, device)?;
        inner
            .objects
            .retain(|(d, p, part, _), _| !(d == device && *p == policy && *part == partition));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmount_hides_device() {
        let store = MemoryStore::with_devices(["sda"]);
        let hash = ObjectHash::parse("0123456789abcdef0123456789abcdef").unwrap();
        let path = ObjectPath::new("sda", 0, 1, hash);
        let meta = ObjectMeta::for_data("/a/c/o", Utc::now(), b"x");
        store.atomic_write(&path, &meta, b"x").unwrap();

        store.unmount("sda");
        assert!(!store.is_mounted("sda"));
        assert!(matches!(store.read(&path), Err(TesseraError::NotMounted(_))));

        store.mount("sda");
        assert_eq!(store.read(&path).unwrap().data, b"x");
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_corrupt_keeps_meta() {
        let store = MemoryStore::with_devices(["sda"]);
        let hash = ObjectHash::parse("0123456789abcdef0123456789abcdef").unwrap();
        let path = ObjectPath::new("sda", 0, 1, hash);
        let meta = ObjectMeta::for_data("/a/c/o", Utc::now(), b"good");
        store.atomic_write(&path, &meta, b"good").unwrap();
        store.corrupt(&path, b"evil".to_vec());

        let file = store.read(&path).unwrap();
        assert!(file.meta.verify(&file.data).is_err());
    }
}
