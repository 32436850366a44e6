//! Ring: the versioned mapping from partitions to devices.
//!
//! A [`Ring`] is immutable once loaded. The process-wide view of a ring is a
//! [`RingHandle`], which holds an `Arc<Ring>` that is replaced wholesale on
//! reload. Readers take a cheap clone of the `Arc` and keep a consistent
//! snapshot for as long as they need it.
//!
//! # Example
//!
//! ```rust
//! use tessera::ring::RingBuilder;
//!
//! let mut builder = RingBuilder::new(4, 3);
//! for zone in 1..=3 {
//!     builder.add_device(format!("sd{}", zone), "10.0.0.1", 6200, 100.0, 1, zone);
//! }
//! let ring = builder.build().unwrap();
//! assert_eq!(ring.partition_count(), 16);
//! assert_eq!(ring.devices_for(7).len(), 3);
//! ```

mod builder;

pub use builder::RingBuilder;

use crate::error::{Result, TesseraError};
use crate::types::{Device, DeviceId, ObjectHash, PartitionId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

/// Largest supported partition power.
pub const MAX_PARTITION_POWER: u32 = 24;

/// Immutable partition-to-device mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ring {
    version: u64,
    replica_count: usize,
    partition_power: u32,
    /// Device table indexed by device id; removed devices leave a `None` hole.
    devices: Vec<Option<Device>>,
    /// Ordered device ids per partition.
    assignments: Vec<Vec<DeviceId>>,
}

impl Ring {
    /// Parse and validate a serialized ring.
    pub fn load(bytes: &[u8]) -> Result<Self> {
        let ring: Ring = serde_json::from_slice(bytes)
            .map_err(|e| TesseraError::RingLoad(format!("malformed ring: {}", e)))?;
        ring.validate()?;
        Ok(ring)
    }

    /// Read and validate a ring file.
    pub fn load_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            TesseraError::RingLoad(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::load(&bytes)
    }

    pub(crate) fn from_parts(
        version: u64,
        replica_count: usize,
        partition_power: u32,
        devices: Vec<Option<Device>>,
        assignments: Vec<Vec<DeviceId>>,
    ) -> Result<Self> {
        let ring = Self {
            version,
            replica_count,
            partition_power,
            devices,
            assignments,
        };
        ring.validate()?;
        Ok(ring)
    }

    fn validate(&self) -> Result<()> {
        if self.partition_power > MAX_PARTITION_POWER {
            return Err(TesseraError::RingLoad(format!(
                "partition power {} exceeds {}",
                self.partition_power, MAX_PARTITION_POWER
            )));
        }
        if self.replica_count == 0 {
            return Err(TesseraError::RingLoad("replica count must be non-zero".into()));
        }
        if self.assignments.len() != self.partition_count() as usize {
            return Err(TesseraError::RingLoad(format!(
                "expected {} partition assignments, found {}",
                self.partition_count(),
                self.assignments.len()
            )));
        }
        for (idx, slot) in self.devices.iter().enumerate() {
            if let Some(dev) = slot {
                if dev.id as usize != idx {
                    return Err(TesseraError::RingLoad(format!(
                        "device {} stored at index {}",
                        dev.id, idx
                    )));
                }
            }
        }

        let domains: HashSet<(u32, u32)> = self
            .devices
            .iter()
            .flatten()
            .filter(|d| d.weight > 0.0)
            .map(Device::failure_domain)
            .collect();
        let spread_required = domains.len() >= self.replica_count;

        for (part, ids) in self.assignments.iter().enumerate() {
            if ids.len() < self.replica_count {
                return Err(TesseraError::RingLoad(format!(
                    "partition {} has {} devices, needs {}",
                    part,
                    ids.len(),
                    self.replica_count
                )));
            }
            let mut seen = HashSet::new();
            for id in ids {
                if self.device(*id).is_none() {
                    return Err(TesseraError::RingLoad(format!(
                        "partition {} references unknown device {}",
                        part, id
                    )));
                }
                if !seen.insert(*id) {
                    return Err(TesseraError::RingLoad(format!(
                        "partition {} lists device {} twice",
                        part, id
                    )));
                }
            }
            if spread_required {
                let mut zones = HashSet::new();
                for id in &ids[..self.replica_count] {
                    let domain = self.devices[*id as usize]
                        .as_ref()
                        .map(Device::failure_domain);
                    if !zones.insert(domain) {
                        return Err(TesseraError::RingLoad(format!(
                            "partition {} places two replicas in one zone",
                            part
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    pub fn partition_power(&self) -> u32 {
        self.partition_power
    }

    pub fn partition_count(&self) -> u32 {
        1u32 << self.partition_power
    }

    /// Partition holding a hash. Depends only on the hash and the ring geometry.
    pub fn partition_for(&self, hash: &ObjectHash) -> PartitionId {
        hash.prefix_u32()
            .checked_shr(32 - self.partition_power)
            .unwrap_or(0)
    }

    /// Ordered devices assigned to a partition; empty for out-of-range partitions.
    pub fn devices_for(&self, partition: PartitionId) -> Vec<Device> {
        self.assignments
            .get(partition as usize)
            .map(|ids| ids.iter().filter_map(|id| self.device(*id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id as usize).and_then(Option::as_ref)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().flatten()
    }

    /// Devices served by the node listening on `ip:port`.
    pub fn local_devices(&self, ip: &str, port: u16) -> Vec<Device> {
        self.devices()
            .filter(|d| d.is_local(ip, port))
            .cloned()
            .collect()
    }

    /// Number of partitions each device is assigned.
    pub fn assignment_counts(&self) -> Vec<(DeviceId, usize)> {
        let mut counts = vec![0usize; self.devices.len()];
        for ids in &self.assignments {
            for id in ids {
                counts[*id as usize] += 1;
            }
        }
        self.devices()
            .map(|d| (d.id, counts[d.id as usize]))
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Write the ring to `path` atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Process-wide, reloadable view of one ring.
#[derive(Debug)]
pub struct RingHandle {
    path: Option<PathBuf>,
    current: RwLock<Arc<Ring>>,
    loaded_mtime: Mutex<Option<SystemTime>>,
}

impl RingHandle {
    /// Wrap an in-memory ring with no backing file.
    pub fn new(ring: Ring) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(ring)),
            loaded_mtime: Mutex::new(None),
        }
    }

    /// Load a ring from a file, remembering the path for later reloads.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mtime = modified(&path);
        let ring = Ring::load_file(&path)?;
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(ring)),
            loaded_mtime: Mutex::new(mtime),
        })
    }

    /// Snapshot of the current ring.
    pub fn current(&self) -> Arc<Ring> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version()
    }

    /// Replace the ring, returning the previous one.
    pub fn swap(&self, ring: Ring) -> Arc<Ring> {
        let new = Arc::new(ring);
        let old = std::mem::replace(&mut *self.current.write(), new);
        info!(
            old_version = old.version(),
            new_version = self.version(),
            "Ring swapped"
        );
        old
    }

    /// Re-read the backing file. Returns whether the version changed.
    ///
    /// A file that fails to load leaves the current ring in place.
    pub fn reload(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let mtime = modified(path);
        let ring = Ring::load_file(path)?;
        *self.loaded_mtime.lock() = mtime;
        if ring.version() == self.version() {
            debug!(path = %path.display(), "Ring file unchanged");
            return Ok(false);
        }
        self.swap(ring);
        Ok(true)
    }

    /// Reload only if the backing file's modification time moved.
    pub fn reload_if_changed(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let mtime = modified(path);
        if mtime.is_some() && mtime == *self.loaded_mtime.lock() {
            return Ok(false);
        }
        self.reload()
    }

    /// Fail with `StaleRing` if the ring moved past `expected`.
    pub fn ensure_version(&self, expected: u64) -> Result<()> {
        let found = self.version();
        if found != expected {
            return Err(TesseraError::StaleRing { expected, found });
        }
        Ok(())
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
