//! Core type definitions for Tessera.
//!
//! This module contains the identifiers and records shared by the ring, the
//! object store, the repair strategies and the daemons.
//!
//! # Key Types
//!
//! - [`Device`]: a storage device as listed in the ring
//! - [`StoragePolicy`]: replicated or erasure-coded durability
//! - [`ObjectHash`] / [`Suffix`]: the hashed name of an object and its
//!   coarse grouping inside a partition
//! - [`ObjectMeta`] / [`ObjectPath`] / [`ObjectFile`]: stored objects
//! - [`PassStatistics`]: counters accumulated by one daemon pass
//!
//! # Examples
//!
//! ```rust
//! use tessera::types::{HashPathSalt, ObjectHash};
//!
//! let salt = HashPathSalt::new("prefix", "suffix");
//! let hash = ObjectHash::compute(&salt, "AUTH_test", Some("photos"), Some("cat.jpg"));
//! assert_eq!(hash.as_str().len(), 32);
//! assert_eq!(hash.suffix().as_str(), &hash.as_str()[29..]);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Result, TesseraError};

/// Unique identifier for a device in a ring.
pub type DeviceId = u32;

/// Partition number.
pub type PartitionId = u32;

/// Index of a storage policy.
pub type PolicyId = u16;

/// A storage device as described by the ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    /// Directory name of the device under the devices root (e.g. `sdb1`).
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub weight: f64,
    pub region: u32,
    pub zone: u32,
}

impl Device {
    /// Check whether this device is served by the node at `ip:port`.
    pub fn is_local(&self, ip: &str, port: u16) -> bool {
        self.ip == ip && self.port == port
    }

    /// Region and zone pair used for failure-domain spreading.
    pub fn failure_domain(&self) -> (u32, u32) {
        (self.region, self.zone)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.port, self.name)
    }
}

/// Erasure coding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErasureScheme {
    /// Reed-Solomon over GF(2^8).
    #[default]
    ReedSolomon,
}

/// Durability policy for a logical container of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StoragePolicy {
    /// Whole copies on `replica_count` devices.
    Replicated { replica_count: usize },
    /// Fragment archives on `data_fragments + parity_fragments` devices.
    ErasureCoded {
        data_fragments: usize,
        parity_fragments: usize,
        #[serde(default)]
        scheme: ErasureScheme,
    },
}

impl StoragePolicy {
    /// Number of devices a partition of this policy must be assigned to.
    pub fn required_devices(&self) -> usize {
        match self {
            StoragePolicy::Replicated { replica_count } => *replica_count,
            StoragePolicy::ErasureCoded {
                data_fragments,
                parity_fragments,
                ..
            } => data_fragments + parity_fragments,
        }
    }

    pub fn is_erasure_coded(&self) -> bool {
        matches!(self, StoragePolicy::ErasureCoded { .. })
    }

    /// Erasure coding parameters, if this is an erasure-coded policy.
    pub fn erasure_config(&self) -> Option<ErasureCodingConfig> {
        match self {
            StoragePolicy::ErasureCoded {
                data_fragments,
                parity_fragments,
                ..
            } => Some(ErasureCodingConfig {
                data_shards: *data_fragments,
                parity_shards: *parity_fragments,
            }),
            StoragePolicy::Replicated { .. } => None,
        }
    }
}

/// Erasure coding configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureCodingConfig {
    /// Number of data shards (k).
    pub data_shards: usize,
    /// Number of parity shards (m).
    pub parity_shards: usize,
}

impl ErasureCodingConfig {
    /// Default 4+2 configuration (1.5x storage overhead).
    pub const DEFAULT: Self = Self {
        data_shards: 4,
        parity_shards: 2,
    };

    /// 10+4 for cost-optimized storage (1.4x overhead).
    pub const COST_OPTIMIZED: Self = Self {
        data_shards: 10,
        parity_shards: 4,
    };

    /// 2+1 for small clusters.
    pub const SMALL_CLUSTER: Self = Self {
        data_shards: 2,
        parity_shards: 1,
    };

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    pub fn storage_overhead(&self) -> f64 {
        self.total_shards() as f64 / self.data_shards as f64
    }
}

impl Default for ErasureCodingConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Directory name holding objects of a policy on each device.
pub fn policy_dir(policy: PolicyId) -> String {
    if policy == 0 {
        "objects".to_string()
    } else {
        format!("objects-{}", policy)
    }
}

/// Secret prefix and suffix mixed into every object hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashPathSalt {
    pub prefix: String,
    pub suffix: String,
}

impl HashPathSalt {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }
}

/// MD5-derived name of an object (32 lowercase hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHash(String);

impl ObjectHash {
    /// Hash an account, container or object path.
    pub fn compute(
        salt: &HashPathSalt,
        account: &str,
        container: Option<&str>,
        object: Option<&str>,
    ) -> Self {
        let mut path = format!("/{}", account);
        if let Some(container) = container {
            path.push('/');
            path.push_str(container);
        }
        if let Some(object) = object {
            path.push('/');
            path.push_str(object);
        }
        let digest = md5::compute(format!("{}{}{}", salt.prefix, path, salt.suffix));
        Self(format!("{:x}", digest))
    }

    /// Parse a hex hash.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(TesseraError::InvalidArgument(format!("invalid object hash: {}", s)));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 32 bits of the hash, used for partition lookup.
    pub fn prefix_u32(&self) -> u32 {
        u32::from_str_radix(&self.0[..8], 16).unwrap_or(0)
    }

    /// The suffix grouping this object inside its partition.
    pub fn suffix(&self) -> Suffix {
        Suffix(self.0[self.0.len() - 3..].to_string())
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last three hex characters of an object hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Suffix(String);

impl Suffix {
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != 3 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TesseraError::InvalidArgument(format!("invalid suffix: {}", s)));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Suffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata stored alongside every object or fragment archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Logical name (`/account/container/object`).
    pub name: String,
    /// Write timestamp; the newest timestamp wins.
    pub timestamp: DateTime<Utc>,
    /// Size of the stored bytes.
    pub size: u64,
    /// MD5 hex digest of the stored bytes.
    pub etag: String,
    /// Fragment index of an erasure-coded archive.
    #[serde(default)]
    pub fragment_index: Option<usize>,
    /// Size of the whole object an archive was cut from.
    #[serde(default)]
    pub object_size: Option<u64>,
}

impl ObjectMeta {
    /// Metadata for a whole replicated object.
    pub fn for_data(name: impl Into<String>, timestamp: DateTime<Utc>, data: &[u8]) -> Self {
        Self {
            name: name.into(),
            timestamp,
            size: data.len() as u64,
            etag: etag_of(data),
            fragment_index: None,
            object_size: None,
        }
    }

    /// Metadata for one fragment archive of an erasure-coded object.
    pub fn for_fragment(
        name: impl Into<String>,
        timestamp: DateTime<Utc>,
        fragment: &[u8],
        index: usize,
        object_size: u64,
    ) -> Self {
        Self {
            fragment_index: Some(index),
            object_size: Some(object_size),
            ..Self::for_data(name, timestamp, fragment)
        }
    }

    /// Check stored bytes against the recorded size and etag.
    pub fn verify(&self, data: &[u8]) -> std::result::Result<(), String> {
        if data.len() as u64 != self.size {
            return Err(format!("size {} != recorded {}", data.len(), self.size));
        }
        let actual = etag_of(data);
        if actual != self.etag {
            return Err(format!("etag {} != recorded {}", actual, self.etag));
        }
        Ok(())
    }
}

/// MD5 hex digest of a byte slice.
pub fn etag_of(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Location of one object on one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectPath {
    pub device: String,
    pub policy: PolicyId,
    pub partition: PartitionId,
    pub hash: ObjectHash,
}

impl ObjectPath {
    pub fn new(device: impl Into<String>, policy: PolicyId, partition: PartitionId, hash: ObjectHash) -> Self {
        Self {
            device: device.into(),
            policy,
            partition,
            hash,
        }
    }

    pub fn suffix(&self) -> Suffix {
        self.hash.suffix()
    }

    /// The same object on another device.
    pub fn on_device(&self, device: &str) -> Self {
        Self {
            device: device.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.device,
            policy_dir(self.policy),
            self.partition,
            self.hash.suffix(),
            self.hash
        )
    }
}

/// An object with its metadata, as moved between devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectFile {
    pub path: ObjectPath,
    pub meta: ObjectMeta,
    pub data: Vec<u8>,
}

/// Summary of an object in a suffix listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub hash: ObjectHash,
    pub timestamp: DateTime<Utc>,
    pub fragment_index: Option<usize>,
}

/// Why a pass ended before visiting all of its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassAbort {
    /// The ring changed; remaining jobs were not started.
    StaleRing,
    /// No job completed within the lockup window; workers were torn down.
    Lockup,
    /// The process is shutting down.
    Shutdown,
}

/// Counters accumulated over one pass of a daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassStatistics {
    /// Jobs, files or records started.
    pub attempted: u64,
    /// Target devices, fragments, files or deliveries that succeeded.
    pub succeeded: u64,
    /// Target devices, fragments, files or deliveries that failed.
    pub failed: u64,
    /// Work skipped because a device was not mounted.
    pub skipped: u64,
    pub bytes_transferred: u64,
    pub quarantined: u64,
    pub handoffs_deleted: u64,
    pub suffixes_synced: u64,
    pub fragments_rebuilt: u64,
    pub dead_lettered: u64,
    pub elapsed: Duration,
    pub aborted: Option<PassAbort>,
}

impl PassStatistics {
    /// A pass succeeds when nothing failed.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.aborted.is_none()
    }

    pub fn items_per_sec(&self) -> f64 {
        rate(self.attempted, self.elapsed)
    }

    pub fn bytes_per_sec(&self) -> f64 {
        rate(self.bytes_transferred, self.elapsed)
    }

    /// Add another pass's counters into this one. `aborted` keeps the latest abort.
    pub fn merge(&mut self, other: &PassStatistics) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.bytes_transferred += other.bytes_transferred;
        self.quarantined += other.quarantined;
        self.handoffs_deleted += other.handoffs_deleted;
        self.suffixes_synced += other.suffixes_synced;
        self.fragments_rebuilt += other.fragments_rebuilt;
        self.dead_lettered += other.dead_lettered;
        self.elapsed += other.elapsed;
        if other.aborted.is_some() {
            self.aborted = other.aborted;
        }
    }
}

fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    count as f64 / secs
}
