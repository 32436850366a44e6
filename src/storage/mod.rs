//! Local object storage.
//!
//! The [`ObjectStore`] trait is the only way the daemons touch local data.
//! Objects live at `<device>/<policy dir>/<partition>/<suffix>/<hash>` and
//! are always written atomically. Quarantine moves an object out of that
//! tree so every other component sees it as absent.

pub(crate) mod disk;
mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

use crate::error::{Result, TesseraError};
use crate::types::{
    ObjectFile, ObjectHash, ObjectMeta, ObjectPath, ObjectSummary, PartitionId, PolicyId, Suffix,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

/// Digest of every suffix in a partition.
pub type SuffixDigests = BTreeMap<Suffix, String>;

/// Why an object was quarantined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    /// Stored bytes do not match the recorded etag.
    DigestMismatch { expected: String, actual: String },
    /// Stored bytes do not match the recorded size.
    SizeMismatch { expected: u64, actual: u64 },
    /// The object could not be read or decoded.
    Unreadable(String),
}

impl QuarantineReason {
    /// Classify a failed [`ObjectMeta::verify`] check.
    pub fn from_verification(meta: &ObjectMeta, data: &[u8]) -> Option<Self> {
        if data.len() as u64 != meta.size {
            return Some(QuarantineReason::SizeMismatch {
                expected: meta.size,
                actual: data.len() as u64,
            });
        }
        let actual = crate::types::etag_of(data);
        if actual != meta.etag {
            return Some(QuarantineReason::DigestMismatch {
                expected: meta.etag.clone(),
                actual,
            });
        }
        None
    }
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuarantineReason::DigestMismatch { expected, actual } => {
                write!(f, "etag mismatch (expected {}, got {})", expected, actual)
            }
            QuarantineReason::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch (expected {}, got {})", expected, actual)
            }
            QuarantineReason::Unreadable(e) => write!(f, "unreadable: {}", e),
        }
    }
}

/// Record left next to every quarantined object. Never removed automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub original_path: ObjectPath,
    pub quarantine_path: PathBuf,
    pub reason: QuarantineReason,
    pub detected_at: DateTime<Utc>,
}

/// Local storage collaborator shared by the replicator, reconstructor and auditor.
pub trait ObjectStore: Send + Sync {
    /// Whether the device is present and usable.
    fn is_mounted(&self, device: &str) -> bool;

    /// Partitions of a policy present on a device.
    fn list_partitions(&self, device: &str, policy: PolicyId) -> Result<Vec<PartitionId>>;

    /// Suffixes present in a partition.
    fn list_suffixes(&self, device: &str, policy: PolicyId, partition: PartitionId)
        -> Result<Vec<Suffix>>;

    /// Object hashes present in a suffix, including unreadable ones.
    fn list_hashes(
        &self,
        device: &str,
        policy: PolicyId,
        partition: PartitionId,
        suffix: &Suffix,
    ) -> Result<Vec<ObjectHash>>;

    /// Read an object and its metadata. Missing objects yield `NotFound`.
    fn read(&self, path: &ObjectPath) -> Result<ObjectFile>;

    /// Read only the metadata of an object.
    fn read_meta(&self, path: &ObjectPath) -> Result<ObjectMeta> {
        self.read(path).map(|file| file.meta)
    }

    /// Stage and commit an object so readers see either the old or the new version.
    fn atomic_write(&self, path: &ObjectPath, meta: &ObjectMeta, data: &[u8]) -> Result<()>;

    /// Move an object out of its logical location.
    fn quarantine(&self, path: &ObjectPath, reason: QuarantineReason) -> Result<QuarantineRecord>;

    /// Quarantine records on a device.
    fn list_quarantined(&self, device: &str) -> Result<Vec<QuarantineRecord>>;

    /// Remove a whole partition (after a successful handoff).
    fn delete_partition(&self, device: &str, policy: PolicyId, partition: PartitionId) -> Result<()>;

    /// Readable objects of a suffix, sorted by hash.
    fn list_objects(
        &self,
        device: &str,
        policy: PolicyId,
        partition: PartitionId,
        suffix: &Suffix,
    ) -> Result<Vec<ObjectSummary>> {
        let mut out = Vec::new();
        for hash in self.list_hashes(device, policy, partition, suffix)? {
            let path = ObjectPath::new(device, policy, partition, hash.clone());
            match self.read_meta(&path) {
                Ok(meta) => out.push(ObjectSummary {
                    hash,
                    timestamp: meta.timestamp,
                    fragment_index: meta.fragment_index,
                }),
                Err(TesseraError::NotMounted(d)) => return Err(TesseraError::NotMounted(d)),
                Err(e) => debug!(path = %path, error = %e, "Skipping unreadable object"),
            }
        }
        out.sort_by(|a, b| a.hash.cmp(&b.hash));
        Ok(out)
    }
}

/// Digest of one suffix: md5 over sorted `"<hash> <timestamp micros>"` lines.
pub fn digest_objects(objects: &[ObjectSummary]) -> String {
    let mut lines: Vec<String> = objects
        .iter()
        .map(|o| format!("{} {}\n", o.hash, o.timestamp.timestamp_micros()))
        .collect();
    lines.sort();
    format!("{:x}", md5::compute(lines.concat()))
}

/// Compute suffix digests of a partition, optionally restricted to `only`.
///
/// Suffixes with no readable objects are omitted, so a suffix emptied by
/// quarantine compares as absent.
pub fn suffix_digests(
    store: &dyn ObjectStore,
    device: &str,
    policy: PolicyId,
    partition: PartitionId,
    only: Option<&[Suffix]>,
) -> Result<SuffixDigests> {
    let suffixes = match only {
        Some(list) => list.to_vec(),
        None => store.list_suffixes(device, policy, partition)?,
    };
    let mut digests = SuffixDigests::new();
    for suffix in suffixes {
        let objects = store.list_objects(device, policy, partition, &suffix)?;
        if objects.is_empty() {
            continue;
        }
        digests.insert(suffix, digest_objects(&objects));
    }
    Ok(digests)
}

/// Suffixes whose digest differs between `local` and `remote`, or that `remote` lacks.
pub fn differing_suffixes(local: &SuffixDigests, remote: &SuffixDigests) -> Vec<Suffix> {
    local
        .iter()
        .filter(|(suffix, digest)| remote.get(*suffix) != Some(*digest))
        .map(|(suffix, _)| suffix.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn summary(hash: &str, secs: i64) -> ObjectSummary {
        ObjectSummary {
            hash: ObjectHash::parse(hash).unwrap(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            fragment_index: None,
        }
    }

    #[test]
    fn test_digest_ignores_listing_order() {
        let a = summary("00000000000000000000000000000abc", 10);
        let b = summary("11111111111111111111111111111abc", 20);
        assert_eq!(
            digest_objects(&[a.clone(), b.clone()]),
            digest_objects(&[b, a])
        );
    }

    #[test]
    fn test_digest_tracks_timestamps() {
        let a = summary("00000000000000000000000000000abc", 10);
        let newer = summary("00000000000000000000000000000abc", 11);
        assert_ne!(digest_objects(&[a]), digest_objects(&[newer]));
    }

    #[test]
    fn test_differing_suffixes() {
        let s1 = Suffix::parse("abc").unwrap();
        let s2 = Suffix::parse("def").unwrap();
        let s3 = Suffix::parse("123").unwrap();
        let local: SuffixDigests = [
            (s1.clone(), "x".to_string()),
            (s2.clone(), "y".to_string()),
            (s3.clone(), "z".to_string()),
        ]
        .into_iter()
        .collect();
        let remote: SuffixDigests = [(s1, "x".to_string()), (s2.clone(), "other".to_string())]
            .into_iter()
            .collect();
        let mut diff = differing_suffixes(&local, &remote);
        diff.sort();
        assert_eq!(diff, vec![s3, s2]);
    }

    #[test]
    fn test_quarantine_reason_classification() {
        let meta = ObjectMeta::for_data("/a/c/o", Utc::now(), b"abcd");
        assert!(QuarantineReason::from_verification(&meta, b"abcd").is_none());
        assert!(matches!(
            QuarantineReason::from_verification(&meta, b"abc"),
            Some(QuarantineReason::SizeMismatch { expected: 4, actual: 3 })
        ));
        assert!(matches!(
            QuarantineReason::from_verification(&meta, b"abce"),
            Some(QuarantineReason::DigestMismatch { .. })
        ));
    }
}
