//! Partition repair strategies.
//!
//! The scheduler hands every partition job to a [`SyncStrategy`] chosen by
//! the partition's storage policy:
//!
//! - [`WholeCopySync`] for replicated policies: compare suffix digests with
//!   each peer and push whole files for suffixes that differ.
//! - [`FragmentRebuildSync`] for erasure-coded policies: regenerate the
//!   local fragment archive from at least `data_fragments` peer fragments.
//!
//! Failures are recorded per target device or per fragment in the returned
//! [`SyncOutcome`]; a strategy never fails the whole job because one peer is
//! slow, unmounted or unreachable.

mod fragment_rebuild;
mod whole_copy;

pub use fragment_rebuild::FragmentRebuildSync;
pub use whole_copy::WholeCopySync;

use crate::error::{Result, TesseraError};
use crate::storage::ObjectStore;
use crate::transport::PeerTransport;
use crate::types::{Device, DeviceId, ObjectHash, PartitionId, PolicyId, StoragePolicy};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// One unit of repair work: a local partition and the devices it syncs with.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub partition: PartitionId,
    pub policy_id: PolicyId,
    pub policy: StoragePolicy,
    /// Local device holding the partition.
    pub source_device: Device,
    /// Devices to sync with: the other primaries, or every primary for a handoff.
    pub target_devices: Vec<Device>,
    /// Ordered primaries of the partition; position is the fragment index.
    pub primaries: Vec<Device>,
    /// The source device is not a primary for this partition.
    pub is_handoff: bool,
    /// Ring version the job was derived from.
    pub ring_version: u64,
}

impl SyncJob {
    /// Fragment index owned by the source device, if it is a primary.
    pub fn fragment_index(&self) -> Option<usize> {
        self.primaries
            .iter()
            .position(|d| d.id == self.source_device.id)
    }
}

/// What a target result refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTarget {
    Device(DeviceId),
    /// One archive of an object; `index` is `None` when it carries no usable
    /// fragment index.
    Fragment {
        hash: ObjectHash,
        index: Option<usize>,
    },
}

/// Outcome for one target device or fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStatus {
    /// Data was transferred or rebuilt.
    Synced { bytes: u64 },
    /// Nothing needed to move.
    InSync,
    /// The device is not mounted; skipped rather than failed.
    NotMounted,
    /// The per-device transfer limit elapsed.
    TimedOut,
    /// Too few usable peer fragments to rebuild.
    InsufficientFragments { available: usize, required: usize },
    Failed(String),
}

impl TargetStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TargetStatus::Synced { .. } | TargetStatus::InSync)
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, TargetStatus::NotMounted)
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success() && !self.is_skip()
    }

    /// Map a per-target error onto a status.
    pub fn from_error(err: &TesseraError) -> Self {
        match err {
            TesseraError::NotMounted(_) => TargetStatus::NotMounted,
            TesseraError::TransferTimeout { .. } => TargetStatus::TimedOut,
            TesseraError::InsufficientFragments {
                available,
                required,
            } => TargetStatus::InsufficientFragments {
                available: *available,
                required: *required,
            },
            other => TargetStatus::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetResult {
    pub target: SyncTarget,
    pub status: TargetStatus,
}

/// Result of one [`SyncJob`].
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub partition: PartitionId,
    pub policy_id: PolicyId,
    pub is_handoff: bool,
    pub results: Vec<TargetResult>,
    pub bytes_transferred: u64,
    pub suffixes_synced: u64,
    pub fragments_rebuilt: u64,
    pub quarantined: u64,
    pub handoff_deleted: bool,
    /// Failure of the job as a whole, e.g. the local partition could not be listed.
    pub job_error: Option<String>,
}

impl SyncOutcome {
    pub fn for_job(job: &SyncJob) -> Self {
        Self {
            partition: job.partition,
            policy_id: job.policy_id,
            is_handoff: job.is_handoff,
            ..Default::default()
        }
    }

    pub fn record(&mut self, target: SyncTarget, status: TargetStatus) {
        if let TargetStatus::Synced { bytes } = status {
            self.bytes_transferred += bytes;
        }
        self.results.push(TargetResult { target, status });
    }

    pub fn succeeded(&self) -> u64 {
        self.results.iter().filter(|r| r.status.is_success()).count() as u64
    }

    pub fn failed(&self) -> u64 {
        let failed = self.results.iter().filter(|r| r.status.is_failure()).count() as u64;
        failed + u64::from(self.job_error.is_some())
    }

    pub fn skipped(&self) -> u64 {
        self.results.iter().filter(|r| r.status.is_skip()).count() as u64
    }

    /// Every target confirmed success; the precondition for deleting a handoff.
    pub fn all_targets_succeeded(&self) -> bool {
        self.job_error.is_none()
            && !self.results.is_empty()
            && self.results.iter().all(|r| r.status.is_success())
    }
}

/// Repair capability consumed by the scheduler.
#[async_trait]
pub trait SyncStrategy: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Bring one partition in line with its peers.
    async fn sync(&self, job: &SyncJob) -> SyncOutcome;
}

/// Collaborators shared by both strategies.
#[derive(Clone)]
pub struct RepairContext {
    pub store: Arc<dyn ObjectStore>,
    pub transport: Arc<dyn PeerTransport>,
    /// Upper bound for all requests to one remote device within a job.
    pub transfer_timeout: Duration,
}

impl RepairContext {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        transport: Arc<dyn PeerTransport>,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            transfer_timeout,
        }
    }
}

/// Run `fut` against `device`, failing with `TransferTimeout` past `limit`.
///
/// Dropping the future on timeout cancels the underlying transfer.
pub(crate) async fn with_device_timeout<T, F>(device: &Device, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TesseraError::TransferTimeout {
            device: device.to_string(),
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}
