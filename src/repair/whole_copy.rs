//! Whole-file replication for replicated policies.

use super::{
    with_device_timeout, RepairContext, SyncJob, SyncOutcome, SyncStrategy, SyncTarget,
    TargetStatus,
};
use crate::error::{Result, TesseraError};
use crate::storage::{differing_suffixes, suffix_digests, QuarantineReason, SuffixDigests};
use crate::transport::PushAck;
use crate::types::{Device, ObjectPath, Suffix};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Pushes whole files for every suffix whose digest differs on the peer.
pub struct WholeCopySync {
    ctx: RepairContext,
}

/// Per-target progress, shared so a timed-out target still reports what it moved.
#[derive(Default)]
struct TargetProgress {
    bytes: AtomicU64,
    suffixes: AtomicU64,
    quarantined: AtomicU64,
}

impl WholeCopySync {
    pub fn new(ctx: RepairContext) -> Self {
        Self { ctx }
    }

    async fn sync_target(
        &self,
        job: &SyncJob,
        local: &SuffixDigests,
        target: &Device,
        progress: &TargetProgress,
    ) -> Result<TargetStatus> {
        let transport = &self.ctx.transport;
        let remote = transport
            .suffix_hashes(target, job.policy_id, job.partition, None)
            .await?;
        let differing = differing_suffixes(local, &remote);
        if differing.is_empty() {
            return Ok(TargetStatus::InSync);
        }

        debug!(
            partition = job.partition,
            target = %target,
            suffixes = differing.len(),
            "Suffixes differ"
        );

        let mut bytes = 0u64;
        for suffix in &differing {
            bytes += self.push_suffix(job, suffix, target, progress).await?;
            progress.suffixes.fetch_add(1, Ordering::Relaxed);
        }

        // Ask the peer to rehash what we pushed; a newer remote version keeps them apart.
        let refreshed = transport
            .suffix_hashes(target, job.policy_id, job.partition, Some(&differing))
            .await?;
        let local_now = suffix_digests(
            self.ctx.store.as_ref(),
            &job.source_device.name,
            job.policy_id,
            job.partition,
            Some(&differing),
        )?;
        let still_differing = differing_suffixes(&local_now, &refreshed);
        if !still_differing.is_empty() {
            debug!(
                partition = job.partition,
                target = %target,
                suffixes = still_differing.len(),
                "Peer holds newer data for some suffixes"
            );
        }

        Ok(TargetStatus::Synced { bytes })
    }

    async fn push_suffix(
        &self,
        job: &SyncJob,
        suffix: &Suffix,
        target: &Device,
        progress: &TargetProgress,
    ) -> Result<u64> {
        let store = self.ctx.store.as_ref();
        let device = &job.source_device.name;
        let mut bytes = 0u64;

        for summary in store.list_objects(device, job.policy_id, job.partition, suffix)? {
            let path = ObjectPath::new(device.as_str(), job.policy_id, job.partition, summary.hash);
            let file = match store.read(&path) {
                Ok(file) => file,
                // quarantined by a sibling target or the auditor
                Err(TesseraError::NotFound(_)) => continue,
                Err(e @ TesseraError::NotMounted(_)) => return Err(e),
                Err(e) => {
                    self.quarantine(&path, QuarantineReason::Unreadable(e.to_string()), progress);
                    continue;
                }
            };
            if let Some(reason) = QuarantineReason::from_verification(&file.meta, &file.data) {
                self.quarantine(&path, reason, progress);
                continue;
            }

            let size = file.data.len() as u64;
            match self.ctx.transport.push(target, file).await? {
                PushAck::Accepted => {
                    bytes += size;
                    progress.bytes.fetch_add(size, Ordering::Relaxed);
                }
                PushAck::Superseded => {}
                PushAck::Rejected(reason) => {
                    return Err(TesseraError::Internal(format!(
                        "{} rejected {}: {}",
                        target, path, reason
                    )));
                }
            }
        }
        Ok(bytes)
    }

    fn quarantine(&self, path: &ObjectPath, reason: QuarantineReason, progress: &TargetProgress) {
        match self.ctx.store.quarantine(path, reason) {
            Ok(_) => {
                progress.quarantined.fetch_add(1, Ordering::Relaxed);
            }
            Err(TesseraError::NotFound(_)) => {}
            Err(e) => warn!(path = %path, error = %e, "Failed to quarantine object"),
        }
    }
}

#[async_trait]
impl SyncStrategy for WholeCopySync {
    fn name(&self) -> &'static str {
        "replicator"
    }

    async fn sync(&self, job: &SyncJob) -> SyncOutcome {
        let mut outcome = SyncOutcome::for_job(job);

        let local = match suffix_digests(
            self.ctx.store.as_ref(),
            &job.source_device.name,
            job.policy_id,
            job.partition,
            None,
        ) {
            Ok(digests) => digests,
            Err(e) => {
                warn!(partition = job.partition, device = %job.source_device, error = %e, "Cannot hash local partition");
                outcome.job_error = Some(e.to_string());
                return outcome;
            }
        };

        let limit = self.ctx.transfer_timeout;
        let progress: Vec<TargetProgress> =
            job.target_devices.iter().map(|_| TargetProgress::default()).collect();
        let statuses = join_all(job.target_devices.iter().zip(&progress).map(|(target, p)| {
            let local = &local;
            async move {
                with_device_timeout(target, limit, self.sync_target(job, local, target, p)).await
            }
        }))
        .await;

        for ((target, status), p) in job.target_devices.iter().zip(statuses).zip(&progress) {
            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    warn!(
                        partition = job.partition,
                        target = %target,
                        error = %e,
                        "Target sync failed"
                    );
                    // bytes already committed on the peer still count as transferred
                    outcome.bytes_transferred += p.bytes.load(Ordering::Relaxed);
                    TargetStatus::from_error(&e)
                }
            };
            outcome.suffixes_synced += p.suffixes.load(Ordering::Relaxed);
            outcome.quarantined += p.quarantined.load(Ordering::Relaxed);
            outcome.record(SyncTarget::Device(target.id), status);
        }

        if job.is_handoff {
            if outcome.all_targets_succeeded() {
                match self.ctx.store.delete_partition(
                    &job.source_device.name,
                    job.policy_id,
                    job.partition,
                ) {
                    Ok(()) => {
                        outcome.handoff_deleted = true;
                        info!(
                            partition = job.partition,
                            device = %job.source_device,
                            "Handoff partition drained and removed"
                        );
                    }
                    Err(e) => warn!(partition = job.partition, error = %e, "Failed to remove handoff partition"),
                }
            } else {
                debug!(partition = job.partition, "Keeping handoff partition until every target succeeds");
            }
        }

        outcome
    }
}
