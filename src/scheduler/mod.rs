//! Job scheduler shared by the replicator and the reconstructor.
//!
//! One pass enumerates every local partition of every bound policy, derives
//! a [`SyncJob`] from the current ring, and runs the jobs on a bounded pool
//! of tokio tasks. Partitions that failed in the previous pass go first.
//!
//! Two conditions end a pass early:
//!
//! - **Ring change**: ring versions are re-checked before every dispatch. On
//!   a change no further job starts, in-flight jobs finish, and the pass
//!   reports [`PassAbort::StaleRing`]. The next pass derives jobs from the
//!   new ring.
//! - **Lockup**: if no job completes within `lockup_timeout`, every worker is
//!   aborted and the pass reports [`PassAbort::Lockup`].

pub mod inventory;

use crate::config::SchedulerConfig;
use crate::observability;
use crate::repair::{SyncJob, SyncOutcome, SyncStrategy};
use crate::ring::RingHandle;
use crate::storage::ObjectStore;
use crate::types::{DeviceId, PartitionId, PassAbort, PassStatistics, PolicyId, StoragePolicy};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A storage policy, its ring and the strategy that repairs it.
#[derive(Clone)]
pub struct PolicyBinding {
    pub id: PolicyId,
    pub policy: StoragePolicy,
    pub ring: Arc<RingHandle>,
    pub strategy: Arc<dyn SyncStrategy>,
}

/// Restricts a pass to some devices or partitions.
#[derive(Debug, Clone, Default)]
pub struct PassFilter {
    pub devices: Option<HashSet<String>>,
    pub partitions: Option<HashSet<PartitionId>>,
}

impl PassFilter {
    fn allows_device(&self, name: &str) -> bool {
        self.devices.as_ref().map_or(true, |d| d.contains(name))
    }

    fn allows_partition(&self, partition: PartitionId) -> bool {
        self.partitions.as_ref().map_or(true, |p| p.contains(&partition))
    }
}

type JobKey = (PolicyId, DeviceId, PartitionId);

fn job_key(job: &SyncJob) -> JobKey {
    (job.policy_id, job.source_device.id, job.partition)
}

/// Dispatches one repair job per local partition per pass.
pub struct JobScheduler {
    name: &'static str,
    bindings: Vec<PolicyBinding>,
    store: Arc<dyn ObjectStore>,
    bind_ip: String,
    bind_port: u16,
    config: SchedulerConfig,
    /// Partitions that failed in the last pass; dispatched first next time.
    failed: Mutex<HashSet<JobKey>>,
}

impl JobScheduler {
    pub fn new(
        name: &'static str,
        bindings: Vec<PolicyBinding>,
        store: Arc<dyn ObjectStore>,
        bind_ip: impl Into<String>,
        bind_port: u16,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            name,
            bindings,
            store,
            bind_ip: bind_ip.into(),
            bind_port,
            config,
            failed: Mutex::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn bindings(&self) -> &[PolicyBinding] {
        &self.bindings
    }

    /// Re-read every ring file whose modification time moved.
    pub fn reload_rings(&self) {
        for binding in &self.bindings {
            match binding.ring.reload_if_changed() {
                Ok(true) => info!(policy = binding.id, version = binding.ring.version(), "Ring reloaded"),
                Ok(false) => {}
                Err(e) => warn!(policy = binding.id, error = %e, "Ring reload failed; keeping current ring"),
            }
        }
    }

    /// Build this pass's jobs from the current rings.
    fn collect_jobs(&self, filter: &PassFilter, stats: &mut PassStatistics) -> Vec<SyncJob> {
        let mut jobs = Vec::new();
        for binding in &self.bindings {
            let ring = binding.ring.current();
            let required = binding.policy.required_devices();
            if ring.replica_count() < required {
                warn!(
                    policy = binding.id,
                    replicas = ring.replica_count(),
                    required,
                    "Ring assigns too few devices per partition; skipping policy"
                );
                stats.failed += 1;
                continue;
            }
            let devices: Vec<_> = ring
                .local_devices(&self.bind_ip, self.bind_port)
                .into_iter()
                .filter(|d| filter.allows_device(&d.name))
                .collect();

            let scan = inventory::scan(self.store.as_ref(), &devices, binding.id);
            stats.skipped += scan.unmounted.len() as u64;
            stats.failed += scan.errors.len() as u64;

            for local in scan.partitions {
                if !filter.allows_partition(local.partition) {
                    continue;
                }
                if local.partition >= ring.partition_count() {
                    warn!(
                        policy = binding.id,
                        partition = local.partition,
                        "Local partition outside the ring"
                    );
                    continue;
                }
                let primaries: Vec<_> = ring
                    .devices_for(local.partition)
                    .into_iter()
                    .take(required)
                    .collect();
                let is_handoff = !primaries.iter().any(|d| d.id == local.device.id);
                let target_devices = primaries
                    .iter()
                    .filter(|d| d.id != local.device.id)
                    .cloned()
                    .collect();
                jobs.push(SyncJob {
                    partition: local.partition,
                    policy_id: binding.id,
                    policy: binding.policy,
                    source_device: local.device,
                    target_devices,
                    primaries,
                    is_handoff,
                    ring_version: ring.version(),
                });
            }
        }

        jobs.shuffle(&mut rand::thread_rng());
        let failed = self.failed.lock();
        let handoffs_first = self.config.handoffs_first;
        jobs.sort_by_key(|job| {
            (
                !failed.contains(&job_key(job)),
                handoffs_first && !job.is_handoff,
            )
        });
        jobs
    }

    fn ring_changed(&self, versions: &[u64]) -> Option<(PolicyId, u64, u64)> {
        self.bindings
            .iter()
            .zip(versions)
            .find_map(|(binding, expected)| match binding.ring.ensure_version(*expected) {
                Ok(()) => None,
                Err(_) => Some((binding.id, *expected, binding.ring.version())),
            })
    }

    /// Run one pass and return its statistics.
    pub async fn run_pass(&self, filter: &PassFilter) -> PassStatistics {
        let start = Instant::now();
        let mut stats = PassStatistics::default();

        self.reload_rings();
        let versions: Vec<u64> = self.bindings.iter().map(|b| b.ring.version()).collect();
        let jobs = self.collect_jobs(filter, &mut stats);
        let total_jobs = jobs.len();
        info!(daemon = self.name, jobs = total_jobs, "Starting pass");

        let mut pending = jobs.into_iter();
        let mut workers: JoinSet<(JobKey, Option<SyncOutcome>)> = JoinSet::new();
        let mut in_flight: HashSet<JobKey> = HashSet::new();
        let mut attempted: HashSet<JobKey> = HashSet::new();
        let mut failed_now: HashSet<JobKey> = HashSet::new();

        loop {
            while stats.aborted.is_none() && workers.len() < self.config.concurrency {
                self.reload_rings();
                if let Some((policy, expected, found)) = self.ring_changed(&versions) {
                    info!(
                        daemon = self.name,
                        policy,
                        expected,
                        found,
                        dispatched = stats.attempted,
                        remaining = pending.len(),
                        "Ring changed mid-pass; finishing in-flight jobs only"
                    );
                    stats.aborted = Some(PassAbort::StaleRing);
                    break;
                }
                let Some(job) = pending.next() else {
                    break;
                };

                let key = job_key(&job);
                stats.attempted += 1;
                attempted.insert(key);
                in_flight.insert(key);

                let strategy = self
                    .bindings
                    .iter()
                    .find(|b| b.id == job.policy_id)
                    .map(|b| b.strategy.clone());
                let job_timeout = self.config.job_timeout;
                workers.spawn(async move {
                    let Some(strategy) = strategy else {
                        return (key, None);
                    };
                    let outcome = tokio::time::timeout(job_timeout, strategy.sync(&job)).await.ok();
                    (key, outcome)
                });
            }

            if workers.is_empty() {
                break;
            }

            match tokio::time::timeout(self.config.lockup_timeout, workers.join_next()).await {
                Err(_) => {
                    error!(
                        daemon = self.name,
                        lockup_secs = self.config.lockup_timeout.as_secs(),
                        in_flight = in_flight.len(),
                        "Lockup detected: no job completed within the lockup window; aborting pass"
                    );
                    observability::record_lockup(self.name);
                    workers.abort_all();
                    stats.failed += in_flight.len() as u64;
                    stats.aborted = Some(PassAbort::Lockup);
                    break;
                }
                Ok(None) => break,
                Ok(Some(Ok((key, Some(outcome))))) => {
                    in_flight.remove(&key);
                    if outcome.failed() > 0 {
                        failed_now.insert(key);
                    }
                    merge(&mut stats, &outcome);
                }
                Ok(Some(Ok((key, None)))) => {
                    in_flight.remove(&key);
                    warn!(
                        daemon = self.name,
                        policy = key.0,
                        device = key.1,
                        partition = key.2,
                        timeout_secs = self.config.job_timeout.as_secs(),
                        "Job timed out"
                    );
                    stats.failed += 1;
                    failed_now.insert(key);
                }
                Ok(Some(Err(e))) => {
                    error!(daemon = self.name, error = %e, "Job task failed");
                    stats.failed += 1;
                }
            }
        }

        // Jobs that never reported (panicked or aborted) are retried first.
        failed_now.extend(in_flight.drain());
        {
            let mut failed = self.failed.lock();
            failed.retain(|key| !attempted.contains(key));
            failed.extend(failed_now);
        }

        stats.elapsed = start.elapsed();
        log_summary(self.name, &stats, total_jobs);
        observability::record_pass(self.name, &stats);
        stats
    }
}

fn merge(stats: &mut PassStatistics, outcome: &SyncOutcome) {
    stats.succeeded += outcome.succeeded();
    stats.failed += outcome.failed();
    stats.skipped += outcome.skipped();
    stats.bytes_transferred += outcome.bytes_transferred;
    stats.suffixes_synced += outcome.suffixes_synced;
    stats.fragments_rebuilt += outcome.fragments_rebuilt;
    stats.quarantined += outcome.quarantined;
    stats.handoffs_deleted += u64::from(outcome.handoff_deleted);
    debug!(
        partition = outcome.partition,
        policy = outcome.policy_id,
        handoff = outcome.is_handoff,
        succeeded = outcome.succeeded(),
        failed = outcome.failed(),
        bytes = outcome.bytes_transferred,
        "Job finished"
    );
}

/// Structured end-of-pass summary.
pub fn log_summary(daemon: &'static str, stats: &PassStatistics, planned: usize) {
    info!(
        daemon,
        planned,
        attempted = stats.attempted,
        succeeded = stats.succeeded,
        failed = stats.failed,
        skipped = stats.skipped,
        quarantined = stats.quarantined,
        suffixes_synced = stats.suffixes_synced,
        fragments_rebuilt = stats.fragments_rebuilt,
        handoffs_deleted = stats.handoffs_deleted,
        bytes = stats.bytes_transferred,
        bytes_per_sec = stats.bytes_per_sec(),
        elapsed_ms = stats.elapsed.as_millis() as u64,
        aborted = ?stats.aborted,
        "Pass complete"
    );
}
