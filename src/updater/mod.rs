//! Async update queue.
//!
//! When an object write cannot update its container (or a container its
//! account) synchronously, the pending metadata change is persisted as an
//! [`AsyncUpdate`] in a durable on-disk [`AsyncQueue`]. The
//! [`UpdateSweeper`] periodically retries delivery to every target device
//! in the record's device list and removes a record only once all of them
//! acknowledged.
//!
//! A record is never silently dropped: after `max_attempts` sweeps it is
//! moved to the device's `async_failed` directory and reported.

mod http;
mod queue;

pub use http::HttpDelivery;
pub use queue::AsyncQueue;

use crate::config::UpdaterConfig;
use crate::observability;
use crate::types::{Device, DeviceId, PartitionId, PassStatistics};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The metadata record an update applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateTarget {
    Account { account: String },
    Container { account: String, container: String },
}

impl UpdateTarget {
    /// Request path below `/<device>/<partition>`.
    pub fn path(&self) -> String {
        match self {
            UpdateTarget::Account { account } => format!("/{}", account),
            UpdateTarget::Container { account, container } => format!("/{}/{}", account, container),
        }
    }
}

impl fmt::Display for UpdateTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOperation {
    Put,
    Delete,
}

/// A pending metadata update awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncUpdate {
    pub id: Uuid,
    pub target: UpdateTarget,
    /// Partition of the target in its own ring.
    pub partition: PartitionId,
    /// Devices that must acknowledge the update.
    pub device_list: Vec<Device>,
    pub operation: UpdateOperation,
    /// Headers sent with the update (object count, bytes used, timestamps).
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempt_count: u32,
    /// Devices that already acknowledged.
    #[serde(default)]
    pub successes: Vec<DeviceId>,
}

impl AsyncUpdate {
    pub fn new(
        target: UpdateTarget,
        partition: PartitionId,
        device_list: Vec<Device>,
        operation: UpdateOperation,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            partition,
            device_list,
            operation,
            payload: BTreeMap::new(),
            enqueued_at: Utc::now(),
            attempt_count: 0,
            successes: Vec::new(),
        }
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Target devices that have not acknowledged yet.
    pub fn outstanding(&self) -> impl Iterator<Item = &Device> {
        self.device_list
            .iter()
            .filter(move |d| !self.successes.contains(&d.id))
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding().next().is_none()
    }
}

/// Outcome of delivering an update to one device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryResult {
    Ack,
    /// The target answered but refused the update.
    Reject(String),
    /// The target could not be reached or is unmounted.
    Unreachable(String),
}

/// Sends an update to the node owning a target device.
#[async_trait]
pub trait MetadataDelivery: Send + Sync {
    async fn deliver(&self, device: &Device, update: &AsyncUpdate) -> DeliveryResult;
}

/// What happened to one queued record during a sweep.
#[derive(Debug, Clone, Default, PartialEq)]
struct RecordOutcome {
    delivered: bool,
    rejected: u64,
    unreachable: u64,
    dead_lettered: bool,
    error: Option<String>,
}

/// Periodically retries queued updates on the local devices.
pub struct UpdateSweeper {
    queue: AsyncQueue,
    delivery: Arc<dyn MetadataDelivery>,
    devices: Vec<String>,
    config: UpdaterConfig,
}

impl UpdateSweeper {
    pub fn new(
        queue: AsyncQueue,
        delivery: Arc<dyn MetadataDelivery>,
        devices: Vec<String>,
        config: UpdaterConfig,
    ) -> Self {
        Self {
            queue,
            delivery,
            devices,
            config,
        }
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.queue
    }

    /// Sweep every local device once.
    ///
    /// `succeeded` counts records fully delivered and removed. Records kept
    /// because of a rejection or a local error count as `failed`; records kept
    /// only because targets were unreachable count as `skipped`, as do
    /// unmounted local devices.
    pub async fn run_pass(&self) -> PassStatistics {
        let start = Instant::now();
        let mut stats = PassStatistics::default();

        for device in &self.devices {
            if !self.queue.is_mounted(device) {
                warn!(device = %device, "Skipping unmounted device");
                stats.skipped += 1;
                continue;
            }
            self.sweep_device(device, &mut stats).await;
        }

        stats.elapsed = start.elapsed();
        info!(
            records = stats.attempted,
            delivered = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            dead_lettered = stats.dead_lettered,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "Async update sweep complete"
        );
        observability::record_pass("updater", &stats);
        stats
    }

    async fn sweep_device(&self, device: &str, stats: &mut PassStatistics) {
        let paths = match self.queue.pending(device) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(device, error = %e, "Cannot list async pending records");
                stats.failed += 1;
                return;
            }
        };
        debug!(device, records = paths.len(), "Sweeping async pending records");

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for path in paths {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let queue = self.queue.clone();
            let delivery = self.delivery.clone();
            let device = device.to_string();
            let node_timeout = self.config.node_timeout;
            let max_attempts = self.config.max_attempts;
            tasks.spawn(async move {
                let outcome =
                    process_record(&queue, delivery.as_ref(), &device, path, node_timeout, max_attempts)
                        .await;
                drop(permit);
                outcome
            });
        }

        while let Some(joined) = tasks.join_next().await {
            stats.attempted += 1;
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => RecordOutcome {
                    error: Some(format!("task failed: {}", e)),
                    ..Default::default()
                },
            };
            if outcome.dead_lettered {
                stats.dead_lettered += 1;
            }
            if outcome.delivered {
                stats.succeeded += 1;
            } else if outcome.rejected > 0 || outcome.error.is_some() || outcome.dead_lettered {
                stats.failed += 1;
            } else if outcome.unreachable > 0 {
                stats.skipped += 1;
            }
        }
    }
}

async fn process_record(
    queue: &AsyncQueue,
    delivery: &dyn MetadataDelivery,
    device: &str,
    path: PathBuf,
    node_timeout: Duration,
    max_attempts: u32,
) -> RecordOutcome {
    let mut outcome = RecordOutcome::default();
    let mut update = match queue.load(&path) {
        Ok(update) => update,
        Err(crate::error::TesseraError::NotFound(_)) => return outcome,
        Err(e) => {
            warn!(device, path = %path.display(), error = %e, "Unreadable async update");
            if let Err(e) = queue.set_aside(device, &path) {
                warn!(device, path = %path.display(), error = %e, "Cannot set aside async update");
            }
            outcome.error = Some(e.to_string());
            return outcome;
        }
    };

    let targets: Vec<Device> = update.outstanding().cloned().collect();
    for target in targets {
        let result = match tokio::time::timeout(node_timeout, delivery.deliver(&target, &update)).await {
            Ok(result) => result,
            Err(_) => DeliveryResult::Unreachable(format!(
                "timed out after {}ms",
                node_timeout.as_millis()
            )),
        };
        match result {
            DeliveryResult::Ack => {
                debug!(id = %update.id, device = %target, "Async update acknowledged");
                update.successes.push(target.id);
            }
            DeliveryResult::Reject(reason) => {
                warn!(id = %update.id, target = %update.target, device = %target, reason = %reason, "Async update rejected");
                outcome.rejected += 1;
            }
            DeliveryResult::Unreachable(reason) => {
                debug!(id = %update.id, device = %target, reason = %reason, "Async update target unreachable");
                outcome.unreachable += 1;
            }
        }
    }

    if update.is_complete() {
        match queue.complete(&path) {
            Ok(()) => outcome.delivered = true,
            Err(e) => outcome.error = Some(e.to_string()),
        }
        return outcome;
    }

    update.attempt_count += 1;
    let saved = if update.attempt_count >= max_attempts {
        queue.dead_letter(device, &path, &update).map(|_| {
            outcome.dead_lettered = true;
        })
    } else {
        queue.update(device, &path, &update)
    };
    if let Err(e) = saved {
        warn!(device, id = %update.id, error = %e, "Cannot persist async update state");
        outcome.error = Some(e.to_string());
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Scripted delivery: per device id, a result to return (default Ack).
    #[derive(Default)]
    struct ScriptedDelivery {
        results: Mutex<HashMap<DeviceId, DeliveryResult>>,
        calls: Mutex<Vec<DeviceId>>,
    }

    impl ScriptedDelivery {
        fn set(&self, device: DeviceId, result: DeliveryResult) {
            self.results.lock().insert(device, result);
        }
    }

    #[async_trait]
    impl MetadataDelivery for ScriptedDelivery {
        async fn deliver(&self, device: &Device, _update: &AsyncUpdate) -> DeliveryResult {
            self.calls.lock().push(device.id);
            self.results
                .lock()
                .get(&device.id)
                .cloned()
                .unwrap_or(DeliveryResult::Ack)
        }
    }

    fn device(id: DeviceId) -> Device {
        Device {
            id,
            name: format!("sd{}", id),
            ip: format!("10.0.0.{}", id),
            port: 6201,
            weight: 1.0,
            region: 1,
            zone: id,
        }
    }

    fn setup(max_attempts: u32) -> (TempDir, Arc<ScriptedDelivery>, UpdateSweeper) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sda")).unwrap();
        let delivery = Arc::new(ScriptedDelivery::default());
        let config = UpdaterConfig {
            max_attempts,
            ..Default::default()
        };
        let sweeper = UpdateSweeper::new(
            AsyncQueue::new(dir.path(), false),
            delivery.clone(),
            vec!["sda".into()],
            config,
        );
        (dir, delivery, sweeper)
    }

    fn container_update() -> AsyncUpdate {
        AsyncUpdate::new(
            UpdateTarget::Container {
                account: "AUTH_test".into(),
                container: "c".into(),
            },
            7,
            vec![device(1), device(2), device(3)],
            UpdateOperation::Put,
        )
    }

    #[tokio::test]
    async fn test_all_acks_remove_record() {
        let (_dir, _delivery, sweeper) = setup(10);
        sweeper.queue().enqueue("sda", &container_update()).unwrap();
        let stats = sweeper.run_pass().await;
        assert_eq!(stats.attempted, 1);
        assert_eq!(stats.succeeded, 1);
        assert!(sweeper.queue().pending("sda").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_ack_keeps_record_and_skips_acked_devices() {
        let (_dir, delivery, sweeper) = setup(10);
        delivery.set(2, DeliveryResult::Unreachable("connection refused".into()));
        let path = sweeper.queue().enqueue("sda", &container_update()).unwrap();

        let stats = sweeper.run_pass().await;
        assert_eq!(stats.succeeded, 0);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed, 0);
        let stored = sweeper.queue().load(&path).unwrap();
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.successes, vec![1, 3]);

        delivery.calls.lock().clear();
        delivery.set(2, DeliveryResult::Ack);
        let stats = sweeper.run_pass().await;
        assert_eq!(stats.succeeded, 1);
        assert_eq!(*delivery.calls.lock(), vec![2]);
        assert!(sweeper.queue().pending("sda").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reject_counts_as_failure() {
        let (_dir, delivery, sweeper) = setup(10);
        delivery.set(3, DeliveryResult::Reject("409 Conflict".into()));
        sweeper.queue().enqueue("sda", &container_update()).unwrap();
        let stats = sweeper.run_pass().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(sweeper.queue().pending("sda").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts() {
        let (_dir, delivery, sweeper) = setup(3);
        delivery.set(1, DeliveryResult::Reject("500".into()));
        let update = container_update();
        sweeper.queue().enqueue("sda", &update).unwrap();

        for _ in 0..2 {
            assert_eq!(sweeper.run_pass().await.dead_lettered, 0);
        }
        let stats = sweeper.run_pass().await;
        assert_eq!(stats.dead_lettered, 1);
        assert!(sweeper.queue().pending("sda").unwrap().is_empty());

        let failed = sweeper.queue().dead_letters("sda").unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, update.id);
        assert_eq!(failed[0].attempt_count, 3);
    }

    #[tokio::test]
    async fn test_unmounted_device_skipped() {
        let (_dir, _delivery, sweeper) = setup(10);
        let sweeper = UpdateSweeper::new(
            sweeper.queue.clone(),
            sweeper.delivery.clone(),
            vec!["sda".into(), "sdz".into()],
            sweeper.config.clone(),
        );
        let stats = sweeper.run_pass().await;
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.attempted, 0);
    }

    #[tokio::test]
    async fn test_corrupt_record_set_aside() {
        let (dir, _delivery, sweeper) = setup(10);
        let pending = dir.path().join("sda/async_pending/abc");
        std::fs::create_dir_all(&pending).unwrap();
        std::fs::write(pending.join("garbage"), b"{not json").unwrap();

        let stats = sweeper.run_pass().await;
        assert_eq!(stats.failed, 1);
        assert!(sweeper.queue().pending("sda").unwrap().is_empty());
        assert!(dir.path().join("sda/async_failed/garbage.corrupt").exists());
    }
}
