//! Object auditor for Tessera.
//!
//! Walks every object on the local devices, recomputes its size and etag,
//! and quarantines anything that does not match its metadata or cannot be
//! read. A quarantined object is absent to the replicator and reconstructor,
//! which then restore it from other devices on their next pass.
//!
//! The sweep is throttled by files per second and bytes per second, logs
//! progress every `log_interval`, and never aborts on a single bad directory
//! or object.

use crate::config::AuditorConfig;
use crate::error::TesseraError;
use crate::observability;
use crate::storage::{ObjectStore, QuarantineReason, QuarantineRecord};
use crate::types::{ObjectPath, PassStatistics, PolicyId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Auditor event.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    /// Sweep started over these devices.
    SweepStarted { devices: usize },
    /// An object was moved to quarantine.
    Quarantined(QuarantineRecord),
    /// Sweep finished.
    SweepCompleted { stats: PassStatistics },
}

/// Result of auditing one object.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditResult {
    Healthy { bytes: u64 },
    Quarantined { bytes: u64 },
    /// The object disappeared between listing and reading.
    Vanished,
    Error(String),
}

/// Paces a sweep to the configured files/sec and bytes/sec.
struct Throttle {
    started: Instant,
    files_per_second: u64,
    bytes_per_second: u64,
}

impl Throttle {
    fn new(config: &AuditorConfig) -> Self {
        Self {
            started: Instant::now(),
            files_per_second: config.files_per_second,
            bytes_per_second: config.bytes_per_second,
        }
    }

    /// Delay needed so that `files` and `bytes` stay under the configured rates.
    fn delay(&self, files: u64, bytes: u64) -> Duration {
        let mut target = Duration::ZERO;
        if self.files_per_second > 0 {
            target = target.max(Duration::from_secs_f64(files as f64 / self.files_per_second as f64));
        }
        if self.bytes_per_second > 0 {
            target = target.max(Duration::from_secs_f64(bytes as f64 / self.bytes_per_second as f64));
        }
        target.saturating_sub(self.started.elapsed())
    }

    async fn pace(&self, files: u64, bytes: u64) {
        let delay = self.delay(files, bytes);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Verifies local objects against their metadata.
pub struct Auditor {
    store: Arc<dyn ObjectStore>,
    devices: Vec<String>,
    policies: Vec<PolicyId>,
    config: AuditorConfig,
    events: broadcast::Sender<AuditEvent>,
}

impl Auditor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        devices: Vec<String>,
        policies: Vec<PolicyId>,
        config: AuditorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(1000);
        Self {
            store,
            devices,
            policies,
            config,
            events,
        }
    }

    /// Subscribe to auditor events.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.events.subscribe()
    }

    /// Audit one object, quarantining it on mismatch or read failure.
    pub fn audit_object(&self, path: &ObjectPath) -> AuditResult {
        let (reason, bytes) = match self.store.read(path) {
            Ok(file) => {
                let bytes = file.data.len() as u64;
                match QuarantineReason::from_verification(&file.meta, &file.data) {
                    None => return AuditResult::Healthy { bytes },
                    Some(reason) => (reason, bytes),
                }
            }
            Err(TesseraError::NotFound(_)) => return AuditResult::Vanished,
            Err(e @ TesseraError::NotMounted(_)) => return AuditResult::Error(e.to_string()),
            Err(e) => (QuarantineReason::Unreadable(e.to_string()), 0),
        };

        match self.store.quarantine(path, reason) {
            Ok(record) => {
                let _ = self.events.send(AuditEvent::Quarantined(record));
                AuditResult::Quarantined { bytes }
            }
            Err(TesseraError::NotFound(_)) => AuditResult::Vanished,
            Err(e) => AuditResult::Error(e.to_string()),
        }
    }

    /// Run one full sweep over all devices and policies.
    pub async fn run_pass(&self) -> PassStatistics {
        let start = Instant::now();
        let mut stats = PassStatistics::default();
        let throttle = Throttle::new(&self.config);
        let mut last_report = Instant::now();
        let _ = self.events.send(AuditEvent::SweepStarted {
            devices: self.devices.len(),
        });

        for device in &self.devices {
            if !self.store.is_mounted(device) {
                warn!(device = %device, "Skipping unmounted device");
                stats.skipped += 1;
                continue;
            }
            for &policy in &self.policies {
                let objects = self.enumerate(device, policy, &mut stats);
                for path in objects {
                    stats.attempted += 1;
                    match self.audit_object(&path) {
                        AuditResult::Healthy { bytes } => {
                            stats.succeeded += 1;
                            stats.bytes_transferred += bytes;
                        }
                        AuditResult::Quarantined { bytes } => {
                            stats.quarantined += 1;
                            stats.bytes_transferred += bytes;
                        }
                        AuditResult::Vanished => {}
                        AuditResult::Error(e) => {
                            warn!(path = %path, error = %e, "Audit failed");
                            stats.failed += 1;
                        }
                    }

                    throttle.pace(stats.attempted, stats.bytes_transferred).await;
                    if last_report.elapsed() >= self.config.log_interval {
                        last_report = Instant::now();
                        let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);
                        info!(
                            device = %device,
                            files = stats.attempted,
                            quarantined = stats.quarantined,
                            errors = stats.failed,
                            files_per_sec = stats.attempted as f64 / elapsed,
                            bytes_per_sec = stats.bytes_transferred as f64 / elapsed,
                            "Audit progress"
                        );
                    }
                }
            }
        }

        stats.elapsed = start.elapsed();
        info!(
            files = stats.attempted,
            passed = stats.succeeded,
            quarantined = stats.quarantined,
            errors = stats.failed,
            skipped = stats.skipped,
            files_per_sec = stats.items_per_sec(),
            bytes_per_sec = stats.bytes_per_sec(),
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "Audit sweep complete"
        );
        observability::record_pass("auditor", &stats);
        let _ = self.events.send(AuditEvent::SweepCompleted {
            stats: stats.clone(),
        });
        stats
    }

    /// List every object path of a policy on a device, logging and skipping bad directories.
    fn enumerate(&self, device: &str, policy: PolicyId, stats: &mut PassStatistics) -> Vec<ObjectPath> {
        let mut paths = Vec::new();
        let partitions = match self.store.list_partitions(device, policy) {
            Ok(p) => p,
            Err(e) => {
                warn!(device, policy, error = %e, "Cannot list partitions");
                stats.failed += 1;
                return paths;
            }
        };
        for partition in partitions {
            let suffixes = match self.store.list_suffixes(device, policy, partition) {
                Ok(s) => s,
                Err(e) => {
                    warn!(device, policy, partition, error = %e, "Cannot list suffixes");
                    stats.failed += 1;
                    continue;
                }
            };
            for suffix in suffixes {
                match self.store.list_hashes(device, policy, partition, &suffix) {
                    Ok(hashes) => paths.extend(
                        hashes
                            .into_iter()
                            .map(|hash| ObjectPath::new(device, policy, partition, hash)),
                    ),
                    Err(e) => {
                        warn!(device, policy, partition, suffix = %suffix, error = %e, "Cannot list objects");
                        stats.failed += 1;
                    }
                }
            }
        }
        debug!(device, policy, objects = paths.len(), "Enumerated objects");
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{HashPathSalt, ObjectHash, ObjectMeta};
    use chrono::Utc;

    fn config() -> AuditorConfig {
        AuditorConfig {
            files_per_second: 0,
            bytes_per_second: 0,
            ..Default::default()
        }
    }

    fn put(store: &MemoryStore, name: &str) -> ObjectPath {
        let hash = ObjectHash::compute(&HashPathSalt::default(), "a", Some("c"), Some(name));
        let path = ObjectPath::new("sda", 0, 1, hash);
        let data = name.as_bytes().to_vec();
        store
            .atomic_write(&path, &ObjectMeta::for_data(name, Utc::now(), &data), &data)
            .unwrap();
        path
    }

    #[tokio::test]
    async fn test_sweep_quarantines_corrupt_and_unreadable() {
        let store = Arc::new(MemoryStore::with_devices(["sda"]));
        put(&store, "healthy");
        let corrupt = put(&store, "corrupt");
        let unreadable = put(&store, "unreadable");
        store.corrupt(&corrupt, b"CORRUPT".to_vec());
        store.make_unreadable(&unreadable);

        let auditor = Auditor::new(store.clone(), vec!["sda".into()], vec![0], config());
        let mut events = auditor.subscribe();
        let stats = auditor.run_pass().await;

        assert_eq!(stats.attempted, 3);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.quarantined, 2);
        assert_eq!(stats.failed, 0);
        assert!(store.read(&corrupt).is_err());
        assert_eq!(store.list_quarantined("sda").unwrap().len(), 2);

        let mut quarantined = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, AuditEvent::Quarantined(_)) {
                quarantined += 1;
            }
        }
        assert_eq!(quarantined, 2);
    }

    #[tokio::test]
    async fn test_unmounted_device_skipped() {
        let store = Arc::new(MemoryStore::with_devices(["sda", "sdb"]));
        put(&store, "obj");
        store.unmount("sdb");
        let auditor = Auditor::new(store, vec!["sda".into(), "sdb".into()], vec![0], config());
        let stats = auditor.run_pass().await;
        assert_eq!(stats.attempted, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn test_second_sweep_is_clean() {
        let store = Arc::new(MemoryStore::with_devices(["sda"]));
        let bad = put(&store, "bad");
        store.corrupt(&bad, Vec::new());
        let auditor = Auditor::new(store, vec!["sda".into()], vec![0], config());
        assert_eq!(auditor.run_pass().await.quarantined, 1);
        let second = auditor.run_pass().await;
        assert_eq!(second.quarantined, 0);
        assert_eq!(second.attempted, 0);
    }

    #[test]
    fn test_throttle_delay() {
        let throttle = Throttle {
            started: Instant::now(),
            files_per_second: 10,
            bytes_per_second: 0,
        };
        assert!(throttle.delay(20, 0) > Duration::from_millis(1500));
        assert_eq!(throttle.delay(0, 1_000_000), Duration::ZERO);

        let unlimited = Throttle {
            started: Instant::now(),
            files_per_second: 0,
            bytes_per_second: 0,
        };
        assert_eq!(unlimited.delay(1_000, 1_000_000), Duration::ZERO);
    }
}
