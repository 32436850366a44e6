// Cluster simulation for integration tests
// One in-memory store per node, wired together through a loopback transport
// that can take nodes down or slow them.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tessera::config::SchedulerConfig;
use tessera::repair::{RepairContext, SyncStrategy};
use tessera::ring::{Ring, RingHandle};
use tessera::scheduler::{JobScheduler, PolicyBinding};
use tessera::storage::{suffix_digests, MemoryStore, ObjectStore, SuffixDigests};
use tessera::transport::{LoopbackTransport, PeerTransport, PushAck};
use tessera::{
    Device, DeviceId, ObjectFile, ObjectPath, ObjectSummary, PartitionId, PolicyId, StoragePolicy,
    Suffix, TesseraError,
};

/// Device name used on every simulated node.
pub const DEVICE: &str = "sdb1";
pub const PORT: u16 = 6200;

/// Loopback transport with injectable faults.
#[derive(Default)]
pub struct FaultyTransport {
    inner: LoopbackTransport,
    down: RwLock<HashSet<String>>,
    delays: RwLock<HashMap<String, Duration>>,
}

impl FaultyTransport {
    pub fn inner(&self) -> &LoopbackTransport {
        &self.inner
    }

    async fn check(&self, device: &Device) -> tessera::Result<()> {
        if self.down.read().contains(&device.ip) {
            return Err(TesseraError::PeerUnreachable(device.to_string()));
        }
        let delay = self.delays.read().get(&device.ip).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for FaultyTransport {
    async fn suffix_hashes(
        &self,
        device: &Device,
        policy: PolicyId,
        partition: PartitionId,
        suffixes: Option<&[Suffix]>,
    ) -> tessera::Result<SuffixDigests> {
        self.check(device).await?;
        self.inner.suffix_hashes(device, policy, partition, suffixes).await
    }

    async fn list_suffix(
        &self,
        device: &Device,
        policy: PolicyId,
        partition: PartitionId,
        suffix: &Suffix,
    ) -> tessera::Result<Vec<ObjectSummary>> {
        self.check(device).await?;
        self.inner.list_suffix(device, policy, partition, suffix).await
    }

    async fn push(&self, device: &Device, file: ObjectFile) -> tessera::Result<PushAck> {
        self.check(device).await?;
        self.inner.push(device, file).await
    }

    async fn fetch(&self, device: &Device, path: &ObjectPath) -> tessera::Result<Option<ObjectFile>> {
        self.check(device).await?;
        self.inner.fetch(device, path).await
    }
}

/// Simulated storage node with a single device.
pub struct SimNode {
    pub device: Device,
    pub store: Arc<MemoryStore>,
}

impl SimNode {
    pub fn path(&self, policy: PolicyId, partition: PartitionId, hash: tessera::ObjectHash) -> ObjectPath {
        ObjectPath::new(DEVICE, policy, partition, hash)
    }
}

/// A cluster of nodes, one zone each.
pub struct SimulatedCluster {
    pub nodes: Vec<SimNode>,
    pub transport: Arc<FaultyTransport>,
}

impl SimulatedCluster {
    pub fn new(node_count: usize) -> Self {
        let transport = Arc::new(FaultyTransport::default());
        let nodes = (0..node_count)
            .map(|i| {
                let store = Arc::new(MemoryStore::with_devices([DEVICE]));
                let ip = format!("10.0.0.{}", i + 1);
                transport.inner().register_node(ip.clone(), PORT, store.clone());
                SimNode {
                    device: Device {
                        id: i as DeviceId,
                        name: DEVICE.to_string(),
                        ip,
                        port: PORT,
                        weight: 100.0,
                        region: 1,
                        zone: i as u32 + 1,
                    },
                    store,
                }
            })
            .collect();
        Self { nodes, transport }
    }

    pub fn devices(&self) -> Vec<Device> {
        self.nodes.iter().map(|n| n.device.clone()).collect()
    }

    /// Build a ring whose partition `p` is assigned `assign(p)`.
    pub fn ring(
        &self,
        version: u64,
        replica_count: usize,
        partition_power: u32,
        assign: impl Fn(PartitionId) -> Vec<DeviceId>,
    ) -> Ring {
        let assignments: Vec<Vec<DeviceId>> = (0..1u32 << partition_power).map(assign).collect();
        let json = serde_json::json!({
            "version": version,
            "replica_count": replica_count,
            "partition_power": partition_power,
            "devices": self.devices().into_iter().map(Some).collect::<Vec<_>>(),
            "assignments": assignments,
        });
        Ring::load(&serde_json::to_vec(&json).unwrap()).unwrap()
    }

    /// Ring assigning every partition to the first `replica_count` nodes.
    pub fn full_ring(&self, version: u64, replica_count: usize, partition_power: u32) -> Ring {
        self.ring(version, replica_count, partition_power, |_| {
            (0..replica_count as DeviceId).collect()
        })
    }

    pub fn context(&self, node: usize, transfer_timeout: Duration) -> RepairContext {
        RepairContext::new(
            self.nodes[node].store.clone(),
            self.transport.clone(),
            transfer_timeout,
        )
    }

    /// Scheduler running on `node` for a single policy.
    pub fn scheduler(
        &self,
        node: usize,
        name: &'static str,
        policy_id: PolicyId,
        policy: StoragePolicy,
        ring: Arc<RingHandle>,
        strategy: Arc<dyn SyncStrategy>,
        config: SchedulerConfig,
    ) -> JobScheduler {
        let device = &self.nodes[node].device;
        JobScheduler::new(
            name,
            vec![PolicyBinding {
                id: policy_id,
                policy,
                ring,
                strategy,
            }],
            self.nodes[node].store.clone(),
            device.ip.clone(),
            device.port,
            config,
        )
    }

    pub fn fail_node(&self, node: usize) {
        self.transport.down.write().insert(self.nodes[node].device.ip.clone());
    }

    pub fn heal_node(&self, node: usize) {
        self.transport.down.write().remove(&self.nodes[node].device.ip);
    }

    pub fn slow_node(&self, node: usize, delay: Duration) {
        self.transport
            .delays
            .write()
            .insert(self.nodes[node].device.ip.clone(), delay);
    }

    pub fn digests(&self, node: usize, policy: PolicyId, partition: PartitionId) -> SuffixDigests {
        suffix_digests(self.nodes[node].store.as_ref(), DEVICE, policy, partition, None).unwrap()
    }

    pub fn store(&self, node: usize) -> &MemoryStore {
        &self.nodes[node].store
    }

    pub fn read(&self, node: usize, path: &ObjectPath) -> tessera::Result<ObjectFile> {
        self.nodes[node].store.read(path)
    }
}

/// Scheduler settings suited to tests: small timeouts, fixed concurrency.
pub fn test_scheduler_config(concurrency: usize) -> SchedulerConfig {
    SchedulerConfig {
        concurrency,
        interval: Duration::from_secs(1),
        job_timeout: Duration::from_secs(30),
        lockup_timeout: Duration::from_secs(60),
        transfer_timeout: Duration::from_secs(5),
        handoffs_first: false,
    }
}
