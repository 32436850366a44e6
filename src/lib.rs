//! Tessera - background consistency engine for ring-partitioned object storage.
//!
//! Tessera runs the daemons that keep a distributed object store healthy
//! without being on the client request path:
//!
//! - **Replicator**: keeps every replica of a replicated partition in sync
//!   by comparing per-suffix digests and pushing what differs.
//! - **Reconstructor**: rebuilds missing or corrupt erasure-coded fragments
//!   from any `data_fragments` surviving fragments.
//! - **Auditor**: verifies stored objects and quarantines corrupt ones.
//! - **Updater**: retries queued account/container metadata updates.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Daemon loop: Idle ─▶ RunningPass ─▶ CoolingDown ─▶ ...      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  JobScheduler │ Auditor │ UpdateSweeper                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  SyncStrategy: WholeCopySync | FragmentRebuildSync           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Ring (copy-on-write) │ ObjectStore │ PeerTransport          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use tessera::config::TesseraConfig;
//! use tessera::{Role, RunOptions};
//!
//! #[tokio::main]
//! async fn main() -> tessera::Result<()> {
//!     let config = TesseraConfig::development();
//!     let stats = tessera::run(config, RunOptions::once(Role::Replicator)).await?;
//!     println!("synced {} suffixes", stats.suffixes_synced);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod auditor;
pub mod cli;
pub mod daemon;
pub mod erasure;
pub mod observability;
pub mod repair;
pub mod ring;
pub mod scheduler;
pub mod shutdown;
pub mod storage;
pub mod transport;
pub mod updater;

// Re-exports
pub use error::{Result, TesseraError};
pub use types::*;

use auditor::Auditor;
use config::{PolicyConfig, TesseraConfig};
use daemon::{Daemon, Pass, SchedulerPass};
use repair::{FragmentRebuildSync, RepairContext, SyncStrategy, WholeCopySync};
use ring::RingHandle;
use scheduler::{JobScheduler, PassFilter, PolicyBinding};
use shutdown::{ShutdownCoordinator, SignalHandler};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use storage::{DiskStore, ObjectStore};
use tracing::{error, info, warn};
use transport::LoopbackTransport;
use updater::{AsyncQueue, HttpDelivery, UpdateSweeper};

/// Which daemon to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Replicator,
    Reconstructor,
    Auditor,
    Updater,
}

/// How to run a daemon.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub role: Role,
    pub once: bool,
    pub filter: PassFilter,
}

impl RunOptions {
    pub fn once(role: Role) -> Self {
        Self {
            role,
            once: true,
            filter: PassFilter::default(),
        }
    }

    pub fn forever(role: Role) -> Self {
        Self {
            once: false,
            ..Self::once(role)
        }
    }
}

/// The local node: its devices, rings and peer transport.
pub struct Node {
    config: TesseraConfig,
    store: Arc<DiskStore>,
    rings: Vec<(PolicyConfig, Arc<RingHandle>)>,
    transport: Arc<LoopbackTransport>,
}

impl Node {
    /// Load every policy's ring and set up the transport.
    ///
    /// Peers are reached through a [`LoopbackTransport`]: every node listed
    /// in the rings under this node's IP shares the local devices root.
    /// Devices on other hosts are reported unreachable.
    pub fn open(config: TesseraConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(DiskStore::new(
            config.storage.devices_root.clone(),
            config.storage.mount_check,
        ));

        let mut rings = Vec::with_capacity(config.policies.len());
        for policy in &config.policies {
            let handle = RingHandle::from_file(&policy.ring_path)?;
            let replicas = handle.current().replica_count();
            if replicas < policy.policy.required_devices() {
                return Err(TesseraError::Config(format!(
                    "policy {} needs {} devices per partition but ring {} assigns {}",
                    policy.name,
                    policy.policy.required_devices(),
                    policy.ring_path.display(),
                    replicas
                )));
            }
            info!(
                policy = policy.index,
                name = %policy.name,
                version = handle.version(),
                path = %policy.ring_path.display(),
                "Loaded ring"
            );
            rings.push((policy.clone(), Arc::new(handle)));
        }

        let transport = Arc::new(LoopbackTransport::new());
        let mut local_nodes = BTreeSet::new();
        let mut remote_nodes = BTreeSet::new();
        for (_, handle) in &rings {
            for device in handle.current().devices() {
                let node = (device.ip.clone(), device.port);
                if device.ip == config.node.bind_ip {
                    local_nodes.insert(node);
                } else {
                    remote_nodes.insert(node);
                }
            }
        }
        for (ip, port) in local_nodes {
            transport.register_node(ip, port, store.clone() as Arc<dyn ObjectStore>);
        }
        if !remote_nodes.is_empty() {
            warn!(
                remote_nodes = remote_nodes.len(),
                "Rings list nodes on other hosts; they are unreachable through the loopback transport"
            );
        }

        Ok(Self {
            config,
            store,
            rings,
            transport,
        })
    }

    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    /// Names of the devices this node serves in any ring.
    pub fn local_devices(&self) -> Vec<String> {
        let node = &self.config.node;
        let names: BTreeSet<String> = self
            .rings
            .iter()
            .flat_map(|(_, handle)| handle.current().local_devices(&node.bind_ip, node.bind_port))
            .map(|d| d.name)
            .collect();
        names.into_iter().collect()
    }

    fn scheduler(
        &self,
        name: &'static str,
        erasure_coded: bool,
        config: &config::SchedulerConfig,
    ) -> Result<JobScheduler> {
        let ctx = RepairContext::new(
            self.store.clone(),
            self.transport.clone(),
            config.transfer_timeout,
        );
        let strategy: Arc<dyn SyncStrategy> = if erasure_coded {
            Arc::new(FragmentRebuildSync::new(ctx))
        } else {
            Arc::new(WholeCopySync::new(ctx))
        };
        let bindings: Vec<PolicyBinding> = self
            .rings
            .iter()
            .filter(|(policy, _)| policy.policy.is_erasure_coded() == erasure_coded)
            .map(|(policy, ring)| PolicyBinding {
                id: policy.index,
                policy: policy.policy,
                ring: ring.clone(),
                strategy: strategy.clone(),
            })
            .collect();
        if bindings.is_empty() {
            return Err(TesseraError::Config(format!(
                "no {} storage policies configured for the {}",
                if erasure_coded { "erasure-coded" } else { "replicated" },
                name
            )));
        }
        Ok(JobScheduler::new(
            name,
            bindings,
            self.store.clone(),
            self.config.node.bind_ip.clone(),
            self.config.node.bind_port,
            config.clone(),
        ))
    }

    pub fn replicator(&self) -> Result<JobScheduler> {
        self.scheduler("replicator", false, &self.config.replicator)
    }

    pub fn reconstructor(&self) -> Result<JobScheduler> {
        self.scheduler("reconstructor", true, &self.config.reconstructor)
    }

    fn filtered_devices(&self, filter: &PassFilter) -> Vec<String> {
        self.local_devices()
            .into_iter()
            .filter(|d| filter.devices.as_ref().map_or(true, |set| set.contains(d)))
            .collect()
    }

    pub fn auditor(&self, filter: &PassFilter) -> Auditor {
        Auditor::new(
            self.store.clone(),
            self.filtered_devices(filter),
            self.rings.iter().map(|(policy, _)| policy.index).collect(),
            self.config.auditor.clone(),
        )
    }

    pub fn updater(&self, filter: &PassFilter) -> UpdateSweeper {
        let updater = &self.config.updater;
        UpdateSweeper::new(
            AsyncQueue::new(
                self.config.storage.devices_root.clone(),
                self.config.storage.mount_check,
            ),
            Arc::new(HttpDelivery::new(updater.node_timeout)),
            self.filtered_devices(filter),
            updater.clone(),
        )
    }
}

/// Run one daemon with the given configuration.
///
/// In run-once mode this returns the statistics of the single pass; in
/// daemon mode it returns the totals once a shutdown signal arrives.
pub async fn run(config: TesseraConfig, options: RunOptions) -> Result<PassStatistics> {
    observability::init_metrics(&config.observability)?;
    info!(node = %config.node.name, role = ?options.role, once = options.once, "Starting Tessera");

    let node = Node::open(config)?;
    let shutdown = ShutdownCoordinator::new();
    let config = node.config();

    let stats = match options.role {
        Role::Replicator => {
            let pass = SchedulerPass::new(node.replicator()?, options.filter);
            drive(pass, config.replicator.interval, options.once, shutdown).await
        }
        Role::Reconstructor => {
            let pass = SchedulerPass::new(node.reconstructor()?, options.filter);
            drive(pass, config.reconstructor.interval, options.once, shutdown).await
        }
        Role::Auditor => {
            let pass = node.auditor(&options.filter);
            drive(pass, config.auditor.interval, options.once, shutdown).await
        }
        Role::Updater => {
            let pass = node.updater(&options.filter);
            drive(pass, config.updater.interval, options.once, shutdown).await
        }
    };

    info!("Tessera shutdown complete");
    Ok(stats)
}

async fn drive<P: Pass>(
    pass: P,
    interval: Duration,
    once: bool,
    shutdown: ShutdownCoordinator,
) -> PassStatistics {
    let daemon = Daemon::new(pass, interval, shutdown.clone());
    if once {
        return daemon.run_once().await;
    }

    let handler = SignalHandler::new(shutdown);
    tokio::spawn(async move {
        if let Err(e) = handler.run().await {
            error!(error = %e, "Failed to install signal handlers");
        }
    });
    daemon.run_forever().await.totals
}
