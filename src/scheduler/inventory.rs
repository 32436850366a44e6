//! Local partition inventory.

use crate::storage::ObjectStore;
use crate::types::{Device, PartitionId, PolicyId};
use tracing::{debug, warn};

/// A partition found on a local device.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalPartition {
    pub device: Device,
    pub policy: PolicyId,
    pub partition: PartitionId,
}

/// Result of walking the local devices of one policy.
#[derive(Debug, Default)]
pub struct InventoryScan {
    pub partitions: Vec<LocalPartition>,
    /// Devices skipped because they are not mounted.
    pub unmounted: Vec<Device>,
    /// Devices whose partitions could not be listed.
    pub errors: Vec<(Device, String)>,
}

/// Enumerate partitions of `policy` on each of `devices`.
pub fn scan(store: &dyn ObjectStore, devices: &[Device], policy: PolicyId) -> InventoryScan {
    let mut scan = InventoryScan::default();
    for device in devices {
        if !store.is_mounted(&device.name) {
            warn!(device = %device, "Skipping unmounted device");
            scan.unmounted.push(device.clone());
            continue;
        }
        match store.list_partitions(&device.name, policy) {
            Ok(partitions) => {
                debug!(device = %device, policy, count = partitions.len(), "Listed local partitions");
                scan.partitions
                    .extend(partitions.into_iter().map(|partition| LocalPartition {
                        device: device.clone(),
                        policy,
                        partition,
                    }));
            }
            Err(e) => {
                warn!(device = %device, policy, error = %e, "Cannot list partitions");
                scan.errors.push((device.clone(), e.to_string()));
            }
        }
    }
    scan
}
