//! Ring construction.
//!
//! Assignment is deterministic: the same devices in the same order always
//! produce the same ring. Each replica slot prefers a failure domain not yet
//! used by the partition, then the device furthest below its weight share.

use super::Ring;
use crate::error::{Result, TesseraError};
use crate::types::{Device, DeviceId};
use std::collections::HashSet;

/// Builds a [`Ring`] from a device list.
#[derive(Debug, Clone)]
pub struct RingBuilder {
    partition_power: u32,
    replica_count: usize,
    version: u64,
    devices: Vec<Device>,
}

impl RingBuilder {
    pub fn new(partition_power: u32, replica_count: usize) -> Self {
        Self {
            partition_power,
            replica_count,
            version: 1,
            devices: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Add a device; ids are assigned in insertion order.
    pub fn add_device(
        &mut self,
        name: impl Into<String>,
        ip: impl Into<String>,
        port: u16,
        weight: f64,
        region: u32,
        zone: u32,
    ) -> DeviceId {
        let id = self.devices.len() as DeviceId;
        self.devices.push(Device {
            id,
            name: name.into(),
            ip: ip.into(),
            port,
            weight,
            region,
            zone,
        });
        id
    }

    /// Assign every partition and validate the result.
    pub fn build(&self) -> Result<Ring> {
        if self.partition_power > super::MAX_PARTITION_POWER {
            return Err(TesseraError::InvalidArgument(format!(
                "partition power {} too large",
                self.partition_power
            )));
        }
        let eligible: Vec<&Device> = self.devices.iter().filter(|d| d.weight > 0.0).collect();
        if eligible.len() < self.replica_count {
            return Err(TesseraError::InvalidArgument(format!(
                "Not enough devices: need {}, have {}",
                self.replica_count,
                eligible.len()
            )));
        }

        let partitions = 1usize << self.partition_power;
        let total_weight: f64 = eligible.iter().map(|d| d.weight).sum();
        let slots = (partitions * self.replica_count) as f64;
        let desired: Vec<f64> = eligible
            .iter()
            .map(|d| d.weight / total_weight * slots)
            .collect();
        let mut assigned = vec![0usize; eligible.len()];

        let mut assignments = Vec::with_capacity(partitions);
        for part in 0..partitions {
            let mut chosen: Vec<usize> = Vec::with_capacity(self.replica_count);
            let mut used_domains = HashSet::new();

            for _ in 0..self.replica_count {
                let pick = self
                    .pick(&eligible, &desired, &assigned, &chosen, &used_domains, part, true)
                    .or_else(|| {
                        self.pick(&eligible, &desired, &assigned, &chosen, &used_domains, part, false)
                    })
                    .ok_or_else(|| TesseraError::Internal("no device left to assign".into()))?;
                chosen.push(pick);
                used_domains.insert(eligible[pick].failure_domain());
                assigned[pick] += 1;
            }
            assignments.push(chosen.into_iter().map(|i| eligible[i].id).collect());
        }

        let devices = self.devices.iter().cloned().map(Some).collect();
        Ring::from_parts(
            self.version,
            self.replica_count,
            self.partition_power,
            devices,
            assignments,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn pick(
        &self,
        eligible: &[&Device],
        desired: &[f64],
        assigned: &[usize],
        chosen: &[usize],
        used_domains: &HashSet<(u32, u32)>,
        part: usize,
        new_domain_only: bool,
    ) -> Option<usize> {
        let n = eligible.len();
        // Rotate the scan start so ties spread across partitions.
        (0..n)
            .map(|offset| (part + offset) % n)
            .filter(|i| !chosen.contains(i))
            .filter(|i| !new_domain_only || !used_domains.contains(&eligible[*i].failure_domain()))
            .fold(None, |best: Option<(usize, f64)>, i| {
                let deficit = desired[i] - assigned[i] as f64;
                match best {
                    Some((_, d)) if d >= deficit => best,
                    _ => Some((i, deficit)),
                }
            })
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(zones: u32, per_zone: usize) -> RingBuilder {
        let mut b = RingBuilder::new(8, 3);
        for zone in 1..=zones {
            for disk in 0..per_zone {
                b.add_device(format!("sd{}", disk), format!("10.0.{}.1", zone), 6200, 100.0, 1, zone);
            }
        }
        b
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = builder(3, 2).build().unwrap();
        let b = builder(3, 2).build().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_replicas_in_distinct_zones() {
        let ring = builder(4, 2).build().unwrap();
        for part in 0..ring.partition_count() {
            let zones: HashSet<u32> = ring.devices_for(part).iter().map(|d| d.zone).collect();
            assert_eq!(zones.len(), 3, "partition {}", part);
        }
    }

    #[test]
    fn test_balanced_by_weight() {
        let ring = builder(3, 2).build().unwrap();
        let expected = (ring.partition_count() as usize * 3) / 6;
        for (_, count) in ring.assignment_counts() {
            assert!(count.abs_diff(expected) <= 2, "count {} vs {}", count, expected);
        }
    }

    #[test]
    fn test_underprovisioned_zones_allowed() {
        // Two zones, three replicas: one zone must hold two replicas.
        let ring = builder(2, 2).build().unwrap();
        for part in 0..ring.partition_count() {
            let ids: HashSet<DeviceId> = ring.devices_for(part).iter().map(|d| d.id).collect();
            assert_eq!(ids.len(), 3);
        }
    }

    #[test]
    fn test_not_enough_devices() {
        let mut b = RingBuilder::new(4, 3);
        b.add_device("sda", "10.0.0.1", 6200, 100.0, 1, 1);
        b.add_device("sdb", "10.0.0.2", 6200, 100.0, 1, 2);
        assert!(b.build().is_err());
    }

    #[test]
    fn test_zero_weight_device_unused() {
        let mut b = builder(3, 1);
        let drained = b.add_device("sdz", "10.0.9.1", 6200, 0.0, 1, 4);
        let ring = b.build().unwrap();
        for part in 0..ring.partition_count() {
            assert!(ring.devices_for(part).iter().all(|d| d.id != drained));
        }
    }
}
