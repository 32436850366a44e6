//! Fragment reconstruction for erasure-coded policies.
//!
//! A primary owns the fragment index equal to its position in the
//! partition's device list. For every object whose local archive is missing,
//! stale or corrupt, fragments are fetched from the other primaries and the
//! local one is regenerated. Nothing is written unless at least
//! `data_fragments` valid fragments went into the rebuild.
//!
//! A primary also looks after its partners, the primaries on either side of
//! it in the device list. When a partner lacks an object held locally, the
//! partner's fragment is rebuilt here and pushed to it, so a device that
//! lost the whole partition gets its archives back.
//!
//! An archive of another index found on a primary is handed to its owner
//! before the local fragment is rebuilt over it.
//!
//! A handoff holding erasure-coded archives pushes each archive to the
//! primary at the archive's fragment index, then removes the partition once
//! every push has landed.

use super::{
    with_device_timeout, RepairContext, SyncJob, SyncOutcome, SyncStrategy, SyncTarget,
    TargetStatus,
};
use crate::erasure::ErasureCoder;
use crate::error::{Result, TesseraError};
use crate::storage::{differing_suffixes, suffix_digests, QuarantineReason, SuffixDigests};
use crate::transport::PushAck;
use crate::types::{Device, ObjectFile, ObjectHash, ObjectMeta, ObjectPath, ObjectSummary, Suffix};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Rebuilds fragment archives from the fragments held by other primaries.
pub struct FragmentRebuildSync {
    ctx: RepairContext,
}

/// An object whose fragment must be regenerated.
#[derive(Debug, Clone)]
struct RebuildTarget {
    hash: ObjectHash,
    timestamp: DateTime<Utc>,
}

/// A regenerated archive, ready to be written or pushed.
struct Rebuilt {
    meta: ObjectMeta,
    data: Vec<u8>,
    fetched_bytes: u64,
    inputs: usize,
}

/// Indexes of the primaries on either side of `own`.
fn partner_indexes(own: usize, count: usize) -> BTreeSet<usize> {
    [(own + 1) % count, (own + count - 1) % count]
        .into_iter()
        .filter(|&i| i != own)
        .collect()
}

impl FragmentRebuildSync {
    pub fn new(ctx: RepairContext) -> Self {
        Self { ctx }
    }

    async fn sync_primary(&self, job: &SyncJob, frag_index: usize, outcome: &mut SyncOutcome) -> Result<()> {
        let config = job.policy.erasure_config().ok_or_else(|| {
            TesseraError::InvalidArgument(format!("policy {} is not erasure coded", job.policy_id))
        })?;
        let coder = ErasureCoder::new(config)?;
        let store = self.ctx.store.as_ref();
        let local = suffix_digests(store, &job.source_device.name, job.policy_id, job.partition, None)?;

        // Digest exchange with every other primary, each under its own timeout.
        let limit = self.ctx.transfer_timeout;
        let responses = join_all(job.target_devices.iter().map(|peer| {
            with_device_timeout(
                peer,
                limit,
                self.ctx
                    .transport
                    .suffix_hashes(peer, job.policy_id, job.partition, None),
            )
        }))
        .await;

        let mut reachable: Vec<(&Device, SuffixDigests)> = Vec::new();
        for (peer, response) in job.target_devices.iter().zip(responses) {
            match response {
                Ok(digests) => {
                    outcome.record(SyncTarget::Device(peer.id), TargetStatus::InSync);
                    reachable.push((peer, digests));
                }
                Err(e) => {
                    warn!(partition = job.partition, peer = %peer, error = %e, "Peer digest request failed");
                    outcome.record(SyncTarget::Device(peer.id), TargetStatus::from_error(&e));
                }
            }
        }

        let displaced = self.displace_foreign_archives(job, frag_index, outcome).await?;

        // Suffixes a peer holds that we lack or hold differently.
        let mut suspect: BTreeMap<Suffix, Vec<&Device>> = BTreeMap::new();
        for (peer, digests) in &reachable {
            for suffix in differing_suffixes(digests, &local) {
                suspect.entry(suffix).or_default().push(*peer);
            }
        }
        // Digests only cover timestamps, so displaced objects are added by hand.
        for hash in &displaced {
            let peers = suspect.entry(hash.suffix()).or_default();
            for (peer, _) in &reachable {
                if !peers.iter().any(|p| p.id == peer.id) {
                    peers.push(*peer);
                }
            }
        }

        for (suffix, peers) in suspect {
            let targets = self.rebuild_targets(job, &suffix, &peers, &displaced).await?;
            if targets.is_empty() {
                continue;
            }
            outcome.suffixes_synced += 1;
            for target in targets {
                let status = self.rebuild_local(job, &coder, frag_index, &target, outcome).await;
                outcome.record(
                    SyncTarget::Fragment {
                        hash: target.hash,
                        index: Some(frag_index),
                    },
                    status,
                );
            }
        }

        self.sync_partners(job, &coder, frag_index, &reachable, outcome).await
    }

    /// Hand local archives of another index to their owners.
    ///
    /// Archives with no usable index are quarantined. Returns the hashes
    /// whose local fragment must be rebuilt regardless of digests.
    async fn displace_foreign_archives(
        &self,
        job: &SyncJob,
        frag_index: usize,
        outcome: &mut SyncOutcome,
    ) -> Result<BTreeSet<ObjectHash>> {
        let store = self.ctx.store.as_ref();
        let device = &job.source_device.name;
        let limit = self.ctx.transfer_timeout;
        let mut displaced = BTreeSet::new();

        for suffix in store.list_suffixes(device, job.policy_id, job.partition)? {
            for summary in store.list_objects(device, job.policy_id, job.partition, &suffix)? {
                let path = ObjectPath::new(device.as_str(), job.policy_id, job.partition, summary.hash.clone());
                match summary.fragment_index {
                    Some(index) if index == frag_index => {}
                    Some(index) if index < job.primaries.len() => {
                        let owner = &job.primaries[index];
                        let pushed = with_device_timeout(
                            owner,
                            limit,
                            self.push_archives(owner, std::slice::from_ref(&path)),
                        )
                        .await;
                        let status = match pushed {
                            Ok(0) => TargetStatus::InSync,
                            Ok(bytes) => TargetStatus::Synced { bytes },
                            Err(e) => {
                                warn!(path = %path, owner = %owner, error = %e, "Foreign archive push failed");
                                TargetStatus::from_error(&e)
                            }
                        };
                        if status.is_success() {
                            info!(path = %path, fragment_index = index, owner = %owner, "Handed foreign archive to its owner");
                            displaced.insert(summary.hash.clone());
                        }
                        outcome.record(
                            SyncTarget::Fragment {
                                hash: summary.hash,
                                index: Some(index),
                            },
                            status,
                        );
                    }
                    _ => {
                        warn!(path = %path, "Archive without a valid fragment index");
                        self.quarantine_local(
                            &path,
                            QuarantineReason::Unreadable("archive has no valid fragment index".into()),
                        );
                        displaced.insert(summary.hash);
                    }
                }
            }
        }
        Ok(displaced)
    }

    /// Objects of `suffix` whose local fragment is missing, stale, corrupt
    /// or displaced.
    async fn rebuild_targets(
        &self,
        job: &SyncJob,
        suffix: &Suffix,
        peers: &[&Device],
        displaced: &BTreeSet<ObjectHash>,
    ) -> Result<Vec<RebuildTarget>> {
        let limit = self.ctx.transfer_timeout;
        let listings = join_all(peers.iter().map(|peer| {
            with_device_timeout(
                peer,
                limit,
                self.ctx
                    .transport
                    .list_suffix(peer, job.policy_id, job.partition, suffix),
            )
        }))
        .await;

        let mut newest: BTreeMap<ObjectHash, DateTime<Utc>> = BTreeMap::new();
        for (peer, listing) in peers.iter().zip(listings) {
            match listing {
                Ok(objects) => {
                    for ObjectSummary { hash, timestamp, .. } in objects {
                        let entry = newest.entry(hash).or_insert(timestamp);
                        if timestamp > *entry {
                            *entry = timestamp;
                        }
                    }
                }
                Err(e) => debug!(peer = %peer, suffix = %suffix, error = %e, "Suffix listing failed"),
            }
        }

        let store = self.ctx.store.as_ref();
        let device = &job.source_device.name;
        let mut targets = Vec::new();
        for (hash, timestamp) in newest {
            let path = ObjectPath::new(device.as_str(), job.policy_id, job.partition, hash.clone());
            let needs_rebuild = match store.read(&path) {
                Ok(_) if displaced.contains(&hash) => true,
                Ok(file) if file.meta.timestamp >= timestamp => {
                    match QuarantineReason::from_verification(&file.meta, &file.data) {
                        Some(reason) => {
                            self.quarantine_local(&path, reason);
                            true
                        }
                        None => false,
                    }
                }
                Ok(_) | Err(TesseraError::NotFound(_)) => true,
                Err(e @ TesseraError::NotMounted(_)) => return Err(e),
                Err(e) => {
                    self.quarantine_local(&path, QuarantineReason::Unreadable(e.to_string()));
                    true
                }
            };
            if needs_rebuild {
                targets.push(RebuildTarget { hash, timestamp });
            }
        }
        Ok(targets)
    }

    fn quarantine_local(&self, path: &ObjectPath, reason: QuarantineReason) {
        if let Err(e) = self.ctx.store.quarantine(path, reason) {
            warn!(path = %path, error = %e, "Failed to quarantine local fragment");
        }
    }

    /// Regenerate fragment `wanted` of one object.
    ///
    /// Inputs are fetched from every other primary except the one owning
    /// `wanted`; `seed` is a local archive used alongside them.
    async fn reconstruct(
        &self,
        job: &SyncJob,
        coder: &ErasureCoder,
        wanted: usize,
        target: &RebuildTarget,
        seed: Option<ObjectFile>,
    ) -> std::result::Result<Rebuilt, TargetStatus> {
        let config = *coder.config();
        let path = ObjectPath::new(
            job.source_device.name.as_str(),
            job.policy_id,
            job.partition,
            target.hash.clone(),
        );
        let owner = job.primaries.get(wanted).map(|d| d.id);
        let sources: Vec<&Device> = job
            .target_devices
            .iter()
            .filter(|d| Some(d.id) != owner)
            .collect();

        let limit = self.ctx.transfer_timeout;
        let fetched = join_all(sources.iter().map(|peer| {
            with_device_timeout(peer, limit, self.ctx.transport.fetch(peer, &path))
        }))
        .await;

        let mut fetched_bytes = 0u64;
        let mut files: Vec<ObjectFile> = seed.into_iter().collect();
        for (peer, response) in sources.iter().zip(fetched) {
            match response {
                Ok(Some(file)) => {
                    fetched_bytes += file.data.len() as u64;
                    files.push(file);
                }
                Ok(None) => {}
                Err(e) => debug!(peer = %peer, path = %path, error = %e, "Fragment fetch failed"),
            }
        }

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; config.total_shards()];
        let mut object_size: Option<u64> = None;
        let mut name = None;
        for file in files {
            match usable_fragment(&file, target.timestamp, wanted, object_size, coder) {
                Ok(index) => {
                    if shards[index].is_none() {
                        object_size = file.meta.object_size;
                        name.get_or_insert_with(|| file.meta.name.clone());
                        shards[index] = Some(file.data);
                    }
                }
                Err(reason) => debug!(path = %file.path, reason, "Discarding fragment"),
            }
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < config.data_shards {
            warn!(
                partition = job.partition,
                hash = %target.hash,
                fragment_index = wanted,
                available,
                required = config.data_shards,
                "Not enough fragments to rebuild"
            );
            return Err(TargetStatus::InsufficientFragments {
                available,
                required: config.data_shards,
            });
        }

        let (Some(object_size), Some(name)) = (object_size, name) else {
            return Err(TargetStatus::Failed("fragment metadata incomplete".into()));
        };
        let data = coder
            .reconstruct_fragment(&mut shards, wanted)
            .map_err(|e| TargetStatus::from_error(&e))?;
        let meta = ObjectMeta::for_fragment(name, target.timestamp, &data, wanted, object_size);
        Ok(Rebuilt {
            meta,
            data,
            fetched_bytes,
            inputs: available,
        })
    }

    /// Regenerate our own fragment of one object and commit it locally.
    async fn rebuild_local(
        &self,
        job: &SyncJob,
        coder: &ErasureCoder,
        frag_index: usize,
        target: &RebuildTarget,
        outcome: &mut SyncOutcome,
    ) -> TargetStatus {
        let rebuilt = match self.reconstruct(job, coder, frag_index, target, None).await {
            Ok(rebuilt) => rebuilt,
            Err(status) => return status,
        };
        let path = ObjectPath::new(
            job.source_device.name.as_str(),
            job.policy_id,
            job.partition,
            target.hash.clone(),
        );
        if let Err(e) = self.ctx.store.atomic_write(&path, &rebuilt.meta, &rebuilt.data) {
            return TargetStatus::from_error(&e);
        }

        outcome.fragments_rebuilt += 1;
        info!(
            partition = job.partition,
            hash = %target.hash,
            fragment_index = frag_index,
            inputs = rebuilt.inputs,
            "Rebuilt fragment archive"
        );
        TargetStatus::Synced {
            bytes: rebuilt.fetched_bytes,
        }
    }

    /// Rebuild fragments for partners that lack objects we hold.
    async fn sync_partners(
        &self,
        job: &SyncJob,
        coder: &ErasureCoder,
        frag_index: usize,
        reachable: &[(&Device, SuffixDigests)],
        outcome: &mut SyncOutcome,
    ) -> Result<()> {
        let store = self.ctx.store.as_ref();
        let local = suffix_digests(store, &job.source_device.name, job.policy_id, job.partition, None)?;
        let partners = partner_indexes(frag_index, job.primaries.len());

        for (peer, digests) in reachable {
            let Some(peer_index) = job.primaries.iter().position(|d| d.id == peer.id) else {
                continue;
            };
            if !partners.contains(&peer_index) {
                continue;
            }
            for suffix in differing_suffixes(&local, digests) {
                let targets = self.partner_targets(job, frag_index, peer, &suffix).await?;
                if targets.is_empty() {
                    continue;
                }
                outcome.suffixes_synced += 1;
                for (target, seed) in targets {
                    let status = self
                        .rebuild_for_partner(job, coder, peer, peer_index, &target, seed, outcome)
                        .await;
                    outcome.record(
                        SyncTarget::Fragment {
                            hash: target.hash,
                            index: Some(peer_index),
                        },
                        status,
                    );
                }
            }
        }
        Ok(())
    }

    /// Objects of `suffix` we hold at our own index that `peer` lacks or
    /// holds at an older timestamp, each with its local archive.
    async fn partner_targets(
        &self,
        job: &SyncJob,
        frag_index: usize,
        peer: &Device,
        suffix: &Suffix,
    ) -> Result<Vec<(RebuildTarget, ObjectFile)>> {
        let listing = with_device_timeout(
            peer,
            self.ctx.transfer_timeout,
            self.ctx
                .transport
                .list_suffix(peer, job.policy_id, job.partition, suffix),
        )
        .await;
        let remote: BTreeMap<ObjectHash, DateTime<Utc>> = match listing {
            Ok(objects) => objects.into_iter().map(|s| (s.hash, s.timestamp)).collect(),
            Err(e) => {
                debug!(peer = %peer, suffix = %suffix, error = %e, "Partner suffix listing failed");
                return Ok(Vec::new());
            }
        };

        let store = self.ctx.store.as_ref();
        let device = &job.source_device.name;
        let mut targets = Vec::new();
        for summary in store.list_objects(device, job.policy_id, job.partition, suffix)? {
            if summary.fragment_index != Some(frag_index) {
                continue;
            }
            if remote.get(&summary.hash).is_some_and(|ts| *ts >= summary.timestamp) {
                continue;
            }
            let path = ObjectPath::new(device.as_str(), job.policy_id, job.partition, summary.hash.clone());
            match store.read(&path) {
                Ok(seed) => targets.push((
                    RebuildTarget {
                        hash: summary.hash,
                        timestamp: summary.timestamp,
                    },
                    seed,
                )),
                Err(e) => debug!(path = %path, error = %e, "Local archive unreadable"),
            }
        }
        Ok(targets)
    }

    /// Regenerate a partner's fragment and push it to the partner.
    #[allow(clippy::too_many_arguments)]
    async fn rebuild_for_partner(
        &self,
        job: &SyncJob,
        coder: &ErasureCoder,
        peer: &Device,
        peer_index: usize,
        target: &RebuildTarget,
        seed: ObjectFile,
        outcome: &mut SyncOutcome,
    ) -> TargetStatus {
        let Rebuilt {
            meta,
            data,
            fetched_bytes,
            inputs,
        } = match self.reconstruct(job, coder, peer_index, target, Some(seed)).await {
            Ok(rebuilt) => rebuilt,
            Err(status) => return status,
        };
        let pushed_bytes = data.len() as u64;
        let file = ObjectFile {
            path: ObjectPath::new(peer.name.as_str(), job.policy_id, job.partition, target.hash.clone()),
            meta,
            data,
        };

        let pushed = with_device_timeout(peer, self.ctx.transfer_timeout, self.ctx.transport.push(peer, file)).await;
        match pushed {
            Ok(PushAck::Accepted) => {
                outcome.fragments_rebuilt += 1;
                info!(
                    partition = job.partition,
                    hash = %target.hash,
                    fragment_index = peer_index,
                    partner = %peer,
                    inputs,
                    "Rebuilt fragment archive for partner"
                );
                TargetStatus::Synced {
                    bytes: fetched_bytes + pushed_bytes,
                }
            }
            Ok(PushAck::Superseded) => TargetStatus::InSync,
            Ok(PushAck::Rejected(reason)) => TargetStatus::Failed(format!("{} rejected rebuilt fragment: {}", peer, reason)),
            Err(e) => {
                warn!(partner = %peer, hash = %target.hash, error = %e, "Partner fragment push failed");
                TargetStatus::from_error(&e)
            }
        }
    }

    /// Push every local archive to the primary at its fragment index.
    async fn revert_handoff(&self, job: &SyncJob, outcome: &mut SyncOutcome) -> Result<()> {
        let store = self.ctx.store.as_ref();
        let device = &job.source_device.name;
        let mut by_index: BTreeMap<usize, Vec<ObjectPath>> = BTreeMap::new();
        let mut misplaced = BTreeSet::new();

        for suffix in store.list_suffixes(device, job.policy_id, job.partition)? {
            for summary in store.list_objects(device, job.policy_id, job.partition, &suffix)? {
                let path = ObjectPath::new(device.as_str(), job.policy_id, job.partition, summary.hash);
                match summary.fragment_index {
                    Some(index) if index < job.primaries.len() => {
                        by_index.entry(index).or_default().push(path)
                    }
                    _ => {
                        misplaced.insert(path.hash.clone());
                    }
                }
            }
        }

        for hash in misplaced {
            warn!(partition = job.partition, hash = %hash, "Archive without a valid fragment index");
            outcome.record(
                SyncTarget::Fragment { hash, index: None },
                TargetStatus::Failed("archive has no valid fragment index".into()),
            );
        }

        let limit = self.ctx.transfer_timeout;
        let pushes = join_all(by_index.iter().map(|(index, paths)| {
            let primary = &job.primaries[*index];
            with_device_timeout(primary, limit, self.push_archives(primary, paths))
        }))
        .await;

        for ((index, _), result) in by_index.iter().zip(pushes) {
            let primary = &job.primaries[*index];
            let status = match result {
                Ok(0) => TargetStatus::InSync,
                Ok(bytes) => TargetStatus::Synced { bytes },
                Err(e) => {
                    warn!(partition = job.partition, target = %primary, error = %e, "Archive push failed");
                    TargetStatus::from_error(&e)
                }
            };
            outcome.record(SyncTarget::Device(primary.id), status);
        }
        Ok(())
    }

    async fn push_archives(&self, primary: &Device, paths: &[ObjectPath]) -> Result<u64> {
        let mut bytes = 0;
        for path in paths {
            let file = match self.ctx.store.read(path) {
                Ok(file) => file,
                Err(TesseraError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let size = file.data.len() as u64;
            match self.ctx.transport.push(primary, file).await? {
                PushAck::Accepted => bytes += size,
                PushAck::Superseded => {}
                PushAck::Rejected(reason) => {
                    return Err(TesseraError::Internal(format!("{} rejected {}: {}", primary, path, reason)))
                }
            }
        }
        Ok(bytes)
    }
}

/// Validate a fetched fragment; returns its fragment index.
fn usable_fragment(
    file: &ObjectFile,
    timestamp: DateTime<Utc>,
    wanted: usize,
    expected_size: Option<u64>,
    coder: &ErasureCoder,
) -> std::result::Result<usize, &'static str> {
    if file.meta.timestamp != timestamp {
        return Err("timestamp differs");
    }
    let index = file.meta.fragment_index.ok_or("not a fragment archive")?;
    if index >= coder.config().total_shards() || index == wanted {
        return Err("fragment index out of range");
    }
    let object_size = file.meta.object_size.ok_or("missing object size")?;
    if expected_size.is_some_and(|s| s != object_size) {
        return Err("object size disagrees with other fragments");
    }
    if file.meta.verify(&file.data).is_err() {
        return Err("digest mismatch");
    }
    if file.data.len() != coder.shard_size(object_size as usize) {
        return Err("fragment length disagrees with object size");
    }
    Ok(index)
}

#[async_trait]
impl SyncStrategy for FragmentRebuildSync {
    fn name(&self) -> &'static str {
        "reconstructor"
    }

    async fn sync(&self, job: &SyncJob) -> SyncOutcome {
        let mut outcome = SyncOutcome::for_job(job);

        let result = match (job.is_handoff, job.fragment_index()) {
            (false, Some(index)) => self.sync_primary(job, index, &mut outcome).await,
            _ => self.revert_handoff(job, &mut outcome).await,
        };
        if let Err(e) = result {
            warn!(partition = job.partition, device = %job.source_device, error = %e, "Reconstruction job failed");
            outcome.job_error = Some(e.to_string());
            return outcome;
        }

        if job.is_handoff && outcome.all_targets_succeeded() {
            match self
                .ctx
                .store
                .delete_partition(&job.source_device.name, job.policy_id, job.partition)
            {
                Ok(()) => {
                    outcome.handoff_deleted = true;
                    info!(partition = job.partition, device = %job.source_device, "Handoff archives reverted");
                }
                Err(e) => warn!(partition = job.partition, error = %e, "Failed to remove handoff partition"),
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, ObjectStore};
    use crate::transport::LoopbackTransport;
    use crate::types::{ErasureScheme, HashPathSalt, StoragePolicy};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        stores: Vec<Arc<MemoryStore>>,
        devices: Vec<Device>,
        transport: Arc<LoopbackTransport>,
    }

    const POLICY: StoragePolicy = StoragePolicy::ErasureCoded {
        data_fragments: 4,
        parity_fragments: 2,
        scheme: ErasureScheme::ReedSolomon,
    };

    fn fixture() -> Fixture {
        let transport = Arc::new(LoopbackTransport::new());
        let mut stores = Vec::new();
        let mut devices = Vec::new();
        for i in 0..6u32 {
            let store = Arc::new(MemoryStore::with_devices(["sda"]));
            let ip = format!("10.0.1.{}", i + 1);
            transport.register_node(ip.clone(), 6200, store.clone());
            devices.push(Device {
                id: i,
                name: "sda".into(),
                ip,
                port: 6200,
                weight: 1.0,
                region: 1,
                zone: i,
            });
            stores.push(store);
        }
        Fixture {
            stores,
            devices,
            transport,
        }
    }

    fn strategy(f: &Fixture, local: usize) -> FragmentRebuildSync {
        FragmentRebuildSync::new(RepairContext::new(
            f.stores[local].clone(),
            f.transport.clone(),
            Duration::from_secs(5),
        ))
    }

    fn job(f: &Fixture, local: usize) -> SyncJob {
        SyncJob {
            partition: 9,
            policy_id: 1,
            policy: POLICY,
            source_device: f.devices[local].clone(),
            target_devices: f
                .devices
                .iter()
                .filter(|d| d.id as usize != local)
                .cloned()
                .collect(),
            primaries: f.devices.clone(),
            is_handoff: false,
            ring_version: 1,
        }
    }

    /// Write the archives of one object, each to the primary at its index.
    fn write_object(f: &Fixture, name: &str, data: &[u8]) -> (ObjectPath, Vec<Vec<u8>>) {
        let coder = ErasureCoder::new(POLICY.erasure_config().unwrap()).unwrap();
        let hash = ObjectHash::compute(&HashPathSalt::default(), "a", Some("c"), Some(name));
        let path = ObjectPath::new("sda", 1, 9, hash);
        let mut fragments = Vec::new();
        for (i, (meta, fragment)) in coder.encode_archives(name, Utc::now(), data).unwrap().into_iter().enumerate() {
            f.stores[i].atomic_write(&path, &meta, &fragment).unwrap();
            fragments.push(fragment);
        }
        (path, fragments)
    }

    #[tokio::test]
    async fn test_rebuilds_missing_fragment() {
        let f = fixture();
        let (path, fragments) = write_object(&f, "obj", b"erasure coded payload for rebuild");
        f.stores[2].delete_partition("sda", 1, 9).unwrap();

        let outcome = strategy(&f, 2).sync(&job(&f, 2)).await;
        assert_eq!(outcome.fragments_rebuilt, 1);
        assert_eq!(outcome.failed(), 0);
        let rebuilt = f.stores[2].read(&path).unwrap();
        assert_eq!(rebuilt.data, fragments[2]);
        assert_eq!(rebuilt.meta.fragment_index, Some(2));
    }

    #[tokio::test]
    async fn test_corrupt_peer_fragment_is_excluded() {
        let f = fixture();
        let (path, fragments) = write_object(&f, "obj", b"some bytes worth protecting");
        f.stores[0].delete_partition("sda", 1, 9).unwrap();
        f.stores[1].corrupt(&path, vec![0; fragments[1].len()]);

        let outcome = strategy(&f, 0).sync(&job(&f, 0)).await;
        assert_eq!(outcome.fragments_rebuilt, 1);
        assert_eq!(f.stores[0].read(&path).unwrap().data, fragments[0]);
    }

    #[tokio::test]
    async fn test_insufficient_fragments_writes_nothing() {
        let f = fixture();
        let (path, _) = write_object(&f, "obj", b"only three survive");
        f.stores[0].delete_partition("sda", 1, 9).unwrap();
        f.transport.remove_node(&f.devices[4].ip, 6200);
        f.transport.remove_node(&f.devices[5].ip, 6200);
        let writes = f.stores[0].write_count();

        let outcome = strategy(&f, 0).sync(&job(&f, 0)).await;
        assert!(outcome.results.iter().any(|r| matches!(
            r.status,
            TargetStatus::InsufficientFragments { available: 3, required: 4 }
        )));
        assert_eq!(f.stores[0].write_count(), writes);
        assert!(f.stores[0].read(&path).is_err());
    }

    #[tokio::test]
    async fn test_in_sync_partition_writes_nothing() {
        let f = fixture();
        write_object(&f, "obj", b"nothing to do");
        let writes = f.stores[3].write_count();
        let outcome = strategy(&f, 3).sync(&job(&f, 3)).await;
        assert_eq!(outcome.fragments_rebuilt, 0);
        assert_eq!(outcome.failed(), 0);
        assert_eq!(f.stores[3].write_count(), writes);
    }

    #[tokio::test]
    async fn test_handoff_reverts_archives_to_owners() {
        let f = fixture();
        let handoff_store = Arc::new(MemoryStore::with_devices(["sdh"]));
        let coder = ErasureCoder::new(POLICY.erasure_config().unwrap()).unwrap();
        let hash = ObjectHash::compute(&HashPathSalt::default(), "a", Some("c"), Some("h"));
        let path = ObjectPath::new("sdh", 1, 9, hash);
        let archives = coder.encode_archives("h", Utc::now(), b"handoff data").unwrap();
        let (meta, fragment) = &archives[4];
        handoff_store.atomic_write(&path, meta, fragment).unwrap();

        let source = Device {
            id: 99,
            name: "sdh".into(),
            ip: "10.0.9.9".into(),
            port: 6200,
            weight: 1.0,
            region: 1,
            zone: 9,
        };
        let job = SyncJob {
            source_device: source,
            target_devices: f.devices.clone(),
            is_handoff: true,
            ..job(&f, 0)
        };
        let strategy = FragmentRebuildSync::new(RepairContext::new(
            handoff_store.clone(),
            f.transport.clone(),
            Duration::from_secs(5),
        ));

        let outcome = strategy.sync(&job).await;
        assert!(outcome.handoff_deleted);
        assert_eq!(handoff_store.object_count("sdh"), 0);
        let landed = f.stores[4].read(&path.on_device("sda")).unwrap();
        assert_eq!(landed.meta.fragment_index, Some(4));
    }

    #[tokio::test]
    async fn test_partner_without_partition_gets_its_fragment() {
        let f = fixture();
        let (path, fragments) = write_object(&f, "obj", b"a partner lost the whole partition");
        f.stores[1].delete_partition("sda", 1, 9).unwrap();

        let outcome = strategy(&f, 0).sync(&job(&f, 0)).await;
        assert_eq!(outcome.fragments_rebuilt, 1);
        assert_eq!(outcome.failed(), 0);
        assert!(outcome.results.iter().any(|r| r.target
            == SyncTarget::Fragment {
                hash: path.hash.clone(),
                index: Some(1)
            }
            && r.status.is_success()));
        let pushed = f.stores[1].read(&path).unwrap();
        assert_eq!(pushed.data, fragments[1]);
        assert_eq!(pushed.meta.fragment_index, Some(1));
        // local archive plus four fetched inputs, then the pushed result
        assert_eq!(outcome.bytes_transferred, 5 * fragments[0].len() as u64);
    }

    #[tokio::test]
    async fn test_only_partners_are_rebuilt_for() {
        let f = fixture();
        let (path, fragments) = write_object(&f, "obj", b"three is not next to zero");
        f.stores[3].delete_partition("sda", 1, 9).unwrap();

        let outcome = strategy(&f, 0).sync(&job(&f, 0)).await;
        assert_eq!(outcome.fragments_rebuilt, 0);
        assert!(f.stores[3].read(&path).is_err());

        let outcome = strategy(&f, 2).sync(&job(&f, 2)).await;
        assert_eq!(outcome.fragments_rebuilt, 1);
        assert_eq!(f.stores[3].read(&path).unwrap().data, fragments[3]);
    }

    #[tokio::test]
    async fn test_foreign_archive_goes_to_owner_before_rebuild() {
        let f = fixture();
        let (path, fragments) = write_object(&f, "obj", b"archive landed on the wrong primary");
        let foreign = f.stores[3].read(&path).unwrap();
        f.stores[2].atomic_write(&path, &foreign.meta, &foreign.data).unwrap();
        f.stores[3].delete_partition("sda", 1, 9).unwrap();

        let outcome = strategy(&f, 2).sync(&job(&f, 2)).await;
        assert_eq!(outcome.fragments_rebuilt, 1);
        assert_eq!(outcome.failed(), 0);
        let own = f.stores[2].read(&path).unwrap();
        assert_eq!(own.meta.fragment_index, Some(2));
        assert_eq!(own.data, fragments[2]);
        let owner = f.stores[3].read(&path).unwrap();
        assert_eq!(owner.meta.fragment_index, Some(3));
        assert_eq!(owner.data, fragments[3]);
    }

    #[tokio::test]
    async fn test_local_rebuild_counts_fetched_bytes_once() {
        let f = fixture();
        let (_, fragments) = write_object(&f, "obj", b"count every byte exactly one time");
        f.stores[2].delete_partition("sda", 1, 9).unwrap();

        let outcome = strategy(&f, 2).sync(&job(&f, 2)).await;
        assert_eq!(outcome.fragments_rebuilt, 1);
        assert_eq!(outcome.bytes_transferred, 5 * fragments[2].len() as u64);
    }

    #[tokio::test]
    async fn test_handoff_archive_without_index_keeps_partition() {
        let f = fixture();
        let handoff_store = Arc::new(MemoryStore::with_devices(["sdh"]));
        let hash = ObjectHash::compute(&HashPathSalt::default(), "a", Some("c"), Some("plain"));
        let path = ObjectPath::new("sdh", 1, 9, hash.clone());
        handoff_store
            .atomic_write(&path, &ObjectMeta::for_data("plain", Utc::now(), b"whole"), b"whole")
            .unwrap();

        let job = SyncJob {
            source_device: Device {
                id: 99,
                name: "sdh".into(),
                ip: "10.0.9.9".into(),
                port: 6200,
                weight: 1.0,
                region: 1,
                zone: 9,
            },
            target_devices: f.devices.clone(),
            is_handoff: true,
            ..job(&f, 0)
        };
        let strategy = FragmentRebuildSync::new(RepairContext::new(
            handoff_store.clone(),
            f.transport.clone(),
            Duration::from_secs(5),
        ));

        let outcome = strategy.sync(&job).await;
        assert!(!outcome.handoff_deleted);
        assert_eq!(handoff_store.object_count("sdh"), 1);
        assert!(outcome.results.iter().any(|r| r.target
            == SyncTarget::Fragment { hash: hash.clone(), index: None }
            && matches!(r.status, TargetStatus::Failed(_))));
    }

    #[test]
    fn test_partner_indexes_wrap_around() {
        assert_eq!(partner_indexes(0, 6), [1, 5].into_iter().collect());
        assert_eq!(partner_indexes(3, 6), [2, 4].into_iter().collect());
        assert_eq!(partner_indexes(1, 2), [0].into_iter().collect());
        assert!(partner_indexes(0, 1).is_empty());
    }
}
