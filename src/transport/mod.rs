//! Peer transport between object servers.
//!
//! The engine only needs four requests from a peer: suffix digests of a
//! partition, the object listing of a suffix, pushing a whole file, and
//! fetching one. The wire format belongs to the transport implementation;
//! [`receive_push`] is the receiving side's commit contract.

use crate::error::{Result, TesseraError};
use crate::storage::{suffix_digests, ObjectStore, SuffixDigests};
use crate::types::{Device, ObjectFile, ObjectPath, ObjectSummary, PartitionId, PolicyId, Suffix};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Receiver's answer to a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushAck {
    /// The file was committed.
    Accepted,
    /// The receiver already holds this version or a newer one.
    Superseded,
    /// The file failed validation in transit.
    Rejected(String),
}

impl PushAck {
    /// Whether the receiver now holds this version or a newer one.
    pub fn is_ok(&self) -> bool {
        !matches!(self, PushAck::Rejected(_))
    }
}

/// Requests issued to a remote device.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Suffix digests of a remote partition, optionally restricted to `suffixes`.
    async fn suffix_hashes(
        &self,
        device: &Device,
        policy: PolicyId,
        partition: PartitionId,
        suffixes: Option<&[Suffix]>,
    ) -> Result<SuffixDigests>;

    /// Objects of a remote suffix.
    async fn list_suffix(
        &self,
        device: &Device,
        policy: PolicyId,
        partition: PartitionId,
        suffix: &Suffix,
    ) -> Result<Vec<ObjectSummary>>;

    /// Transfer a whole file to a remote device.
    async fn push(&self, device: &Device, file: ObjectFile) -> Result<PushAck>;

    /// Fetch a file from a remote device; `None` if it does not hold it.
    async fn fetch(&self, device: &Device, path: &ObjectPath) -> Result<Option<ObjectFile>>;
}

/// Commit a pushed file on the receiving side.
///
/// The etag is checked against the bytes received, an existing newer version
/// wins, and the write goes through [`ObjectStore::atomic_write`] so a
/// concurrent reader never sees a partial file.
pub fn receive_push(store: &dyn ObjectStore, file: &ObjectFile) -> Result<PushAck> {
    if let Err(reason) = file.meta.verify(&file.data) {
        warn!(path = %file.path, reason = %reason, "Rejected push");
        return Ok(PushAck::Rejected(reason));
    }

    match store.read(&file.path) {
        Ok(existing) if existing.meta.timestamp > file.meta.timestamp => {
            return Ok(PushAck::Superseded);
        }
        Ok(existing)
            if existing.meta.timestamp == file.meta.timestamp
                && existing.meta.fragment_index == file.meta.fragment_index
                && existing.meta.verify(&existing.data).is_ok() =>
        {
            return Ok(PushAck::Superseded);
        }
        Ok(_) | Err(TesseraError::NotFound(_)) | Err(TesseraError::Serialization(_)) => {}
        Err(e) => return Err(e),
    }

    store.atomic_write(&file.path, &file.meta, &file.data)?;
    Ok(PushAck::Accepted)
}

/// In-process transport that routes requests to registered node stores.
#[derive(Default)]
pub struct LoopbackTransport {
    nodes: RwLock<HashMap<(String, u16), Arc<dyn ObjectStore>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the store serving every device at `ip:port`.
    pub fn register_node(&self, ip: impl Into<String>, port: u16, store: Arc<dyn ObjectStore>) {
        self.nodes.write().insert((ip.into(), port), store);
    }

    /// Remove a node so requests to it fail as unreachable.
    pub fn remove_node(&self, ip: &str, port: u16) {
        self.nodes.write().remove(&(ip.to_string(), port));
    }

    fn store_for(&self, device: &Device) -> Result<Arc<dyn ObjectStore>> {
        self.nodes
            .read()
            .get(&(device.ip.clone(), device.port))
            .cloned()
            .ok_or_else(|| TesseraError::PeerUnreachable(device.to_string()))
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn suffix_hashes(
        &self,
        device: &Device,
        policy: PolicyId,
        partition: PartitionId,
        suffixes: Option<&[Suffix]>,
    ) -> Result<SuffixDigests> {
        let store = self.store_for(device)?;
        suffix_digests(store.as_ref(), &device.name, policy, partition, suffixes)
    }

    async fn list_suffix(
        &self,
        device: &Device,
        policy: PolicyId,
        partition: PartitionId,
        suffix: &Suffix,
    ) -> Result<Vec<ObjectSummary>> {
        let store = self.store_for(device)?;
        store.list_objects(&device.name, policy, partition, suffix)
    }

    async fn push(&self, device: &Device, mut file: ObjectFile) -> Result<PushAck> {
        let store = self.store_for(device)?;
        file.path = file.path.on_device(&device.name);
        let ack = receive_push(store.as_ref(), &file)?;
        debug!(device = %device, path = %file.path, ack = ?ack, "Push handled");
        Ok(ack)
    }

    async fn fetch(&self, device: &Device, path: &ObjectPath) -> Result<Option<ObjectFile>> {
        let store = self.store_for(device)?;
        match store.read(&path.on_device(&device.name)) {
            Ok(file) => Ok(Some(file)),
            Err(TesseraError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
