//! Erasure coding using Reed-Solomon.
//!
//! An object of an erasure-coded policy is cut into `data_shards` equal
//! fragments (the last one zero-padded) plus `parity_shards` parity
//! fragments. Fragment `i` is stored as the fragment archive on the device at
//! position `i` of the partition's device list. Any `data_shards` fragments
//! are enough to regenerate any other one.

use crate::error::{Result, TesseraError};
use crate::types::{ErasureCodingConfig, ObjectMeta};
use chrono::{DateTime, Utc};
use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::debug;

/// Encoder/decoder for one erasure coding configuration.
pub struct ErasureCoder {
    config: ErasureCodingConfig,
    encoder: ReedSolomon,
}

impl ErasureCoder {
    /// Create a new erasure coder with the given configuration.
    pub fn new(config: ErasureCodingConfig) -> Result<Self> {
        let encoder = ReedSolomon::new(config.data_shards, config.parity_shards)
            .map_err(|e| TesseraError::Internal(format!("Failed to create encoder: {}", e)))?;

        Ok(Self { config, encoder })
    }

    pub fn config(&self) -> &ErasureCodingConfig {
        &self.config
    }

    /// Encode data into `data_shards + parity_shards` fragments.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let shard_size = self.shard_size(data.len());

        let mut shards: Vec<Vec<u8>> = (0..self.config.data_shards)
            .map(|i| {
                let start = (i * shard_size).min(data.len());
                let end = ((i + 1) * shard_size).min(data.len());
                let mut shard = data[start..end].to_vec();
                shard.resize(shard_size, 0);
                shard
            })
            .collect();
        shards.extend((0..self.config.parity_shards).map(|_| vec![0u8; shard_size]));

        self.encoder
            .encode(&mut shards)
            .map_err(|e| TesseraError::Internal(format!("Encoding failed: {}", e)))?;

        debug!(
            data_len = data.len(),
            shard_size,
            num_shards = shards.len(),
            "Encoded data into fragments"
        );

        Ok(shards)
    }

    /// Decode fragments back into the original object.
    ///
    /// `shards` has one slot per fragment index; `None` marks a missing one.
    pub fn decode(&self, shards: &mut [Option<Vec<u8>>], original_size: usize) -> Result<Vec<u8>> {
        self.reconstruct_all(shards)?;

        let mut result = Vec::with_capacity(original_size);
        for shard in shards.iter().take(self.config.data_shards) {
            match shard {
                Some(data) => result.extend_from_slice(data),
                None => return Err(TesseraError::Internal("Reconstruction incomplete".into())),
            }
        }
        result.truncate(original_size);
        Ok(result)
    }

    /// Regenerate the fragment at `index` from the other fragments present.
    pub fn reconstruct_fragment(
        &self,
        shards: &mut [Option<Vec<u8>>],
        index: usize,
    ) -> Result<Vec<u8>> {
        if index >= self.config.total_shards() {
            return Err(TesseraError::InvalidArgument(format!(
                "fragment index {} out of range for {}+{}",
                index, self.config.data_shards, self.config.parity_shards
            )));
        }
        shards[index] = None;
        self.reconstruct_all(shards)?;
        shards[index]
            .take()
            .ok_or_else(|| TesseraError::Internal("Reconstruction incomplete".into()))
    }

    fn reconstruct_all(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        if shards.len() != self.config.total_shards() {
            return Err(TesseraError::Internal(format!(
                "Expected {} fragments, got {}",
                self.config.total_shards(),
                shards.len()
            )));
        }
        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.config.data_shards {
            return Err(TesseraError::InsufficientFragments {
                available,
                required: self.config.data_shards,
            });
        }
        self.encoder
            .reconstruct(shards)
            .map_err(|e| TesseraError::Internal(format!("Reconstruction failed: {}", e)))
    }

    /// Check that a complete fragment set is consistent.
    pub fn verify(&self, shards: &[Vec<u8>]) -> Result<bool> {
        self.encoder
            .verify(shards)
            .map_err(|e| TesseraError::Internal(format!("Verification failed: {}", e)))
    }

    /// Fragment length for an object of `data_len` bytes.
    pub fn shard_size(&self, data_len: usize) -> usize {
        data_len.div_ceil(self.config.data_shards).max(1)
    }

    /// Total bytes stored across all fragments.
    pub fn storage_size(&self, data_len: usize) -> usize {
        self.shard_size(data_len) * self.config.total_shards()
    }

    /// Encode an object into fragment archives, one per fragment index.
    pub fn encode_archives(
        &self,
        name: &str,
        timestamp: DateTime<Utc>,
        data: &[u8],
    ) -> Result<Vec<(ObjectMeta, Vec<u8>)>> {
        Ok(self
            .encode(data)?
            .into_iter()
            .enumerate()
            .map(|(index, fragment)| {
                let meta =
                    ObjectMeta::for_fragment(name, timestamp, &fragment, index, data.len() as u64);
                (meta, fragment)
            })
            .collect())
    }
}
