// Test fixtures and data generators for integration tests

use chrono::{DateTime, TimeZone, Utc};
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera::{HashPathSalt, ObjectHash, ObjectMeta, PartitionId};

/// Deterministic random data generator for reproducible tests
pub struct TestDataGenerator {
    rng: StdRng,
}

impl TestDataGenerator {
    /// Creates a new generator with a fixed seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Generates random bytes of specified length
    pub fn random_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        self.rng.fill(&mut bytes[..]);
        bytes
    }

    /// Generates a random object name
    pub fn random_name(&mut self) -> String {
        let name: String = (&mut self.rng)
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        format!("obj-{}", name)
    }

    pub fn gen_range(&mut self, range: std::ops::Range<u32>) -> u32 {
        self.rng.gen_range(range)
    }
}

impl Default for TestDataGenerator {
    fn default() -> Self {
        Self::new(42)
    }
}

/// Fixed timestamp `secs` seconds after a base instant.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn object_hash(name: &str) -> ObjectHash {
    ObjectHash::compute(&HashPathSalt::new("", "test"), "AUTH_test", Some("photos"), Some(name))
}

/// Hash of an object name that lands in `partition` for a ring of `partition_power`.
pub fn hash_in_partition(partition: PartitionId, partition_power: u32, seed: &str) -> (String, ObjectHash) {
    for i in 0.. {
        let name = format!("{}-{}", seed, i);
        let hash = object_hash(&name);
        if hash.prefix_u32() >> (32 - partition_power) == partition {
            return (name, hash);
        }
    }
    unreachable!()
}

pub fn meta(name: &str, secs: i64, data: &[u8]) -> ObjectMeta {
    ObjectMeta::for_data(name, ts(secs), data)
}
